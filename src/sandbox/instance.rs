//! Interpreter instance lifecycle: creation, script loading, dispatch.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use mlua::{Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, VmState};
use tracing::{debug, warn};

use crate::error::{classify_exec_error, ExecInterrupt, Result, SandboxError};
use crate::sandbox::bridge;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::{ActiveRequest, CancelToken, RequestContext};

/// A script compiled into an instance, retained in the Lua registry.
struct LoadedScript {
    key: RegistryKey,
    name: String,
}

/// One isolated interpreter instance with the native bridge registered.
///
/// The unit of script isolation and pooling. Each instance owns its own
/// `mlua::Lua` state; nothing is process-global, so instances never
/// interfere with each other. Dispatch requires `&mut self`, which rules
/// out two requests executing concurrently on one instance, and dropping
/// the instance releases the interpreter and its bridge bindings, so use
/// after destruction is unrepresentable.
pub struct LuaSandbox {
    config: SandboxConfig,
    lua: Lua,
    script: Option<LoadedScript>,
}

impl LuaSandbox {
    /// Create an instance with the given configuration.
    ///
    /// Scripts get the table, string, math, and coroutine standard
    /// libraries; io, os, package, and debug stay out of reach.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;

        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(|e| {
            SandboxError::Init(anyhow::anyhow!("failed to create interpreter: {e}"))
        })?;

        if config.max_memory > 0 {
            lua.set_memory_limit(config.max_memory).map_err(|e| {
                SandboxError::Init(anyhow::anyhow!("failed to set memory limit: {e}"))
            })?;
        }

        bridge::register(&lua)
            .map_err(|e| SandboxError::Init(anyhow::anyhow!("failed to register bridge: {e}")))?;

        debug!(max_memory = config.max_memory, "interpreter instance created");
        Ok(Self {
            config,
            lua,
            script: None,
        })
    }

    /// Load and compile the script at `path`, replacing any prior script.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::ScriptNotFound(path.display().to_string())
            } else {
                SandboxError::Io(e)
            }
        })?;
        self.load_source(&source, &path.display().to_string())
    }

    /// Compile a script from in-memory source, replacing any prior script.
    ///
    /// The chunk is compiled but not executed; it runs once per request.
    /// On a compile failure the previously loaded script is preserved and
    /// remains runnable (preserve-on-failure reload policy).
    pub fn load_source(&mut self, source: &str, name: &str) -> Result<()> {
        let entry = self
            .lua
            .load(source)
            .set_name(name)
            .into_function()
            .map_err(|e| match e {
                mlua::Error::SyntaxError {
                    message,
                    incomplete_input,
                } => SandboxError::Syntax {
                    message,
                    incomplete: incomplete_input,
                },
                mlua::Error::MemoryError(message) => SandboxError::MemoryLimitExceeded(message),
                other => SandboxError::Syntax {
                    message: other.to_string(),
                    incomplete: false,
                },
            })?;

        let key = self
            .lua
            .create_registry_value(entry)
            .map_err(|e| SandboxError::Init(anyhow::anyhow!("failed to retain script: {e}")))?;

        if let Some(previous) = self.script.replace(LoadedScript {
            key,
            name: name.to_string(),
        }) {
            debug!(previous = %previous.name, current = %name, "replaced loaded script");
            drop(previous);
            self.lua.expire_registry_values();
        } else {
            debug!(script = %name, "script loaded");
        }
        Ok(())
    }

    /// Name of the currently loaded script, if any.
    pub fn script_name(&self) -> Option<&str> {
        self.script.as_ref().map(|s| s.name.as_str())
    }

    /// Whether a script is loaded and runnable.
    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    /// Execute the loaded script against one request.
    ///
    /// Runs synchronously on the calling thread, bounded by the configured
    /// wall-clock deadline, the optional step budget, and the context's
    /// cancellation token, each checked every `hook_interval` instructions.
    /// Bytes the script writes through the bridge land in the context's
    /// output sink; on a fault, bytes written before the fault are kept.
    /// Faults and budget aborts terminate only this request; the instance
    /// stays usable.
    pub fn process_request(&mut self, ctx: &mut RequestContext) -> Result<()> {
        let script = self.script.as_ref().ok_or(SandboxError::NoScriptLoaded)?;
        let entry: Function = self.lua.registry_value(&script.key).map_err(|e| {
            SandboxError::Init(anyhow::anyhow!("loaded script missing from registry: {e}"))
        })?;

        self.lua.set_app_data(ActiveRequest::take_from(
            ctx,
            self.config.max_response_size,
        ));
        self.arm_budget_hook(ctx.cancel_token());

        let call_result = entry.call::<()>(());

        self.lua.remove_hook();
        match self.lua.remove_app_data::<ActiveRequest>() {
            Some(active) => active.restore(ctx),
            // the slot is private to this crate, so nothing can empty it mid-call
            None => {
                return Err(SandboxError::Init(anyhow::anyhow!(
                    "active request slot emptied during dispatch"
                )))
            }
        }

        call_result.map_err(|e| {
            let err = classify_exec_error(e);
            warn!(script = %script.name, error = %err, "request dispatch faulted");
            err
        })
    }

    /// Tear down the instance, releasing the interpreter and its bridge
    /// bindings. Dropping does the same; this form reads better at call
    /// sites that destroy deliberately.
    pub fn close(self) {
        debug!(script = ?self.script_name(), "interpreter instance closed");
    }

    /// Arm the per-dispatch budget hook. Cancellation, deadline, and step
    /// budget are all observed at instruction-count checkpoints.
    fn arm_budget_hook(&self, cancel: CancelToken) {
        let timeout = self.config.exec_timeout;
        let deadline = Instant::now() + timeout;
        let interval = self.config.hook_interval;
        let budget = self
            .config
            .step_budget
            .map(|steps| (steps, steps.div_ceil(u64::from(interval)).max(1)));
        let checkpoints = AtomicU64::new(0);

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(interval),
            move |_lua, _debug| {
                if cancel.is_cancelled() {
                    return Err(mlua::Error::external(ExecInterrupt::Cancelled));
                }
                if Instant::now() >= deadline {
                    return Err(mlua::Error::external(ExecInterrupt::Deadline(timeout)));
                }
                if let Some((steps, max_checkpoints)) = budget {
                    let fired = checkpoints.fetch_add(1, Ordering::Relaxed) + 1;
                    if fired >= max_checkpoints {
                        return Err(mlua::Error::external(ExecInterrupt::StepBudget(steps)));
                    }
                }
                Ok(VmState::Continue)
            },
        );
    }
}
