//! Error types for the Lua request sandbox.

use thiserror::Error;

/// Faults raised by a native bridge function during script execution.
///
/// These abort the current request with a fault status; they never crash
/// the host or corrupt the interpreter instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeFault {
    /// A bridge function was invoked with no request installed on the
    /// interpreter. Scripts only run during a dispatch, so this is the
    /// defined behavior for the boundary rather than a reachable state.
    #[error("no request is active on this interpreter")]
    NoActiveRequest,

    /// A bridge function was called with an argument it rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write would push the output sink past the configured maximum.
    /// Nothing is appended; output written so far remains intact.
    #[error(
        "response too large: {written} bytes written, {requested} more requested, limit {limit}"
    )]
    ResponseTooLarge {
        /// Bytes already in the output sink.
        written: usize,
        /// Bytes the script attempted to append.
        requested: usize,
        /// Configured maximum response size.
        limit: usize,
    },
}

/// Errors that can occur while hosting sandboxed scripts.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Failed to construct the interpreter state or register the bridge.
    #[error("failed to initialize interpreter: {0}")]
    Init(#[source] anyhow::Error),

    /// The script file was not found at the given path.
    #[error("script not found at: {0}")]
    ScriptNotFound(String),

    /// I/O error while reading a script file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The script failed to compile.
    #[error("script syntax error: {message}")]
    Syntax {
        /// The compiler's error message.
        message: String,
        /// Whether the source looked truncated rather than malformed.
        incomplete: bool,
    },

    /// `process_request` was called before any script was loaded.
    #[error("no script loaded")]
    NoScriptLoaded,

    /// The script raised an error during execution.
    #[error("script runtime fault: {message}")]
    RuntimeFault {
        /// The error message, without location prefix or traceback.
        message: String,
        /// The chunk name the fault was reported in, if present.
        chunk: Option<String>,
        /// The line number the fault was reported at, if present.
        line: Option<u32>,
    },

    /// Execution exceeded the wall-clock deadline.
    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Execution exceeded the configured instruction budget.
    #[error("execution exceeded the step budget of {budget} instructions")]
    StepBudgetExceeded {
        /// The configured budget.
        budget: u64,
    },

    /// The host cancelled the request mid-execution.
    #[error("execution cancelled by the host")]
    Cancelled,

    /// A script allocation pushed the interpreter past its memory ceiling.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// A native bridge function faulted.
    #[error(transparent)]
    Bridge(#[from] BridgeFault),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Check if this error is a budget abort (deadline or step budget).
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout(_) | SandboxError::StepBudgetExceeded { .. }
        )
    }

    /// Check if this error is a script runtime fault.
    pub fn is_runtime_fault(&self) -> bool {
        matches!(self, SandboxError::RuntimeFault { .. })
    }

    /// Check if this error is a load failure (missing, unreadable, or
    /// uncompilable script).
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            SandboxError::ScriptNotFound(_) | SandboxError::Io(_) | SandboxError::Syntax { .. }
        )
    }

    /// Check if this error is a native bridge fault.
    pub fn is_bridge_fault(&self) -> bool {
        matches!(self, SandboxError::Bridge(_))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Reason a dispatch was aborted at a budget checkpoint.
///
/// Raised out of the instruction hook as an external Lua error and recovered
/// by [`classify_exec_error`] once the call unwinds.
#[derive(Error, Debug, Clone)]
pub(crate) enum ExecInterrupt {
    #[error("execution deadline of {0:?} passed")]
    Deadline(std::time::Duration),
    #[error("step budget of {0} instructions exhausted")]
    StepBudget(u64),
    #[error("cancelled by host")]
    Cancelled,
}

/// Map an error escaping `Function::call` to the sandbox taxonomy.
///
/// Budget interrupts and bridge faults travel through the interpreter as
/// external errors wrapped in callback errors; anything else is a fault
/// raised by the script itself.
pub(crate) fn classify_exec_error(err: mlua::Error) -> SandboxError {
    if let Some(interrupt) = find_external::<ExecInterrupt>(&err) {
        return match interrupt {
            ExecInterrupt::Deadline(limit) => SandboxError::Timeout(*limit),
            ExecInterrupt::StepBudget(budget) => SandboxError::StepBudgetExceeded {
                budget: *budget,
            },
            ExecInterrupt::Cancelled => SandboxError::Cancelled,
        };
    }

    if let Some(fault) = find_external::<BridgeFault>(&err) {
        return SandboxError::Bridge(fault.clone());
    }

    if let Some(message) = find_memory_error(&err) {
        return SandboxError::MemoryLimitExceeded(message);
    }

    if let Some(message) = find_bad_argument(&err) {
        return SandboxError::Bridge(BridgeFault::InvalidArgument(message));
    }

    parse_lua_fault(&err.to_string())
}

/// Walk the callback-error chain looking for an external error of type `T`.
fn find_external<T: std::error::Error + 'static>(err: &mlua::Error) -> Option<&T> {
    match err {
        mlua::Error::CallbackError { cause, .. } => find_external(cause),
        mlua::Error::WithContext { cause, .. } => find_external(cause),
        mlua::Error::ExternalError(inner) => (&**inner).downcast_ref::<T>(),
        _ => None,
    }
}

fn find_memory_error(err: &mlua::Error) -> Option<String> {
    match err {
        mlua::Error::MemoryError(message) => Some(message.clone()),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            find_memory_error(cause)
        }
        _ => None,
    }
}

fn find_bad_argument(err: &mlua::Error) -> Option<String> {
    match err {
        mlua::Error::BadArgument { .. } | mlua::Error::FromLuaConversionError { .. } => {
            Some(err.to_string())
        }
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            find_bad_argument(cause)
        }
        _ => None,
    }
}

/// Parse a Lua error string into a [`SandboxError::RuntimeFault`].
///
/// Lua prefixes runtime errors with the chunk name and line, either as
/// `[string "name"]:3: message` for in-memory chunks or `name:3: message`
/// for named ones. Tracebacks appended after the first line are dropped.
pub(crate) fn parse_lua_fault(raw: &str) -> SandboxError {
    let trimmed = raw.trim();
    let text = trimmed.strip_prefix("runtime error: ").unwrap_or(trimmed);
    let first_line = text.lines().next().unwrap_or_default();

    if let Some(rest) = first_line.strip_prefix("[string \"") {
        if let Some((name, tail)) = rest.split_once("\"]:") {
            let (line, message) = split_line_prefix(tail);
            return SandboxError::RuntimeFault {
                message: message.to_string(),
                chunk: Some(name.to_string()),
                line,
            };
        }
    }

    if let Some((chunk, line, message)) = parse_named_location(first_line) {
        return SandboxError::RuntimeFault {
            message: message.to_string(),
            chunk: Some(chunk),
            line: Some(line),
        };
    }

    SandboxError::RuntimeFault {
        message: first_line.to_string(),
        chunk: None,
        line: None,
    }
}

/// Split a `"3: message"` tail into its line number and message.
fn split_line_prefix(tail: &str) -> (Option<u32>, &str) {
    if let Some((digits, message)) = tail.split_once(':') {
        if let Ok(line) = digits.trim().parse::<u32>() {
            return (Some(line), message.trim_start());
        }
    }
    (None, tail)
}

/// Find a `name:line:` prefix in an error line, scanning past colons that
/// are part of the chunk name itself.
fn parse_named_location(line: &str) -> Option<(String, u32, &str)> {
    let mut search_from = 0;
    while let Some(pos) = line[search_from..].find(':') {
        let colon = search_from + pos;
        let after = &line[colon + 1..];
        if let Some((digits, message)) = after.split_once(':') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(number) = digits.parse::<u32>() {
                    return Some((line[..colon].to_string(), number, message.trim_start()));
                }
            }
        }
        search_from = colon + 1;
    }
    None
}
