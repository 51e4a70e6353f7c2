//! Instance pooling for concurrent request processing.
//!
//! Embedded Lua states are not safely shareable between threads, so the
//! host processes concurrent requests by checking instances out of a pool,
//! one per in-flight request. The checkout/checkin discipline guarantees an
//! instance is never checked out twice simultaneously; `PooledSandbox`
//! returns its instance when dropped.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{error, info, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::RequestContext;
use crate::sandbox::instance::LuaSandbox;

/// A pool of interpreter instances, all loaded with the same script.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: SandboxConfig,
    size: usize,
    idle: Mutex<Vec<LuaSandbox>>,
    available: Condvar,
    // serializes rollouts so two reloads cannot deadlock draining the pool
    rollout: Mutex<()>,
}

impl SandboxPool {
    /// Create a pool of `pool_size` identically configured instances.
    ///
    /// If the configuration names a `script_path`, it is loaded into every
    /// instance before the pool is returned.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;

        let size = config.pool_size;
        let mut instances = Vec::with_capacity(size);
        for _ in 0..size {
            instances.push(LuaSandbox::new(config.clone())?);
        }
        info!(size, "sandbox pool created");

        let pool = Self {
            inner: Arc::new(PoolInner {
                size,
                idle: Mutex::new(instances),
                available: Condvar::new(),
                rollout: Mutex::new(()),
                config,
            }),
        };

        if let Some(path) = pool.inner.config.script_path.clone() {
            pool.load_file(path)?;
        }
        Ok(pool)
    }

    /// Number of instances in the pool.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Block until an instance is idle and check it out.
    pub fn checkout(&self) -> PooledSandbox {
        let mut idle = self.inner.idle.lock().unwrap();
        loop {
            if let Some(instance) = idle.pop() {
                return PooledSandbox {
                    instance: Some(instance),
                    pool: Arc::clone(&self.inner),
                };
            }
            idle = self.inner.available.wait(idle).unwrap();
        }
    }

    /// Check out an instance if one is idle right now.
    pub fn try_checkout(&self) -> Option<PooledSandbox> {
        let mut idle = self.inner.idle.lock().unwrap();
        idle.pop().map(|instance| PooledSandbox {
            instance: Some(instance),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Load the script at `path` into every instance.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
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

    /// Roll a script source onto every instance.
    ///
    /// Drains the pool first so no instance is mid-request, then compiles on
    /// the first instance as a gate before touching the rest. A script
    /// rejected at the gate leaves every instance with its previous script
    /// intact (preserve-on-failure); the drained instances return to the
    /// pool when this call ends either way.
    pub fn load_source(&self, source: &str, name: &str) -> Result<()> {
        let _rollout = self.inner.rollout.lock().unwrap();

        let mut held: Vec<PooledSandbox> = Vec::with_capacity(self.size());
        for _ in 0..self.size() {
            held.push(self.checkout());
        }

        for (index, instance) in held.iter_mut().enumerate() {
            if let Err(e) = instance.load_source(source, name) {
                if index == 0 {
                    warn!(script = %name, error = %e, "script rejected at compile gate; pool keeps prior script");
                } else {
                    error!(script = %name, error = %e, instances_updated = index, "script rollout aborted midway");
                }
                return Err(e);
            }
        }

        info!(script = %name, instances = self.size(), "script rolled out to pool");
        Ok(())
    }

    /// Check out an instance and dispatch one request on the calling thread.
    pub fn process_blocking(&self, ctx: &mut RequestContext) -> Result<()> {
        let mut instance = self.checkout();
        instance.process_request(ctx)
    }

    /// Dispatch one request on the blocking thread pool, racing a watchdog.
    ///
    /// The in-interpreter deadline is the primary bound. The watchdog also
    /// covers queue wait on a saturated pool: if the whole operation
    /// overruns twice the configured deadline, the dispatch is cancelled at
    /// its next checkpoint and the request reports a timeout.
    pub async fn process(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        let pool = self.clone();
        let cancel = ctx.cancel_token();
        let timeout = self.inner.config.exec_timeout;
        let watchdog = timeout.saturating_mul(2);

        let mut task = tokio::task::spawn_blocking(move || {
            let mut instance = pool.checkout();
            instance.process_request(&mut ctx).map(|()| ctx)
        });

        tokio::select! {
            joined = &mut task => flatten(joined),
            _ = tokio::time::sleep(watchdog) => {
                cancel.cancel();
                match flatten(task.await) {
                    Err(SandboxError::Cancelled) => Err(SandboxError::Timeout(timeout)),
                    other => other,
                }
            }
        }
    }
}

fn flatten(
    joined: std::result::Result<Result<RequestContext>, tokio::task::JoinError>,
) -> Result<RequestContext> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(SandboxError::RuntimeFault {
            message: format!("dispatch worker panicked: {e}"),
            chunk: None,
            line: None,
        }),
    }
}

/// An instance checked out of a pool, returned to it on drop.
pub struct PooledSandbox {
    instance: Option<LuaSandbox>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSandbox {
    type Target = LuaSandbox;

    fn deref(&self) -> &LuaSandbox {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl DerefMut for PooledSandbox {
    fn deref_mut(&mut self) -> &mut LuaSandbox {
        self.instance.as_mut().expect("instance present until drop")
    }
}

impl Drop for PooledSandbox {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let mut idle = self.pool.idle.lock().unwrap();
            idle.push(instance);
            self.pool.available.notify_one();
        }
    }
}
