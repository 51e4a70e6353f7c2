//! Sandbox configuration with builder pattern and TOML loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SandboxError};

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HOOK_INTERVAL: u32 = 1_000;
const DEFAULT_MAX_MEMORY: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;
const DEFAULT_POOL_SIZE: usize = 4;

/// Configuration for the Lua request sandbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Maximum wall-clock execution time per request.
    #[serde(rename = "exec_timeout_ms", with = "duration_ms")]
    pub exec_timeout: Duration,
    /// Maximum Lua instructions per request. `None` leaves only the
    /// wall-clock deadline in force.
    pub step_budget: Option<u64>,
    /// Instruction count between budget checkpoints.
    pub hook_interval: u32,
    /// Memory ceiling per interpreter instance in bytes. Zero disables the
    /// ceiling.
    pub max_memory: usize,
    /// Maximum response bytes a script may write per request.
    pub max_response_size: usize,
    /// Number of interpreter instances in a pool.
    pub pool_size: usize,
    /// Script to load when a pool is created, if any.
    pub script_path: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            step_budget: None,
            hook_interval: DEFAULT_HOOK_INTERVAL,
            max_memory: DEFAULT_MAX_MEMORY,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            script_path: None,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Parse a configuration from a TOML document with a `[sandbox]` table.
    ///
    /// Missing fields fall back to their defaults, matching how the original
    /// host decoded per-handler config sections.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| SandboxError::Config(e.to_string()))?;
        file.sandbox.validate()?;
        Ok(file.sandbox)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations that cannot be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(SandboxError::Config("pool_size must be at least 1".into()));
        }
        if self.hook_interval == 0 {
            return Err(SandboxError::Config(
                "hook_interval must be at least 1 instruction".into(),
            ));
        }
        if self.max_response_size == 0 {
            return Err(SandboxError::Config(
                "max_response_size must be nonzero".into(),
            ));
        }
        if self.exec_timeout.is_zero() {
            return Err(SandboxError::Config("exec_timeout must be nonzero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sandbox: SandboxConfig,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    exec_timeout: Option<Duration>,
    step_budget: Option<u64>,
    hook_interval: Option<u32>,
    max_memory: Option<usize>,
    max_response_size: Option<usize>,
    pool_size: Option<usize>,
    script_path: Option<PathBuf>,
}

impl SandboxConfigBuilder {
    /// Set the wall-clock execution deadline per request.
    pub fn exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = Some(timeout);
        self
    }

    /// Set the instruction budget per request.
    pub fn step_budget(mut self, steps: u64) -> Self {
        self.step_budget = Some(steps);
        self
    }

    /// Set the instruction count between budget checkpoints.
    pub fn hook_interval(mut self, instructions: u32) -> Self {
        self.hook_interval = Some(instructions);
        self
    }

    /// Set the per-instance memory ceiling in bytes.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the maximum response size in bytes.
    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = Some(bytes);
        self
    }

    /// Set the number of pooled interpreter instances.
    pub fn pool_size(mut self, instances: usize) -> Self {
        self.pool_size = Some(instances);
        self
    }

    /// Set a script to load when a pool is created.
    pub fn script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = Some(path.into());
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            exec_timeout: self.exec_timeout.unwrap_or(default.exec_timeout),
            step_budget: self.step_budget.or(default.step_budget),
            hook_interval: self.hook_interval.unwrap_or(default.hook_interval),
            max_memory: self.max_memory.unwrap_or(default.max_memory),
            max_response_size: self.max_response_size.unwrap_or(default.max_response_size),
            pool_size: self.pool_size.unwrap_or(default.pool_size),
            script_path: self.script_path.or(default.script_path),
        }
    }
}
