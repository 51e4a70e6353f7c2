//! Prelude module for convenient imports.

pub use crate::error::{BridgeFault, Result, SandboxError};
pub use crate::sandbox::{
    config::SandboxConfig,
    context::{CancelToken, RequestContext},
    instance::LuaSandbox,
    pool::SandboxPool,
};
