//! # Lua request sandbox
//!
//! Hosting machinery for running per-request Lua handlers inside a network
//! service. The service hands each request to an embedded interpreter; the
//! script sees only a narrow, host-registered native API (read the request
//! path and body, write response bytes) and can neither retain request data
//! past its call nor starve the worker that dispatched it.
//!
//! The crate enforces:
//!
//! - **A closed capability surface**: exactly three bridge functions,
//!   registered at instance creation; scripts cannot add native capabilities
//! - **Non-escaping request data**: only plain strings and bytes cross the
//!   boundary, and the active-request slot is emptied before dispatch returns
//! - **Bounded execution**: wall-clock deadline, optional instruction budget,
//!   and host cancellation, all observed at instruction-count checkpoints
//! - **Bounded memory and output**: per-instance memory ceiling and a
//!   response size limit that rejects oversized writes without truncation
//! - **Fault containment**: script errors and budget aborts fail one request,
//!   never the instance or the host process
//!
//! ## Example
//!
//! ```rust
//! use lua_http_sandbox_rs::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let mut sandbox = LuaSandbox::new(SandboxConfig::default())?;
//!     sandbox.load_source("write_data(get_uri_path())", "echo")?;
//!
//!     let mut ctx = RequestContext::new("/hello", Vec::new());
//!     sandbox.process_request(&mut ctx)?;
//!     assert_eq!(ctx.output(), b"/hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! An embedded Lua state must never run two requests at once, so concurrent
//! hosts check instances out of a [`SandboxPool`], one per in-flight
//! request. [`SandboxPool::process`] adds an async dispatch path that runs
//! the checkout and script on the blocking thread pool and races a watchdog.
//!
//! ## Foreign hosts
//!
//! The [`ffi`] module exports the same surface over a C ABI for services
//! written in other languages: opaque instance and request handles, with a
//! distinct status code per failure kind.

pub mod error;
pub mod ffi;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{BridgeFault, Result, SandboxError};
pub use sandbox::bridge::BRIDGE_FUNCTIONS;
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::context::{CancelToken, RequestContext};
pub use sandbox::instance::LuaSandbox;
pub use sandbox::pool::{PooledSandbox, SandboxPool};
