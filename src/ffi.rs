//! C ABI for foreign hosts.
//!
//! Mirrors the boundary the original service consumed: `init` returns an
//! opaque handle (null on failure), `load` and `process_request` return a
//! distinct status code per failure kind, and `uninit` destroys the handle.
//! The handle wraps a [`SandboxPool`], so a multithreaded host may call
//! `sandbox_process_request` from any number of worker threads.
//!
//! # Safety contract
//!
//! - A handle returned by `sandbox_init*` must be destroyed exactly once
//!   with `sandbox_uninit` and never used afterwards.
//! - A request handle is single-use: create, process, read the response,
//!   free. It must not be passed to `sandbox_process_request` from two
//!   threads at once. `sandbox_request_cancel` is the one call that may be
//!   made from another thread while the request is in flight.
//! - Pointers returned by `sandbox_request_response_data` are valid until
//!   the request handle is freed.
//!
//! Panics never unwind across this boundary; they surface as
//! [`SANDBOX_ERR_PANIC`] (or a null handle from `init`).

use std::ffi::{c_char, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use tracing::error;

use crate::error::{BridgeFault, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::{CancelToken, RequestContext};
use crate::sandbox::pool::SandboxPool;

/// Opaque sandbox handle: a pool of interpreter instances.
pub struct SandboxHandle {
    pool: SandboxPool,
}

/// Opaque request handle: one request context plus its cancel token.
pub struct RequestHandle {
    ctx: RequestContext,
    cancel: CancelToken,
}

/// The call completed.
pub const SANDBOX_OK: i32 = 0;
/// A handle argument was null or otherwise unusable.
pub const SANDBOX_ERR_INVALID_HANDLE: i32 = -1;
/// A non-handle argument was null or not valid UTF-8.
pub const SANDBOX_ERR_INVALID_ARGUMENT: i32 = -2;
/// Interpreter construction failed.
pub const SANDBOX_ERR_INIT: i32 = -3;
/// The script file was not found.
pub const SANDBOX_ERR_SCRIPT_NOT_FOUND: i32 = -4;
/// The script failed to compile.
pub const SANDBOX_ERR_SCRIPT_SYNTAX: i32 = -5;
/// The script file could not be read.
pub const SANDBOX_ERR_SCRIPT_IO: i32 = -6;
/// `process_request` was called with no script loaded.
pub const SANDBOX_ERR_NO_SCRIPT: i32 = -7;
/// The script raised a runtime error.
pub const SANDBOX_ERR_RUNTIME_FAULT: i32 = -8;
/// Execution exceeded its time or instruction budget.
pub const SANDBOX_ERR_TIMEOUT: i32 = -9;
/// The host cancelled the request.
pub const SANDBOX_ERR_CANCELLED: i32 = -10;
/// The script exceeded the instance memory ceiling.
pub const SANDBOX_ERR_MEMORY: i32 = -11;
/// The script wrote past the response size limit.
pub const SANDBOX_ERR_RESPONSE_TOO_LARGE: i32 = -12;
/// A bridge function rejected its arguments.
pub const SANDBOX_ERR_BRIDGE: i32 = -13;
/// The configuration file was rejected.
pub const SANDBOX_ERR_CONFIG: i32 = -14;
/// A panic was caught at the boundary.
pub const SANDBOX_ERR_PANIC: i32 = -15;

fn status_of(err: &SandboxError) -> i32 {
    match err {
        SandboxError::Init(_) => SANDBOX_ERR_INIT,
        SandboxError::ScriptNotFound(_) => SANDBOX_ERR_SCRIPT_NOT_FOUND,
        SandboxError::Io(_) => SANDBOX_ERR_SCRIPT_IO,
        SandboxError::Syntax { .. } => SANDBOX_ERR_SCRIPT_SYNTAX,
        SandboxError::NoScriptLoaded => SANDBOX_ERR_NO_SCRIPT,
        SandboxError::RuntimeFault { .. } => SANDBOX_ERR_RUNTIME_FAULT,
        SandboxError::Timeout(_) | SandboxError::StepBudgetExceeded { .. } => SANDBOX_ERR_TIMEOUT,
        SandboxError::Cancelled => SANDBOX_ERR_CANCELLED,
        SandboxError::MemoryLimitExceeded(_) => SANDBOX_ERR_MEMORY,
        SandboxError::Bridge(BridgeFault::ResponseTooLarge { .. }) => {
            SANDBOX_ERR_RESPONSE_TOO_LARGE
        }
        SandboxError::Bridge(_) => SANDBOX_ERR_BRIDGE,
        SandboxError::Config(_) => SANDBOX_ERR_CONFIG,
    }
}

fn init_with(config: SandboxConfig) -> *mut SandboxHandle {
    match catch_unwind(AssertUnwindSafe(|| SandboxPool::new(config))) {
        Ok(Ok(pool)) => Box::into_raw(Box::new(SandboxHandle { pool })),
        Ok(Err(e)) => {
            error!(error = %e, "sandbox init failed");
            ptr::null_mut()
        }
        Err(_) => {
            error!("sandbox init panicked");
            ptr::null_mut()
        }
    }
}

/// Create a sandbox with the default configuration.
///
/// Returns null if the interpreter pool cannot be constructed.
#[no_mangle]
pub extern "C" fn sandbox_init() -> *mut SandboxHandle {
    init_with(SandboxConfig::default())
}

/// Create a sandbox from a TOML configuration file.
///
/// If the configuration names a `script_path`, the script is loaded before
/// the handle is returned. Returns null on a rejected configuration or a
/// failed load.
///
/// # Safety
///
/// `config_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sandbox_init_with_config(
    config_path: *const c_char,
) -> *mut SandboxHandle {
    if config_path.is_null() {
        return ptr::null_mut();
    }
    let Ok(path) = CStr::from_ptr(config_path).to_str() else {
        return ptr::null_mut();
    };
    match SandboxConfig::from_toml_file(path) {
        Ok(config) => init_with(config),
        Err(e) => {
            error!(error = %e, "sandbox configuration rejected");
            ptr::null_mut()
        }
    }
}

/// Load the script at `script_path` into every pooled instance.
///
/// # Safety
///
/// `handle` must be a live handle from `sandbox_init*`; `script_path` must
/// be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sandbox_load(
    handle: *mut SandboxHandle,
    script_path: *const c_char,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return SANDBOX_ERR_INVALID_HANDLE;
    };
    if script_path.is_null() {
        return SANDBOX_ERR_INVALID_ARGUMENT;
    }
    let Ok(path) = CStr::from_ptr(script_path).to_str() else {
        return SANDBOX_ERR_INVALID_ARGUMENT;
    };
    match catch_unwind(AssertUnwindSafe(|| handle.pool.load_file(path))) {
        Ok(Ok(())) => SANDBOX_OK,
        Ok(Err(e)) => status_of(&e),
        Err(_) => SANDBOX_ERR_PANIC,
    }
}

/// Dispatch one request through the loaded script.
///
/// Blocks the calling thread for the duration of the dispatch (bounded by
/// the configured budgets). On return, the response bytes are readable via
/// `sandbox_request_response_data`, including partial output on a fault.
///
/// # Safety
///
/// `handle` must be a live handle from `sandbox_init*`; `request` must be a
/// live handle from `sandbox_request_new` not concurrently in use by
/// another call (other than `sandbox_request_cancel`).
#[no_mangle]
pub unsafe extern "C" fn sandbox_process_request(
    handle: *mut SandboxHandle,
    request: *mut RequestHandle,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return SANDBOX_ERR_INVALID_HANDLE;
    };
    let Some(request) = request.as_mut() else {
        return SANDBOX_ERR_INVALID_HANDLE;
    };
    match catch_unwind(AssertUnwindSafe(|| {
        handle.pool.process_blocking(&mut request.ctx)
    })) {
        Ok(Ok(())) => SANDBOX_OK,
        Ok(Err(e)) => status_of(&e),
        Err(_) => SANDBOX_ERR_PANIC,
    }
}

/// Destroy a sandbox handle. Safe to call with null; must not be called
/// twice for the same handle.
///
/// # Safety
///
/// `handle` must be null or a live handle from `sandbox_init*`.
#[no_mangle]
pub unsafe extern "C" fn sandbox_uninit(handle: *mut SandboxHandle) {
    if handle.is_null() {
        return;
    }
    drop(Box::from_raw(handle));
}

/// Create a request handle carrying a path and an optional body.
///
/// Returns null if `path` is null or not valid UTF-8. A null `body` with
/// nonzero `body_len` is rejected.
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string; `body` must be
/// null or valid for reads of `body_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn sandbox_request_new(
    path: *const c_char,
    body: *const u8,
    body_len: usize,
) -> *mut RequestHandle {
    if path.is_null() {
        return ptr::null_mut();
    }
    let Ok(path) = CStr::from_ptr(path).to_str() else {
        return ptr::null_mut();
    };
    let body = if body.is_null() {
        if body_len != 0 {
            return ptr::null_mut();
        }
        Vec::new()
    } else {
        std::slice::from_raw_parts(body, body_len).to_vec()
    };
    let ctx = RequestContext::new(path, body);
    let cancel = ctx.cancel_token();
    Box::into_raw(Box::new(RequestHandle { ctx, cancel }))
}

/// Request cancellation of an in-flight dispatch using this request.
///
/// May be called from any thread; the dispatch aborts at its next budget
/// checkpoint. Safe to call with null.
///
/// # Safety
///
/// `request` must be null or a live handle from `sandbox_request_new`.
#[no_mangle]
pub unsafe extern "C" fn sandbox_request_cancel(request: *const RequestHandle) {
    if let Some(request) = request.as_ref() {
        request.cancel.cancel();
    }
}

/// Read the response bytes written by the script.
///
/// Writes the byte count to `out_len` (when non-null) and returns a pointer
/// valid until the request handle is freed. Returns null for a null handle.
///
/// # Safety
///
/// `request` must be null or a live handle not concurrently being processed;
/// `out_len` must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn sandbox_request_response_data(
    request: *const RequestHandle,
    out_len: *mut usize,
) -> *const u8 {
    let Some(request) = request.as_ref() else {
        if !out_len.is_null() {
            *out_len = 0;
        }
        return ptr::null();
    };
    let output = request.ctx.output();
    if !out_len.is_null() {
        *out_len = output.len();
    }
    output.as_ptr()
}

/// Destroy a request handle. Safe to call with null; must not be called
/// twice for the same handle.
///
/// # Safety
///
/// `request` must be null or a live handle from `sandbox_request_new`.
#[no_mangle]
pub unsafe extern "C" fn sandbox_request_free(request: *mut RequestHandle) {
    if request.is_null() {
        return;
    }
    drop(Box::from_raw(request));
}
