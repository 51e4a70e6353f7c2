//! Per-request data exchanged between host and sandbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BridgeFault;

/// Cooperative cancellation flag for an in-flight request.
///
/// The host keeps a clone and sets it when the request should be abandoned
/// (e.g. the client disconnected). The interpreter observes it at the next
/// budget checkpoint.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the associated dispatch.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Host-owned view of one request, valid for a single dispatch.
///
/// Carries the request path and body in, and the response bytes out. The
/// sandbox never sees this value directly: the bridge copies plain strings
/// and bytes across the boundary, and the interpreter's active-request slot
/// is emptied before `process_request` returns, so no script can retain a
/// reference past the call that supplied it.
#[derive(Debug, Default)]
pub struct RequestContext {
    path: String,
    body: Vec<u8>,
    output: Vec<u8>,
    cancel: CancelToken,
}

impl RequestContext {
    /// Create a context for a request with the given path and body.
    pub fn new(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            body: body.into(),
            output: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A clone of this request's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The response bytes written so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Take ownership of the response bytes, leaving the sink empty.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

/// The request installed on an interpreter for the duration of one dispatch.
///
/// Holds the context's buffers by value (moved out of the `RequestContext`
/// and moved back when the dispatch ends) so the bridge functions operate on
/// owned data with no lifetime tied to the host's call frame.
#[derive(Debug)]
pub(crate) struct ActiveRequest {
    path: String,
    body: Vec<u8>,
    output: Vec<u8>,
    max_response_size: usize,
}

impl ActiveRequest {
    /// Move the context's buffers into an active-request value.
    pub(crate) fn take_from(ctx: &mut RequestContext, max_response_size: usize) -> Self {
        Self {
            path: std::mem::take(&mut ctx.path),
            body: std::mem::take(&mut ctx.body),
            output: std::mem::take(&mut ctx.output),
            max_response_size,
        }
    }

    /// Move the buffers back into the host's context. Output written before
    /// a fault is preserved.
    pub(crate) fn restore(self, ctx: &mut RequestContext) {
        ctx.path = self.path;
        ctx.body = self.body;
        ctx.output = self.output;
    }

    pub(crate) fn uri_path(&self) -> &str {
        &self.path
    }

    /// A view of the body clamped to `offset`/`len`.
    ///
    /// Reads past the end yield an empty slice; negative arguments are
    /// rejected rather than clamped.
    pub(crate) fn body_chunk(
        &self,
        offset: Option<i64>,
        len: Option<i64>,
    ) -> Result<&[u8], BridgeFault> {
        let offset = match offset {
            None => 0,
            Some(o) if o < 0 => {
                return Err(BridgeFault::InvalidArgument(format!(
                    "negative body offset {o}"
                )))
            }
            Some(o) => o as usize,
        };
        let start = offset.min(self.body.len());
        let available = self.body.len() - start;
        let take = match len {
            None => available,
            Some(l) if l < 0 => {
                return Err(BridgeFault::InvalidArgument(format!(
                    "negative body length {l}"
                )))
            }
            Some(l) => (l as usize).min(available),
        };
        Ok(&self.body[start..start + take])
    }

    /// Append bytes to the output sink, enforcing the response size limit.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<usize, BridgeFault> {
        if self.output.len().saturating_add(data.len()) > self.max_response_size {
            return Err(BridgeFault::ResponseTooLarge {
                written: self.output.len(),
                requested: data.len(),
                limit: self.max_response_size,
            });
        }
        self.output.extend_from_slice(data);
        Ok(data.len())
    }
}
