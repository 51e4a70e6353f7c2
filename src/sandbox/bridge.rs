//! Native bridge functions callable from script code.
//!
//! The bridge is the sandbox's entire capability surface: a closed set of
//! three verbs registered as globals when an instance is created. Scripts
//! cannot add native capabilities, and each verb operates only on the
//! request installed for the current dispatch. Only plain strings and byte
//! strings cross the boundary, so nothing a script can retain outlives the
//! call that supplied it.

use mlua::Lua;

use crate::error::BridgeFault;
use crate::sandbox::context::ActiveRequest;

/// The names the bridge claims in a script's global environment.
pub const BRIDGE_FUNCTIONS: [&str; 3] = ["get_uri_path", "read_body_data", "write_data"];

/// Register the bridge functions on a freshly created interpreter.
///
/// Called exactly once per instance, before any script is loaded.
pub(crate) fn register(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    // get_uri_path() -> string
    let get_uri_path = lua.create_function(|lua, ()| {
        let active = lua
            .app_data_ref::<ActiveRequest>()
            .ok_or_else(|| mlua::Error::external(BridgeFault::NoActiveRequest))?;
        Ok(active.uri_path().to_owned())
    })?;
    globals.set("get_uri_path", get_uri_path)?;

    // read_body_data([offset [, len]]) -> string
    // Offsets are zero-based; out-of-range reads are clamped, negative
    // arguments rejected. An absent body reads as the empty string.
    let read_body_data = lua.create_function(|lua, (offset, len): (Option<i64>, Option<i64>)| {
        let active = lua
            .app_data_ref::<ActiveRequest>()
            .ok_or_else(|| mlua::Error::external(BridgeFault::NoActiveRequest))?;
        let chunk = active
            .body_chunk(offset, len)
            .map_err(mlua::Error::external)?;
        lua.create_string(chunk)
    })?;
    globals.set("read_body_data", read_body_data)?;

    // write_data(bytes) -> integer
    // Appends to the output sink in call order and returns the byte count
    // written. A write past the response size limit appends nothing.
    let write_data = lua.create_function(|lua, data: mlua::String| {
        let mut active = lua
            .app_data_mut::<ActiveRequest>()
            .ok_or_else(|| mlua::Error::external(BridgeFault::NoActiveRequest))?;
        let written = active
            .write(&data.as_bytes())
            .map_err(mlua::Error::external)?;
        Ok(written)
    })?;
    globals.set("write_data", write_data)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify_exec_error, SandboxError};
    use crate::sandbox::context::RequestContext;

    #[test]
    fn test_register_installs_fixed_set() {
        let lua = Lua::new();
        register(&lua).unwrap();

        for name in BRIDGE_FUNCTIONS {
            let _: mlua::Function = lua.globals().get(name).unwrap();
        }
    }

    #[test]
    fn test_bridge_outside_dispatch_faults() {
        let lua = Lua::new();
        register(&lua).unwrap();

        let get_uri_path: mlua::Function = lua.globals().get("get_uri_path").unwrap();
        let err = get_uri_path.call::<String>(()).unwrap_err();

        assert!(matches!(
            classify_exec_error(err),
            SandboxError::Bridge(BridgeFault::NoActiveRequest)
        ));
    }

    #[test]
    fn test_write_data_respects_limit() {
        let lua = Lua::new();
        register(&lua).unwrap();

        let mut ctx = RequestContext::new("/x", Vec::new());
        lua.set_app_data(ActiveRequest::take_from(&mut ctx, 4));

        let write_data: mlua::Function = lua.globals().get("write_data").unwrap();
        assert_eq!(write_data.call::<usize>("abcd").unwrap(), 4);

        let err = write_data.call::<usize>("e").unwrap_err();
        assert!(matches!(
            classify_exec_error(err),
            SandboxError::Bridge(BridgeFault::ResponseTooLarge { .. })
        ));

        let active = lua.remove_app_data::<ActiveRequest>().unwrap();
        active.restore(&mut ctx);
        assert_eq!(ctx.output(), b"abcd");
    }

    #[test]
    fn test_read_body_data_clamps() {
        let lua = Lua::new();
        register(&lua).unwrap();

        let mut ctx = RequestContext::new("/x", b"hello".to_vec());
        lua.set_app_data(ActiveRequest::take_from(&mut ctx, 1024));

        let read_body_data: mlua::Function = lua.globals().get("read_body_data").unwrap();
        let whole: mlua::String = read_body_data.call(()).unwrap();
        assert_eq!(&*whole.as_bytes(), b"hello");

        let tail: mlua::String = read_body_data.call((3, 100)).unwrap();
        assert_eq!(&*tail.as_bytes(), b"lo");

        let err = read_body_data.call::<mlua::String>(-1).unwrap_err();
        assert!(matches!(
            classify_exec_error(err),
            SandboxError::Bridge(BridgeFault::InvalidArgument(_))
        ));
    }
}
