//! Minimal end-to-end use: one instance, one script, a couple of requests.
//!
//! Run with: cargo run --example echo_request

use lua_http_sandbox_rs::prelude::*;

fn main() -> Result<()> {
    let mut sandbox = LuaSandbox::new(SandboxConfig::default())?;
    sandbox.load_file(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/echo.lua"))?;

    let requests: [(&str, &[u8]); 3] = [
        ("/hello", b""),
        ("/orders/42", br#"{"qty":3}"#),
        ("/health", b"ok"),
    ];

    for (path, body) in requests {
        let mut ctx = RequestContext::new(path, body.to_vec());
        sandbox.process_request(&mut ctx)?;
        println!("{path} -> {}", String::from_utf8_lossy(ctx.output()));
    }

    Ok(())
}
