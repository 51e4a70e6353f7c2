//! End-to-end request processing through the public API.
//!
//! These tests exercise the host-facing contract: load-then-dispatch,
//! ordered output, protocol errors, fault containment, and budget aborts.

use std::path::PathBuf;
use std::time::Duration;

use lua_http_sandbox_rs::prelude::*;

fn test_config() -> SandboxConfig {
    SandboxConfig::builder()
        .exec_timeout(Duration::from_secs(2))
        .build()
}

fn echo_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts/echo.lua")
}

#[test]
fn test_load_file_then_echo() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox.load_file(echo_script()).unwrap();

    let mut ctx = RequestContext::new("/hello", b"ping".to_vec());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"/hello ping");
}

#[test]
fn test_empty_body_reads_as_empty_string() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox.load_file(echo_script()).unwrap();

    let mut ctx = RequestContext::new("/hello", Vec::new());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"/hello");
}

#[test]
fn test_writes_concatenate_in_call_order() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox
        .load_source(
            r#"
            write_data("first")
            write_data("-")
            write_data("second")
            "#,
            "ordered",
        )
        .unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"first-second");
}

#[test]
fn test_chunked_body_reads() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox
        .load_source(
            r#"
            write_data(read_body_data(0, 5))
            write_data("|")
            write_data(read_body_data(6))
            write_data("|")
            -- reads past the end clamp to empty
            write_data(read_body_data(100, 10))
            "#,
            "chunks",
        )
        .unwrap();

    let mut ctx = RequestContext::new("/x", b"hello world".to_vec());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"hello|world|");
}

#[test]
fn test_negative_body_offset_is_bridge_fault() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox
        .load_source("write_data(read_body_data(-1))", "bad")
        .unwrap();

    let mut ctx = RequestContext::new("/x", b"body".to_vec());
    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::Bridge(BridgeFault::InvalidArgument(_))
    ));
}

#[test]
fn test_process_before_load_performs_no_callbacks() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();

    let mut ctx = RequestContext::new("/hello", b"ping".to_vec());
    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(matches!(err, SandboxError::NoScriptLoaded));
    assert!(ctx.output().is_empty());
    // the context is untouched and reusable after the protocol error
    assert_eq!(ctx.path(), "/hello");
    assert_eq!(ctx.body(), b"ping");
}

#[test]
fn test_fault_is_contained_and_instance_survives() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox.load_file(echo_script()).unwrap();

    // a faulting script replaces the echo handler
    sandbox
        .load_source("local x = nil + 1", "broken")
        .unwrap();
    let mut ctx = RequestContext::new("/x", Vec::new());
    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(err.is_runtime_fault());

    // reload the good handler and keep serving
    sandbox.load_file(echo_script()).unwrap();
    let mut ctx = RequestContext::new("/recovered", Vec::new());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"/recovered");
}

#[test]
fn test_step_budget_then_well_behaved_script() {
    let config = SandboxConfig::builder()
        .exec_timeout(Duration::from_secs(30))
        .step_budget(100_000)
        .build();
    let mut sandbox = LuaSandbox::new(config).unwrap();
    sandbox.load_source("while true do end", "spin").unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(err.is_budget_exceeded());

    sandbox.load_file(echo_script()).unwrap();
    let mut ctx = RequestContext::new("/still-alive", Vec::new());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"/still-alive");
}

#[test]
fn test_cancellation_from_another_thread() {
    let config = SandboxConfig::builder()
        .exec_timeout(Duration::from_secs(30))
        .hook_interval(100)
        .build();
    let mut sandbox = LuaSandbox::new(config).unwrap();
    sandbox.load_source("while true do end", "spin").unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    let token = ctx.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
    });

    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(matches!(err, SandboxError::Cancelled));
    canceller.join().unwrap();
}

#[test]
fn test_oversized_response_keeps_prior_output() {
    let config = SandboxConfig::builder().max_response_size(8).build();
    let mut sandbox = LuaSandbox::new(config).unwrap();
    sandbox
        .load_source(
            r#"
            write_data("12345")
            write_data("678910")
            "#,
            "chatty",
        )
        .unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    let err = sandbox.process_request(&mut ctx).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::Bridge(BridgeFault::ResponseTooLarge { written: 5, .. })
    ));
    assert_eq!(ctx.output(), b"12345");
}

#[test]
fn test_write_data_reports_byte_count() {
    let mut sandbox = LuaSandbox::new(test_config()).unwrap();
    sandbox
        .load_source(
            r#"
            local n = write_data("four")
            write_data(tostring(n))
            "#,
            "count",
        )
        .unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    sandbox.process_request(&mut ctx).unwrap();
    assert_eq!(ctx.output(), b"four4");
}
