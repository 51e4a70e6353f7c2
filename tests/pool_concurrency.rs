//! Pooled dispatch under concurrency.
//!
//! Verifies the checkout/checkin discipline: every concurrent request
//! observes only its own context, and a hot reload never tears a response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lua_http_sandbox_rs::prelude::*;

fn pool_config(size: usize) -> SandboxConfig {
    SandboxConfig::builder()
        .pool_size(size)
        .exec_timeout(Duration::from_secs(2))
        .build()
}

const ECHO_WITH_BODY: &str = r#"
write_data(get_uri_path())
write_data(" ")
write_data(read_body_data())
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_observe_own_context() {
    let pool = SandboxPool::new(pool_config(2)).unwrap();
    pool.load_source(ECHO_WITH_BODY, "echo").unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let path = format!("/req/{i}");
            let body = format!("body-{i}");
            let ctx = pool
                .process(RequestContext::new(path.clone(), body.clone().into_bytes()))
                .await
                .unwrap();
            assert_eq!(ctx.output(), format!("{path} {body}").as_bytes());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_async_dispatch_times_out_runaway_script() {
    let config = SandboxConfig::builder()
        .pool_size(1)
        .exec_timeout(Duration::from_millis(50))
        .hook_interval(100)
        .build();
    let pool = SandboxPool::new(config).unwrap();
    pool.load_source("while true do end", "spin").unwrap();

    let err = pool
        .process(RequestContext::new("/x", Vec::new()))
        .await
        .unwrap_err();
    assert!(err.is_budget_exceeded());

    // the pooled instance came back and serves the next request
    pool.load_source("write_data('ok')", "good").unwrap();
    let ctx = pool
        .process(RequestContext::new("/x", Vec::new()))
        .await
        .unwrap();
    assert_eq!(ctx.output(), b"ok");
}

#[test]
fn test_reload_during_traffic_serves_old_or_new() {
    let pool = SandboxPool::new(pool_config(2)).unwrap();
    pool.load_source("write_data('one')", "handler").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut outputs = Vec::new();
                while !stop.load(Ordering::Relaxed) {
                    let mut ctx = RequestContext::new("/x", Vec::new());
                    pool.process_blocking(&mut ctx).unwrap();
                    outputs.push(ctx.take_output());
                }
                outputs
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    pool.load_source("write_data('two')", "handler").unwrap();
    stop.store(true, Ordering::Relaxed);

    // responses produced while the reload raced traffic are whole: either
    // entirely the old script's output or entirely the new one's
    for worker in workers {
        for output in worker.join().unwrap() {
            assert!(
                output == b"one" || output == b"two",
                "torn response: {:?}",
                output
            );
        }
    }

    // once the rollout has returned, every instance serves the new script
    for _ in 0..pool.size() {
        let mut ctx = RequestContext::new("/x", Vec::new());
        pool.process_blocking(&mut ctx).unwrap();
        assert_eq!(ctx.output(), b"two");
    }
}

#[test]
fn test_pool_requires_load_before_dispatch() {
    let pool = SandboxPool::new(pool_config(2)).unwrap();

    let mut ctx = RequestContext::new("/x", Vec::new());
    let err = pool.process_blocking(&mut ctx).unwrap_err();
    assert!(matches!(err, SandboxError::NoScriptLoaded));
}
