//! Concurrent dispatch through a pooled sandbox.
//!
//! This example demonstrates how a service processes many requests at once:
//! instances are checked out of the pool one per in-flight request, so each
//! request observes only its own context.
//!
//! Run with: cargo run --example pooled_requests

use std::time::{Duration, Instant};

use lua_http_sandbox_rs::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Pooled Dispatch Example ===\n");

    let config = SandboxConfig::builder()
        .pool_size(4)
        .exec_timeout(Duration::from_secs(1))
        .build();
    let pool = SandboxPool::new(config)?;
    pool.load_file(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/echo.lua"))?;
    println!("Loaded echo handler into {} instances\n", pool.size());

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..16 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let ctx = pool
                .process(RequestContext::new(
                    format!("/req/{i}"),
                    format!("body-{i}").into_bytes(),
                ))
                .await?;
            Ok::<_, SandboxError>(String::from_utf8_lossy(ctx.output()).into_owned())
        }));
    }

    println!("Responses:");
    println!("{:-<40}", "");
    for handle in handles {
        match handle.await {
            Ok(Ok(output)) => println!("{output}"),
            Ok(Err(e)) => println!("request failed: {e}"),
            Err(e) => println!("join error: {e}"),
        }
    }
    println!("{:-<40}", "");
    println!("\n16 requests in {:?}", start.elapsed());

    Ok(())
}
