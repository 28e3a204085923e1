//! Proxy guard walkthrough
//!
//! Builds a guard layer for two simulated backends, drives one of them into
//! the open state, streams a few chunks through the registry, and prints the
//! health report an operator dashboard would poll.
//!
//! Run with `RUST_LOG=upstream_guard=debug cargo run --example proxy_guard`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upstream_guard::{
    BreakerError, GuardSettings, ResilienceLayer, StreamTransport, UpstreamError,
};

const SETTINGS: &str = r#"
[streams]
sweep_interval_ms = 500
idle_timeout_ms = 2000

[[backends]]
name = "chat"
base_url = "http://127.0.0.1:11434"
retry = { max_retries = 2, base_delay_ms = 50 }

[[backends]]
name = "media"
base_url = "http://127.0.0.1:7860"
breaker = { failure_threshold = 2, open_duration_ms = 1000 }
retry = { max_retries = 1, base_delay_ms = 50 }
"#;

struct ConsoleTransport {
    label: &'static str,
}

impl StreamTransport for ConsoleTransport {
    fn end(&self) {
        println!("[{}] response ended", self.label);
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,upstream_guard=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let settings = GuardSettings::from_toml_str(SETTINGS)?;
    let layer = ResilienceLayer::start(&settings)?;

    // A backend that refuses connections until it has been hit five times.
    let media = layer.backend("media").ok_or("media backend missing")?;
    let hits = AtomicU32::new(0);
    for round in 1..=4 {
        let result = media
            .call(|| {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 5 {
                        Err(UpstreamError::from_status(502, "bad gateway"))
                    } else {
                        Ok(format!("image generated for {}", media.url("/sdapi/v1/txt2img")))
                    }
                }
            })
            .await;

        match result {
            Ok(body) => println!("round {round}: {body}"),
            Err(BreakerError::Open(err)) => {
                println!("round {round}: short-circuited, retry in {:?}", err.retry_after);
                tokio::time::sleep(err.retry_after).await;
            }
            Err(err) => println!("round {round}: failed with HTTP {}", err.response_status()),
        }
    }

    // Forward a streamed completion through the registry.
    let chat = layer.backend("chat").ok_or("chat backend missing")?;
    let transport = Arc::new(ConsoleTransport { label: "chat" });
    let id = layer
        .streams()
        .register_stream(&transport, layer.streams().default_idle_timeout());
    let (tx, mut rx) = mpsc::channel(8);
    let tokens = futures::stream::iter(["Hello", ", ", "world", "!"]);
    let forwarding = layer.streams().forward(id, tokens, tx);
    while let Some(token) = rx.recv().await {
        print!("{token}");
    }
    println!();
    println!("forwarding finished: {:?}", forwarding.await?);

    // A client that stops reading is reclaimed by the idle sweep.
    let stalled = Arc::new(ConsoleTransport { label: "stalled" });
    layer
        .streams()
        .register_stream(&stalled, Duration::from_millis(1000));
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let report = layer.registry().get_health_status();
    println!("health: {} (HTTP {})", report.detail.message, report.status.http_status());
    println!("{}", serde_json::to_string_pretty(&layer.registry().get_all_stats())?);
    println!("{}", serde_json::to_string_pretty(&layer.streams().get_stats())?);
    println!("chat breaker: {:?}", chat.breaker());

    layer.shutdown().await;
    Ok(())
}
