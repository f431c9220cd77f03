//! Pool worker process: speaks the envelope protocol on stdin/stdout.
//!
//! Stdout carries the protocol, so all logging goes to stderr, where the
//! pool manager picks it up.

use agent_pool::config::EngineConfig;
use agent_pool::engine::create_engine;
use agent_pool::worker::WorkerRuntime;
use anyhow::Context as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let engine = create_engine(&config);
    tracing::info!(engine = engine.name(), pid = std::process::id(), "Worker starting");

    let code = match WorkerRuntime::new(engine)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
    {
        Ok(()) => {
            tracing::info!("Worker exiting");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker protocol failure");
            1
        }
    };

    // The blocking stdin read cannot be cancelled, so the runtime would wait
    // on it forever; leave without dropping it.
    std::process::exit(code);
}
