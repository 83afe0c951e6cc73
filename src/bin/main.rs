use memory_filter_pipeline::{
    backend::{connector_for, BackendConfig},
    config::FilterConfig,
    filter::MemoryFilter,
};
use serde_json::{json, Value};
use std::io::BufRead;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Reads one user message per stdin line, runs it through the filter and
/// prints the rewritten request. Uses the in-process store unless
/// `MEMORY_BACKEND` is set.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let backend = if std::env::var("MEMORY_BACKEND").is_ok() {
        BackendConfig::from_env()?
    } else {
        BackendConfig::Memory
    };
    let config = FilterConfig::from_env()?;

    info!(backend = backend.label(), "Memory filter starting");

    let connector = connector_for(&backend, config.store_timeout());
    let filter = MemoryFilter::new(config, backend, connector);
    filter.on_startup().await;

    let mut session = filter.new_session();
    let mut transcript: Vec<Value> = Vec::new();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        transcript.push(json!({"role": "user", "content": line}));
        let body = json!({ "messages": transcript });

        let out = filter.inlet(&mut session, body).await;
        println!("{}", serde_json::to_string_pretty(&out)?);
        println!("pending: {:?}", session.pending());
    }

    filter.on_shutdown().await;
    println!(
        "flushes: {} stored, {} failed",
        filter.guard().flushes_completed(),
        filter.guard().flushes_failed()
    );

    Ok(())
}
