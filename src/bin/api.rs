use memory_filter_pipeline::{
    api::{start_server, SessionLimits},
    backend::{connector_for, BackendConfig},
    config::FilterConfig,
    filter::MemoryFilter,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "9099".to_string())
        .parse()?;
    let pipeline_id =
        std::env::var("PIPELINE_ID").unwrap_or_else(|_| "memory_filter".to_string());

    let backend = BackendConfig::from_env()?;
    let config = FilterConfig::from_env()?;
    let limits = SessionLimits::from_env()?;

    info!("Memory Filter Pipeline - API Server");
    info!("Port: {}", api_port);
    info!(
        backend = backend.label(),
        store_cycles = config.store_cycles,
        memories_to_use = config.memories_to_use,
        async_flush = config.async_flush,
        "Filter configured"
    );

    let connector = connector_for(&backend, config.store_timeout());
    let filter = Arc::new(MemoryFilter::new(config, backend, connector));

    start_server(filter, &pipeline_id, api_port, limits).await?;

    Ok(())
}
