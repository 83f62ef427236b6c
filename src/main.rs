use std::sync::Arc;

use pulse::config::AppConfig;
use pulse::store::EncryptedStore;
use pulse::telemetry::{HttpTransport, LogTransport, Transport};
use pulse::time::SystemClock;
use pulse::AppContext;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Pulse telemetry core booting...");

    let config = AppConfig::from_env();
    let store = Arc::new(match &config.data_dir {
        Some(dir) => EncryptedStore::open_dir(dir),
        None => EncryptedStore::in_memory(),
    });

    match config.endpoint.clone() {
        Some(endpoint) => run(store, HttpTransport::new(endpoint), &config).await,
        None => run(store, LogTransport, &config).await,
    }
}

async fn run<T: Transport>(store: Arc<EncryptedStore>, transport: T, config: &AppConfig) -> anyhow::Result<()> {
    let ctx = AppContext::bootstrap(store, transport, config, Arc::new(SystemClock), true)?;
    ctx.telemetry.start_auto_flush();

    let snapshot = ctx.telemetry.queue_snapshot();
    info!(
        queued = snapshot.size,
        oldest = ?snapshot.oldest_at,
        policies = ctx.policies.list_policies().len(),
        "Pulse active. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    ctx.telemetry.destroy();
    let outcome = ctx.telemetry.flush().await?;
    info!(?outcome, remaining = ctx.telemetry.queue_len(), "final flush complete");
    Ok(())
}
