use anyhow::{Context, Result};
use bobo_backend::config::PetConfig;
use bobo_backend::runtime::BackendRuntime;
use bobo_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bobo_backend=debug")),
        )
        .init();

    let config = PetConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting Bobo backend (config via BOBO_CONFIG, bind address via BOBO_BACKEND_BIND)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
