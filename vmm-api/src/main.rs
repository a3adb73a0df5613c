use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use vmm_api::{create_app, AppState, Config};
use vmm_hypervisor::hypervisor_for;
use vmm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vmm_orchestrator::{MachineOrchestrator, SqliteMachineStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("vmm_api=debug,vmm_orchestrator=debug,vmm_hypervisor=debug,tower_http=debug")
        .init();

    info!("Starting vmm-api service...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, hypervisor={}",
        config.bind_addr,
        config.db_path.display(),
        config.hypervisor
    );

    // Backup before migrations
    if config.db_path.exists() {
        let backup_path = backup_database(&config.db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let hypervisor = hypervisor_for(&config.hypervisor, &config.state_dir)
        .map_err(|e| anyhow::anyhow!("hypervisor init failed: {e}"))?;
    info!("Hypervisor backend ready: {}", hypervisor.name());

    let store = Arc::new(SqliteMachineStore::new(pool.clone()));
    let orchestrator = Arc::new(
        MachineOrchestrator::new(store, hypervisor)
            .with_backend_timeout(Duration::from_secs(config.backend_timeout_secs)),
    );

    let app = create_app(AppState::new(orchestrator, pool));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
