use anyhow::Result;
use devhost_api::{create_app, start_reconciler_task, ApiConfig, ClusterBackend};
use devhost_orchestrator::db::{backup_database, create_pool, run_migrations};
use devhost_orchestrator::{
    BuildExecutor, ClusterApi, DevcontainerCliExecutor, InMemoryCluster, InstanceManager,
    KubectlCluster, OrchestratorConfig,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = devhost_logging::init_subscriber();

    info!("Starting devhost-api service...");

    let config = ApiConfig::from_env();
    let orchestrator_config = OrchestratorConfig::from_env();
    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        namespace = %orchestrator_config.namespace,
        base_domain = %orchestrator_config.base_domain,
        build_concurrency = orchestrator_config.build_concurrency,
        "Configuration loaded"
    );

    let db_path = &config.db_path;
    if let Some(backup_path) = backup_database(db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let cluster: Arc<dyn ClusterApi> = match config.cluster_backend {
        ClusterBackend::Kubectl => Arc::new(KubectlCluster::new(&orchestrator_config)),
        ClusterBackend::Memory => {
            warn!("Using the in-memory cluster; no workloads will actually run");
            Arc::new(InMemoryCluster::new())
        }
    };
    let executor: Arc<dyn BuildExecutor> =
        Arc::new(DevcontainerCliExecutor::new(&orchestrator_config));

    let manager = InstanceManager::new(pool, orchestrator_config, cluster, executor);

    let report = manager.recover().await?;
    info!(
        failed = report.failed,
        compensated = report.compensated,
        resumed_teardowns = report.resumed_teardowns,
        "Startup recovery complete"
    );

    tokio::spawn(start_reconciler_task(
        manager.clone(),
        config.reconcile_interval_secs,
    ));

    let app = create_app(manager, &config)?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("devhost-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
