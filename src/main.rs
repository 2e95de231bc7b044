use bima_backend::api::{self, AppState};
use bima_backend::clock::{Clock, SystemClock};
use bima_backend::config::AppConfig;
use bima_backend::database::ledger_repository::WalletLedgerRepository;
use bima_backend::database::memory::{
    MemoryLedger, MemoryPaymentRequestStore, MemoryResolutionJobStore,
};
use bima_backend::database::payment_request_repository::{
    PaymentRequestRepository, PaymentRequestStore,
};
use bima_backend::database::resolution_job_repository::{
    ResolutionJobRepository, ResolutionJobStore,
};
use bima_backend::database::{init_pool_from_config, run_migrations};
use bima_backend::health::HealthChecker;
use bima_backend::logging::init_tracing;
use bima_backend::payments::gateway::MobileMoneyGateway;
use bima_backend::payments::providers::{MpesaConfig, MpesaGateway};
use bima_backend::services::ledger::LedgerWriter;
use bima_backend::services::notification::{LoggingNotifier, Notifier};
use bima_backend::services::payment_orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use bima_backend::workers::delayed_resolution::{DelayedResolutionConfig, DelayedResolutionWorker};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

struct Stores {
    pool: Option<sqlx::PgPool>,
    requests: Arc<dyn PaymentRequestStore>,
    jobs: Arc<dyn ResolutionJobStore>,
    ledger: Arc<dyn LedgerWriter>,
}

async fn init_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let Some(database) = &config.database else {
        warn!("SKIP_EXTERNALS=true: using in-memory stores, nothing is persisted");
        return Ok(Stores {
            pool: None,
            requests: Arc::new(MemoryPaymentRequestStore::new()),
            jobs: Arc::new(MemoryResolutionJobStore::new()),
            ledger: Arc::new(MemoryLedger::permissive()),
        });
    };

    info!("Initializing database connection pool...");
    let pool = init_pool_from_config(database).await?;
    run_migrations(&pool).await?;
    info!(
        max_connections = pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    Ok(Stores {
        requests: Arc::new(PaymentRequestRepository::new(pool.clone())),
        jobs: Arc::new(ResolutionJobRepository::new(pool.clone())),
        ledger: Arc::new(WalletLedgerRepository::new(pool.clone())),
        pool: Some(pool),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "Starting bima payment engine"
    );

    let stores = init_stores(&config).await?;

    let mpesa_config = MpesaConfig::from_env().map_err(|e| {
        error!(error = %e, "Failed to load M-Pesa configuration");
        e
    })?;
    let refresh_budget = mpesa_config.worst_case_status_refresh();
    let gateway: Arc<dyn MobileMoneyGateway> = Arc::new(MpesaGateway::new(mpesa_config).map_err(|e| {
        error!(error = %e, "Failed to initialize M-Pesa gateway");
        e
    })?);
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let resolution_config = DelayedResolutionConfig::from_env().covering_refresh(refresh_budget);
    let orchestrator_config = OrchestratorConfig {
        rules: config.payment_rules.clone(),
        resolution_first_delay: chrono::Duration::from_std(resolution_config.first_delay())?,
        resolution_max_attempts: resolution_config.max_attempts(),
    };

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        stores.requests.clone(),
        stores.jobs.clone(),
        gateway,
        stores.ledger.clone(),
        notifier,
        clock,
        orchestrator_config,
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let worker = DelayedResolutionWorker::new(
        orchestrator.clone(),
        stores.requests.clone(),
        stores.jobs.clone(),
        resolution_config,
    );
    let worker_handle = tokio::spawn(worker.run(worker_shutdown_rx));

    let health_checker = HealthChecker::new(stores.pool.clone(), stores.jobs.clone());
    let state = AppState::new(orchestrator, health_checker, config.callback.token.as_str());
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for delayed resolution worker shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}
