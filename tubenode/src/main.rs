use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tubenode::api::{ApiServer, ApiServerConfig, AppState, JwtService};
use tubenode::bus;
use tubenode::config::NodeConfig;
use tubenode::coordinator::Coordinator;
use tubenode::database;
use tubenode::database::repositories::SqlxVideoRepository;
use tubenode::lifecycle::LifecycleService;
use tubenode::manifest::{ManifestLayout, Reconciler};
use tubenode::upload::{self, UploadTracker};
use tubenode::worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tubenode=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = NodeConfig::from_env_or_default();
    config.validate()?;

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let write_pool = database::init_write_pool(&config.database_url).await?;

    let repository = Arc::new(SqlxVideoRepository::new(pool.clone()));
    let layout = ManifestLayout::new(config.data_dir.clone());

    // Wire the bus and spawn the actors
    let cancel = CancellationToken::new();
    let (coordinator_bus, worker_buses) = bus::wire(config.workers);
    let workers = worker::spawn_workers(worker_buses, &cancel);

    let reconciler = Reconciler::new(layout.clone(), repository.clone(), config.record_streams);
    let coordinator = Coordinator::new(
        write_pool,
        coordinator_bus,
        config.jwt_secret.clone(),
        reconciler,
        config.reconcile_interval,
        cancel.clone(),
    )
    .spawn();

    // Upload sessions die on the publishing_stopped event, whichever worker
    // it originates from.
    let uploads = UploadTracker::spawn();
    upload::spawn_stop_listener(workers[0].subscribe(), uploads.clone());

    // Per-worker lifecycle services; the REST glue calls into these.
    let lifecycle: Vec<LifecycleService> = workers
        .iter()
        .map(|w| {
            LifecycleService::new(
                w.clone(),
                repository.clone(),
                uploads.clone(),
                layout.clone(),
            )
        })
        .collect();

    // The signing secret reaches workers over the bus, not shared memory.
    let secret = workers[0].secret().await?;
    let jwt_service = Arc::new(JwtService::new(&secret));

    let api_config = ApiServerConfig {
        bind_address: config.bind_address.clone(),
        port: config.port,
        enable_cors: true,
    };
    let state = AppState::new(jwt_service, workers, lifecycle);
    let server = ApiServer::new(api_config, state, cancel.clone());

    tracing::info!(
        workers = config.workers,
        data_dir = %config.data_dir.display(),
        "tubenode initialized successfully"
    );

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    // Stop workers and the API first, then the store owner.
    cancel.cancel();
    let _ = coordinator.await;

    Ok(())
}
