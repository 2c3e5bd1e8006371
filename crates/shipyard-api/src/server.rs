//! Role wiring for `shipyard-server`.
//!
//! Every role runs its background consumers and its HTTP listener under one
//! cancellation token. The first task to fail cancels the rest, and the
//! error is returned so the process exits non-zero.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use shipyard_builder::{
    BuildLookup, BuildWorker, Builder, HttpArtifactStore, HttpBuildLookup, LocalArtifactStore,
    StoreBuildLookup, run_worker,
};
use shipyard_bus::{BackoffPolicy, InMemoryBus, MessageBus, PgBus, Topic};
use shipyard_config::{Backend, BusSettings, ShipyardConfig, StoreSettings};
use shipyard_core::ArtifactStore;
use shipyard_db::{BuildStore, MemoryBuildStore, PgBuildStore, create_pool, run_migrations};
use shipyard_notify::NotificationHub;
use shipyard_orchestrator::{BuildOrchestrator, RetentionSweeper, StallMonitor};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::routes;
use crate::{NotifierState, OrchestratorState};

type Tasks = JoinSet<Result<()>>;

pub async fn connect_bus(settings: &BusSettings) -> Result<Arc<dyn MessageBus>> {
    match settings.backend {
        Backend::Memory => {
            warn!("Using the in-memory bus; only components in this process will see messages");
            Ok(Arc::new(InMemoryBus::new(settings.partitions)))
        }
        Backend::Postgres => {
            let url = settings.url.as_deref().context("bus.url is not set")?;
            info!("Connecting to bus database...");
            let pool = create_pool(url, 5).await.context("connecting to bus database")?;
            Ok(Arc::new(PgBus::new(pool, settings)))
        }
    }
}

pub async fn connect_store(settings: &StoreSettings) -> Result<Arc<dyn BuildStore>> {
    match settings.backend {
        Backend::Memory => Ok(Arc::new(MemoryBuildStore::new(settings.retention()))),
        Backend::Postgres => {
            let url = settings.url.as_deref().context("store.url is not set")?;
            info!("Connecting to store database...");
            let pool = create_pool(url, settings.max_connections)
                .await
                .context("connecting to store database")?;
            info!("Database connected");
            Ok(Arc::new(PgBuildStore::new(pool, settings.retention())))
        }
    }
}

/// Apply schema migrations to the configured PostgreSQL database.
pub async fn migrate(config: &ShipyardConfig) -> Result<()> {
    let url = config
        .store
        .url
        .as_deref()
        .or(config.bus.url.as_deref())
        .context("no database URL configured (store.url, bus.url or DATABASE_URL)")?;
    let pool = create_pool(url, 1).await.context("connecting to database")?;
    run_migrations(&pool).await.context("running migrations")?;
    info!("Migrations applied");
    Ok(())
}

fn spawn_orchestrator(
    tasks: &mut Tasks,
    config: &ShipyardConfig,
    orchestrator: Arc<BuildOrchestrator>,
    bus: Arc<dyn MessageBus>,
    shutdown: &CancellationToken,
) {
    let policy = BackoffPolicy::from(&config.bus.subscribe_backoff);
    let settings = &config.orchestrator;

    let (consumer, token) = (orchestrator.clone(), shutdown.clone());
    tasks.spawn(async move {
        shipyard_orchestrator::run_consumer(consumer, bus, policy, token)
            .await
            .context("orchestrator consumer")
    });
    let monitor = StallMonitor::new(
        orchestrator.clone(),
        settings.max_queued_age(),
        settings.stall_check_interval(),
    );
    let token = shutdown.clone();
    tasks.spawn(async move {
        monitor.run(token).await;
        Ok(())
    });
    let sweeper = RetentionSweeper::new(
        orchestrator,
        settings.purge_interval(),
        config.bus.retention(),
    );
    let token = shutdown.clone();
    tasks.spawn(async move {
        sweeper.run(token).await;
        Ok(())
    });
}

fn artifact_store(config: &ShipyardConfig, local: bool) -> Result<Arc<dyn ArtifactStore>> {
    if local {
        let root = config.builder.work_dir.join("artifacts");
        info!(root = %root.display(), "Storing artifacts locally");
        return Ok(Arc::new(LocalArtifactStore::new(root)));
    }
    let store = HttpArtifactStore::new(&config.builder.storage_url, config.builder.upload_timeout())
        .context("creating artifact store client")?;
    Ok(Arc::new(store))
}

fn spawn_builder(
    tasks: &mut Tasks,
    config: &ShipyardConfig,
    bus: Arc<dyn MessageBus>,
    artifacts: Arc<dyn ArtifactStore>,
    lookup: Option<Arc<dyn BuildLookup>>,
    shutdown: &CancellationToken,
) {
    let settings = &config.builder;
    let builder = Arc::new(Builder::new(settings, bus.clone(), artifacts));
    let mut worker = BuildWorker::new(settings.worker_id.clone(), builder, shutdown.clone());
    if let Some(lookup) = lookup {
        worker = worker.with_lookup(lookup);
    }
    let policy = BackoffPolicy::from(&config.bus.subscribe_backoff);
    let token = shutdown.clone();
    tasks.spawn(async move {
        run_worker(worker, bus, policy, token)
            .await
            .context("builder worker")
    });
}

fn spawn_notifier(
    tasks: &mut Tasks,
    config: &ShipyardConfig,
    hub: Arc<NotificationHub>,
    bus: Arc<dyn MessageBus>,
    shutdown: &CancellationToken,
) {
    let policy = BackoffPolicy::from(&config.bus.subscribe_backoff);
    let token = shutdown.clone();
    tasks.spawn(async move {
        shipyard_notify::run_consumer(hub, bus, policy, token)
            .await
            .context("notification consumer")
    });
}

pub async fn run_orchestrator(
    config: ShipyardConfig,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus = connect_bus(&config.bus).await?;
    let store = connect_store(&config.store).await?;
    let orchestrator = Arc::new(BuildOrchestrator::new(store, bus.clone()));

    let mut tasks = Tasks::new();
    spawn_orchestrator(&mut tasks, &config, orchestrator.clone(), bus.clone(), &shutdown);
    let state = OrchestratorState::new(orchestrator, bus, config.orchestrator.max_queued_age());
    spawn_http(&mut tasks, listen, routes::orchestrator_router(state), &shutdown).await?;
    supervise(tasks, shutdown).await
}

pub async fn run_builder(
    config: ShipyardConfig,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus = connect_bus(&config.bus).await?;
    let artifacts = artifact_store(&config, false)?;
    let lookup: Option<Arc<dyn BuildLookup>> =
        match config.builder.orchestrator_url.as_deref() {
            Some(url) => Some(Arc::new(
                HttpBuildLookup::new(url).context("creating build lookup client")?,
            )),
            None => None,
        };

    let mut tasks = Tasks::new();
    spawn_builder(&mut tasks, &config, bus, artifacts, lookup, &shutdown);
    spawn_http(&mut tasks, listen, Router::new(), &shutdown).await?;
    supervise(tasks, shutdown).await
}

pub async fn run_notifier(
    config: ShipyardConfig,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus = connect_bus(&config.bus).await?;
    let hub = Arc::new(NotificationHub::new(config.notifier.channel_capacity));

    let mut tasks = Tasks::new();
    spawn_notifier(&mut tasks, &config, hub.clone(), bus, &shutdown);
    let router = routes::notifier_router(NotifierState::new(hub));
    spawn_http(&mut tasks, listen, router, &shutdown).await?;
    supervise(tasks, shutdown).await
}

/// All three components in one process over the in-memory bus and store.
pub async fn run_standalone(
    config: ShipyardConfig,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus: Arc<dyn MessageBus> =
        Arc::new(InMemoryBus::with_topics(config.bus.partitions, &Topic::ALL));
    let store: Arc<dyn BuildStore> = Arc::new(MemoryBuildStore::new(config.store.retention()));
    let orchestrator = Arc::new(BuildOrchestrator::new(store.clone(), bus.clone()));
    let hub = Arc::new(NotificationHub::new(config.notifier.channel_capacity));
    let artifacts = artifact_store(&config, true)?;

    let mut tasks = Tasks::new();
    spawn_orchestrator(&mut tasks, &config, orchestrator.clone(), bus.clone(), &shutdown);
    spawn_builder(
        &mut tasks,
        &config,
        bus.clone(),
        artifacts,
        Some(Arc::new(StoreBuildLookup::new(store))),
        &shutdown,
    );
    spawn_notifier(&mut tasks, &config, hub.clone(), bus.clone(), &shutdown);

    let state = OrchestratorState::new(orchestrator, bus, config.orchestrator.max_queued_age());
    let router = routes::orchestrator_router(state)
        .merge(routes::notifier_router(NotifierState::new(hub)));
    spawn_http(&mut tasks, listen, router, &shutdown).await?;
    supervise(tasks, shutdown).await
}

async fn spawn_http(
    tasks: &mut Tasks,
    listen: SocketAddr,
    routes: Router,
    shutdown: &CancellationToken,
) -> Result<()> {
    let app = routes::finish(routes);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("Starting server on {}", listen);

    let token = shutdown.clone();
    tasks.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .context("HTTP server")
    });
    Ok(())
}

/// Wait for every task. The first failure cancels the others and is
/// returned once they have stopped.
async fn supervise(mut tasks: Tasks, shutdown: CancellationToken) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("task panicked")
            .and_then(|result| result);
        if let Err(e) = outcome {
            error!(error = %format!("{:#}", e), "Task failed, shutting down");
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
pub async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
