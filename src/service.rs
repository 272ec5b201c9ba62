use crate::{
    circuit_breaker::CircuitBreakerManager,
    config::{Command, Config, DRIVER_SURREALDB},
    grpc::{run_grpc_server, VisitTransport},
    health::{cached, database_check, in_flight_check, permanent_failure, HealthChecker},
    metrics::Metrics,
    migration::{rollback_migration, run_migrations},
    pool::{create_pool, Pool},
    repository::{MemoryVisitRepository, VisitRepository},
    retry::RetryConfig,
    server::{create_router, run_http_server, AppState, HTTP_BREAKER},
    shutdown::{setup_signal_handlers, GracefulShutdown, ShutdownController},
    surreal_client::SurrealVisitRepository,
    tasks::{
        register_builtin_tasks, spawn_error_logger, MemoryBroker, MemoryResultBackend, Producer,
        QueueProducer, TaskRegistry, Worker, BROKER_BREAKER,
    },
    visit::{VisitService, DATABASE_BREAKER},
};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Interval of the background database ping behind the readiness check
const DATABASE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const TASK_ERROR_BUFFER: usize = 100;

/// Run the visit service with the given configuration
pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    info!("Configuration loaded: {}", config);

    match config.command() {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(&config).await,
        Command::Rollback { target } => rollback(&config, target).await,
    }
}

async fn surreal_pool(config: &Config) -> anyhow::Result<Pool> {
    if config.database.driver != DRIVER_SURREALDB {
        anyhow::bail!(
            "Migrations need the {} driver, configured driver is {}",
            DRIVER_SURREALDB,
            config.database.driver
        );
    }
    create_pool(Arc::new(config.database.clone())).await
}

async fn migrate(config: &Config) -> anyhow::Result<()> {
    let pool = surreal_pool(config).await?;
    run_migrations(&pool).await?;
    pool.close();
    Ok(())
}

async fn rollback(config: &Config, target: u32) -> anyhow::Result<()> {
    let pool = surreal_pool(config).await?;
    rollback_migration(&pool, target).await?;
    pool.close();
    Ok(())
}

/// Breakers for the database, the HTTP surface and the task broker
pub fn configure_breakers(config: &Config) -> Arc<CircuitBreakerManager> {
    let breakers = Arc::new(CircuitBreakerManager::new());
    breakers.configure(HTTP_BREAKER, config.http_breaker());
    breakers.configure(DATABASE_BREAKER, config.database_breaker());
    breakers.configure(BROKER_BREAKER, config.broker_breaker());
    breakers
}

fn parse_addr(addr: String) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid listen address: {}", addr))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, "Starting visit service");
    let config = Arc::new(config);

    Metrics::init(&config.app.name)?;
    info!("Metrics initialized");

    let health = Arc::new(HealthChecker::new(Duration::from_millis(config.health.check_timeout_ms)));
    let in_flight = Arc::new(AtomicUsize::new(0));
    health.add_liveness_check(
        "in_flight",
        in_flight_check(in_flight.clone(), config.health.inflight_threshold),
    );

    let breakers = configure_breakers(&config);

    // Setup shutdown handling
    let (controller, shutdown_receiver) = ShutdownController::new();
    let signal_handler = setup_signal_handlers(controller.clone());
    let mut graceful_shutdown = GracefulShutdown::new(controller.clone());

    // Database
    let repository: Arc<dyn VisitRepository> = if config.database.driver == DRIVER_SURREALDB {
        let pool = create_pool(Arc::new(config.database.clone())).await?;
        info!("Database connection pool created");

        if config.database.auto_migrate {
            run_migrations(&pool).await?;
            info!("Database migrations completed");
        }

        let hook_pool = pool.clone();
        graceful_shutdown.add_hook("database", move || async move {
            hook_pool.close();
            Ok(())
        });
        Arc::new(SurrealVisitRepository::new(pool))
    } else {
        warn!("Using the in-memory demo store, visits are lost on restart");
        Arc::new(MemoryVisitRepository::new())
    };

    let (database_ready, database_refresh) = cached(
        database_check(repository.clone()),
        DATABASE_CHECK_INTERVAL,
        shutdown_receiver.subscribe(),
    );
    health.add_readiness_check("database", database_ready);
    graceful_shutdown.register_task("database_check", database_refresh);

    // Task queue
    let broker = Arc::new(MemoryBroker::new(config.task.queue_capacity));
    let backend = Arc::new(MemoryResultBackend::with_expiry(Duration::from_secs(
        config.task.results_expire_in_secs,
    )));
    let producer: Arc<dyn Producer> = Arc::new(
        QueueProducer::new(
            broker.clone(),
            backend.clone(),
            breakers.clone(),
            config.broker_retry(),
            config.task.default_queue.clone(),
        )
        .with_poll_interval(Duration::from_millis(config.task.poll_interval_ms)),
    );

    if config.task.consumer_enable {
        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry);

        let (errors_tx, errors_rx) = mpsc::channel(TASK_ERROR_BUFFER);
        let worker = Worker::new(
            config.task.consumer_tag.clone(),
            config.task.default_queue.clone(),
            config.task.consumer_concurrent_tasks,
            broker.clone(),
            backend.clone(),
            registry,
            errors_tx,
        );

        graceful_shutdown.register_task("task_worker", tokio::spawn(worker.run(shutdown_receiver.subscribe())));
        graceful_shutdown.register_task(
            "task_error_logger",
            spawn_error_logger(errors_rx, shutdown_receiver.subscribe()),
        );
    }

    // gRPC
    let service = VisitService::new(repository, breakers.clone(), RetryConfig::default());
    let transport = VisitTransport::new(service);

    let grpc_addr = parse_addr(config.grpc_addr())?;
    let grpc_handle = tokio::spawn({
        let health = health.clone();
        let transport = transport.clone();
        let shutdown = controller.receiver();
        async move {
            if let Err(e) = run_grpc_server(grpc_addr, transport, shutdown).await {
                error!("gRPC server error: {:#}", e);
                health.add_readiness_check("gRPC", permanent_failure(format!("{:#}", e)));
            }
        }
    });
    graceful_shutdown.register_task("grpc_server", grpc_handle);

    // HTTP
    let state = AppState {
        health: health.clone(),
        producer,
        breakers,
        in_flight,
    };
    let router = create_router(&config, state, transport);
    let http_addr = parse_addr(config.http_addr())?;
    let http_handle = tokio::spawn({
        let health = health.clone();
        let controller = controller.clone();
        let shutdown = controller.receiver();
        async move {
            if let Err(e) = run_http_server(http_addr, router, shutdown).await {
                error!("HTTP server error: {:#}", e);
                health.add_readiness_check("http", permanent_failure(format!("{:#}", e)));
                controller.shutdown();
            }
        }
    });
    graceful_shutdown.register_task("http_server", http_handle);

    // Wait for shutdown signal
    shutdown_receiver.wait_for_shutdown().await;

    // Perform graceful shutdown
    graceful_shutdown
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    signal_handler.abort();

    info!(session_id = %session_id, "visit service shut down successfully");
    Ok(())
}
