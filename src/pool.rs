use crate::config::DatabaseConfig;
use anyhow::Result;
use deadpool::managed::{self, Manager, Metrics, Object, RecycleError, RecycleResult};
use std::sync::Arc;
use std::time::Duration;
use surrealdb::opt::auth::Root;
use surrealdb::{
    engine::any::{connect, Any},
    Surreal,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A pooled SurrealDB connection
pub type Connection = Object<SurrealDBManager>;

pub type Pool = managed::Pool<SurrealDBManager>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates and health-checks SurrealDB connections for deadpool
pub struct SurrealDBManager {
    config: Arc<DatabaseConfig>,
}

fn timed_out(what: &str) -> surrealdb::Error {
    surrealdb::Error::Api(surrealdb::error::Api::InternalError(format!("{} timeout", what)))
}

impl SurrealDBManager {
    pub fn new(config: Arc<DatabaseConfig>) -> Self {
        Self { config }
    }

    async fn create_connection(&self) -> Result<Surreal<Any>, surrealdb::Error> {
        let connect_timeout = Duration::from_secs(self.config.pool_create_timeout_secs);

        let db: Surreal<Any> = timeout(connect_timeout, connect(self.config.dsn.as_str()))
            .await
            .map_err(|_| timed_out("Connection"))??;

        // Embedded stores (mem://) run without users
        if !self.config.user.is_empty() {
            timeout(
                STEP_TIMEOUT,
                db.signin(Root {
                    username: &self.config.user,
                    password: &self.config.pass,
                }),
            )
            .await
            .map_err(|_| timed_out("Authentication"))??;
        }

        timeout(
            STEP_TIMEOUT,
            db.use_ns(&self.config.namespace).use_db(&self.config.name),
        )
        .await
        .map_err(|_| timed_out("Database selection"))??;

        Ok(db)
    }

    async fn health_check(&self, db: &Surreal<Any>) -> Result<(), surrealdb::Error> {
        let mut response = timeout(STEP_TIMEOUT, db.query("RETURN 1"))
            .await
            .map_err(|_| timed_out("Health check"))??;
        let _: Option<i64> = response.take(0)?;
        Ok(())
    }
}

impl Manager for SurrealDBManager {
    type Type = Surreal<Any>;
    type Error = surrealdb::Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        debug!("Creating new SurrealDB connection");
        let start = std::time::Instant::now();

        match self.create_connection().await {
            Ok(conn) => {
                info!("Created new SurrealDB connection in {:?}", start.elapsed());
                crate::metrics::record_pool_event("created");
                Ok(conn)
            }
            Err(e) => {
                error!("Failed to create SurrealDB connection: {}", e);
                crate::metrics::record_pool_event("create_failed");
                Err(e)
            }
        }
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        match self.health_check(conn).await {
            Ok(()) => {
                crate::metrics::record_pool_event("recycled");
                Ok(())
            }
            Err(e) => {
                warn!("Connection health check failed: {}", e);
                crate::metrics::record_pool_event("health_check_failed");
                Err(RecycleError::Message(format!("Health check failed: {}", e).into()))
            }
        }
    }
}

pub fn pool_config(config: &DatabaseConfig) -> managed::PoolConfig {
    managed::PoolConfig {
        max_size: config.pool_max_size,
        timeouts: managed::Timeouts {
            wait: Some(Duration::from_secs(config.pool_wait_timeout_secs)),
            create: Some(Duration::from_secs(config.pool_create_timeout_secs)),
            recycle: Some(Duration::from_secs(config.pool_recycle_timeout_secs)),
        },
        queue_mode: managed::QueueMode::Fifo,
    }
}

/// Builds the pool and pre-warms `pool_size` connections. Pre-warm failures
/// are logged; the readiness check reports a database that stays down.
pub async fn create_pool(config: Arc<DatabaseConfig>) -> Result<Pool> {
    let manager = SurrealDBManager::new(config.clone());

    let pool = managed::Pool::builder(manager)
        .config(pool_config(&config))
        .runtime(deadpool::Runtime::Tokio1)
        .build()?;

    let initial_size = config.pool_size.min(config.pool_max_size);
    info!("Pre-warming connection pool with {} connections", initial_size);

    let pre_warm_timeout = Duration::from_secs(config.pool_create_timeout_secs);
    let warm_ups = (0..initial_size).map(|_| {
        let pool = pool.clone();
        async move {
            match timeout(pre_warm_timeout, pool.get()).await {
                Ok(Ok(_)) => debug!("Successfully pre-warmed connection"),
                Ok(Err(e)) => warn!("Failed to pre-warm connection: {}", e),
                Err(_) => warn!("Pre-warm connection timeout after {:?}", pre_warm_timeout),
            }
        }
    });
    futures::future::join_all(warm_ups).await;

    info!(
        "Connection pool created with max size: {}, initial size: {}",
        config.pool_max_size, initial_size
    );

    Ok(pool)
}

pub trait PoolExt {
    fn stats(&self) -> PoolStats;
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
    pub max_size: usize,
}

impl PoolExt for Pool {
    fn stats(&self) -> PoolStats {
        let status = self.status();
        PoolStats {
            size: status.size as usize,
            available: status.available as usize,
            waiting: status.waiting as usize,
            max_size: status.max_size as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn database_config() -> DatabaseConfig {
        Config::try_parse_from(["visit_service", "--database-driver", "surrealdb"])
            .unwrap()
            .database
    }

    #[test]
    fn test_pool_config_follows_database_config() {
        let mut config = database_config();
        config.pool_max_size = 7;
        config.pool_wait_timeout_secs = 3;

        let pool_config = pool_config(&config);
        assert_eq!(pool_config.max_size, 7);
        assert_eq!(pool_config.timeouts.wait, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_pool_builds_without_server() {
        let mut config = database_config();
        config.dsn = "ws://127.0.0.1:1".to_string();
        config.pool_size = 0;

        let pool = create_pool(Arc::new(config)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.max_size, 10);
    }
}
