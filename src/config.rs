use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::fmt;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;

pub const DRIVER_MEMORY: &str = "memory";
pub const DRIVER_SURREALDB: &str = "surrealdb";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Deployment environment, "production" switches logs to JSON
    #[arg(long, env = "BUILD_ENV", default_value = "development")]
    pub environment: String,

    #[command(flatten)]
    pub app: AppConfig,

    #[command(flatten)]
    pub log: LogConfig,

    #[command(flatten)]
    pub health: HealthConfig,

    #[command(flatten)]
    pub prometheus: PrometheusConfig,

    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub task: TaskConfig,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve gRPC and HTTP traffic (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Roll migrations back down to the target version and exit
    Rollback {
        #[arg(long)]
        target: u32,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AppConfig {
    #[arg(long = "app-name", env = "APP_NAME", default_value = "default")]
    pub name: String,

    #[arg(long = "app-host", env = "APP_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long = "app-port", env = "APP_PORT", default_value = "8080")]
    pub port: u16,

    #[arg(long = "grpc-port", env = "APP_GRPC_PORT", default_value = "8082")]
    pub grpc_port: u16,

    #[arg(long = "grpc-http-route-prefix", env = "APP_GRPC_HTTP_ROUTE_PREFIX", default_value = "/v1")]
    pub http_route_prefix: String,

    /// HTTP breaker: per-request timeout
    #[arg(long = "request-timeout-ms", env = "APP_REQUEST_TIMEOUT", default_value = "100")]
    pub request_timeout_ms: u64,

    #[arg(long = "request-max-conn", env = "APP_REQUEST_MAX_CONN", default_value = "10")]
    pub request_max_conn: usize,

    #[arg(long = "request-vol-threshold", env = "APP_REQUEST_VOL_THRESHOLD", default_value = "20")]
    pub request_vol_threshold: u64,

    #[arg(long = "request-sleep-window-ms", env = "APP_REQUEST_SLEEP_WINDOW", default_value = "5000")]
    pub request_sleep_window_ms: u64,

    #[arg(long = "request-err-per-threshold", env = "APP_REQUEST_ERR_PER_THRESHOLD", default_value = "50")]
    pub request_err_per_threshold: u32,
}

#[derive(Args, Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "debug")]
    pub level: String,

    /// "json", "compact" or "pretty"; derived from the environment when unset
    #[arg(long = "log-format", env = "LOG_FORMAT")]
    pub format: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct HealthConfig {
    #[arg(long = "health-route-group", env = "HEALTH_CHECK_ROUTE_GROUP", default_value = "/health")]
    pub route_group: String,

    #[arg(long = "health-route-live", env = "HEALTH_CHECK_ROUTE_LIVE", default_value = "/live")]
    pub route_live: String,

    #[arg(long = "health-route-ready", env = "HEALTH_CHECK_ROUTE_READY", default_value = "/ready")]
    pub route_ready: String,

    /// Liveness fails once more requests than this are in flight
    #[arg(long = "health-inflight-threshold", env = "HEALTH_CHECK_INFLIGHT_THRESHOLD", default_value = "100")]
    pub inflight_threshold: usize,

    #[arg(long = "health-check-timeout-ms", env = "HEALTH_CHECK_TIMEOUT_MS", default_value = "1000")]
    pub check_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PrometheusConfig {
    #[arg(long = "prometheus-route", env = "PROMETHEUS_ROUTE", default_value = "/metrics")]
    pub route: String,
}

#[derive(Args, Debug, Clone)]
pub struct DatabaseConfig {
    /// "memory" (demo store) or "surrealdb"
    #[arg(long = "database-driver", env = "DATABASE_DRIVER", default_value = DRIVER_MEMORY)]
    pub driver: String,

    #[arg(long = "database-dsn", env = "DATABASE_DSN", default_value = "ws://localhost:8000")]
    pub dsn: String,

    #[arg(long = "database-user", env = "DATABASE_USER", default_value = "root")]
    pub user: String,

    #[arg(long = "database-pass", env = "DATABASE_PASS", default_value = "root")]
    pub pass: String,

    #[arg(long = "database-namespace", env = "DATABASE_NAMESPACE", default_value = "app")]
    pub namespace: String,

    #[arg(id = "database_name", long = "database-name", env = "DATABASE_NAME", default_value = "visits")]
    pub name: String,

    #[arg(long = "database-auto-migrate", env = "DATABASE_AUTO_MIGRATE", default_value = "off", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub auto_migrate: bool,

    #[arg(long = "database-pool-size", env = "DATABASE_POOL_SIZE", default_value = "2")]
    pub pool_size: usize,

    #[arg(long = "database-pool-max-size", env = "DATABASE_POOL_MAX_SIZE", default_value = "10")]
    pub pool_max_size: usize,

    #[arg(long = "database-pool-wait-timeout-secs", env = "DATABASE_POOL_WAIT_TIMEOUT_SECS", default_value = "10")]
    pub pool_wait_timeout_secs: u64,

    #[arg(long = "database-pool-create-timeout-secs", env = "DATABASE_POOL_CREATE_TIMEOUT_SECS", default_value = "30")]
    pub pool_create_timeout_secs: u64,

    #[arg(long = "database-pool-recycle-timeout-secs", env = "DATABASE_POOL_RECYCLE_TIMEOUT_SECS", default_value = "30")]
    pub pool_recycle_timeout_secs: u64,

    /// Database breaker: per-call timeout
    #[arg(long = "database-timeout-ms", env = "DATABASE_TIMEOUT", default_value = "1000")]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct TaskConfig {
    #[arg(long = "task-default-queue", env = "TASK_DEFAULT_QUEUE", default_value = "tasks")]
    pub default_queue: String,

    #[arg(long = "task-queue-capacity", env = "TASK_QUEUE_CAPACITY", default_value = "1024")]
    pub queue_capacity: usize,

    #[arg(long = "task-broker-retries", env = "TASK_BROKER_RETRIES", default_value = "2")]
    pub broker_retries: u32,

    #[arg(long = "task-broker-retry-delay-ms", env = "TASK_BROKER_RETRY_DELAY", default_value = "10")]
    pub broker_retry_delay_ms: u64,

    #[arg(long = "task-broker-timeout-ms", env = "TASK_BROKER_TIMEOUT", default_value = "100")]
    pub broker_timeout_ms: u64,

    #[arg(long = "task-broker-max-conn", env = "TASK_BROKER_MAX_CONN", default_value = "10")]
    pub broker_max_conn: usize,

    #[arg(long = "task-broker-vol-threshold", env = "TASK_BROKER_VOL_THRESHOLD", default_value = "20")]
    pub broker_vol_threshold: u64,

    #[arg(long = "task-broker-sleep-window-ms", env = "TASK_BROKER_SLEEP_WINDOW", default_value = "5000")]
    pub broker_sleep_window_ms: u64,

    #[arg(long = "task-broker-err-per-threshold", env = "TASK_BROKER_ERR_PER_THRESHOLD", default_value = "50")]
    pub broker_err_per_threshold: u32,

    #[arg(long = "task-consumer-enable", env = "TASK_CONSUMER_ENABLE", default_value = "off", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub consumer_enable: bool,

    #[arg(long = "task-consumer-tag", env = "TASK_CONSUMER_TAG", default_value = "worker")]
    pub consumer_tag: String,

    #[arg(long = "task-consumer-concurrent-tasks", env = "TASK_CONSUMER_CONCURRENT_TASKS", default_value = "10")]
    pub consumer_concurrent_tasks: usize,

    /// How often AsyncResponse::subscribe re-reads the task state
    #[arg(long = "task-poll-interval-ms", env = "TASK_POLL_INTERVAL_MS", default_value = "50")]
    pub poll_interval_ms: u64,

    /// Task states are dropped this long after their last update
    #[arg(long = "task-results-expire-in-secs", env = "TASK_RESULTS_EXPIRE_IN", default_value = "3600")]
    pub results_expire_in_secs: u64,
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
    Pretty,
}

impl Config {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn log_format(&self) -> anyhow::Result<LogFormat> {
        match self.log.format.as_deref() {
            Some("json") => Ok(LogFormat::Json),
            Some("compact") => Ok(LogFormat::Compact),
            Some("pretty") => Ok(LogFormat::Pretty),
            Some(other) => anyhow::bail!("Unknown log format: {}", other),
            None if self.is_production() => Ok(LogFormat::Json),
            None => Ok(LogFormat::Compact),
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.app.host, self.app.port)
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.app.host, self.app.grpc_port)
    }

    pub fn health_live_route(&self) -> String {
        format!("{}{}", self.health.route_group, self.health.route_live)
    }

    pub fn health_ready_route(&self) -> String {
        format!("{}{}", self.health.route_group, self.health.route_ready)
    }

    pub fn http_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(self.app.request_timeout_ms),
            max_concurrent_requests: self.app.request_max_conn,
            request_volume_threshold: self.app.request_vol_threshold,
            sleep_window: Duration::from_millis(self.app.request_sleep_window_ms),
            error_percent_threshold: self.app.request_err_per_threshold,
            ..Default::default()
        }
    }

    pub fn database_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(self.database.timeout_ms),
            max_concurrent_requests: self.database.pool_max_size.max(1) * 4,
            ..Default::default()
        }
    }

    pub fn broker_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(self.task.broker_timeout_ms),
            max_concurrent_requests: self.task.broker_max_conn,
            request_volume_threshold: self.task.broker_vol_threshold,
            sleep_window: Duration::from_millis(self.task.broker_sleep_window_ms),
            error_percent_threshold: self.task.broker_err_per_threshold,
            ..Default::default()
        }
    }

    pub fn broker_retry(&self) -> RetryConfig {
        RetryConfig {
            attempts: self.task.broker_retries,
            delay: Duration::from_millis(self.task.broker_retry_delay_ms),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app.port == 0 || self.app.grpc_port == 0 {
            anyhow::bail!("HTTP and gRPC ports must be greater than 0");
        }

        if self.app.port == self.app.grpc_port {
            anyhow::bail!("HTTP and gRPC ports must differ");
        }

        if !self.app.http_route_prefix.starts_with('/') {
            anyhow::bail!("Gateway route prefix must start with '/'");
        }

        if self.app.request_max_conn == 0 || self.task.broker_max_conn == 0 {
            anyhow::bail!("Breaker max concurrent requests must be greater than 0");
        }

        for percent in [self.app.request_err_per_threshold, self.task.broker_err_per_threshold] {
            if percent == 0 || percent > 100 {
                anyhow::bail!("Error percent threshold must be within 1..=100, got {}", percent);
            }
        }

        if self.database.driver != DRIVER_MEMORY && self.database.driver != DRIVER_SURREALDB {
            anyhow::bail!("Unknown database driver: {}", self.database.driver);
        }

        if self.database.pool_max_size == 0 {
            anyhow::bail!("Pool max size must be greater than 0");
        }

        if self.database.pool_max_size < self.database.pool_size {
            anyhow::bail!("Pool max size must be greater than or equal to pool size");
        }

        if self.task.queue_capacity == 0 {
            anyhow::bail!("Task queue capacity must be greater than 0");
        }

        if self.task.consumer_concurrent_tasks == 0 {
            anyhow::bail!("Consumer concurrent tasks must be greater than 0");
        }

        if self.task.poll_interval_ms == 0 {
            anyhow::bail!("Task poll interval must be greater than 0");
        }

        if self.task.results_expire_in_secs == 0 {
            anyhow::bail!("Task results expiry must be greater than 0");
        }

        self.log_format()?;

        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Environment: {}", self.environment)?;
        writeln!(f, "  App: {} (http={}, grpc={})", self.app.name, self.http_addr(), self.grpc_addr())?;
        writeln!(f, "  Gateway prefix: {}", self.app.http_route_prefix)?;
        writeln!(f, "  Log level: {}", self.log.level)?;
        writeln!(f, "  Database: {} {} ({}/{}, auto_migrate={})",
            self.database.driver,
            self.database.dsn,
            self.database.namespace,
            self.database.name,
            self.database.auto_migrate)?;
        writeln!(f, "  Pool Size: {} (max: {})", self.database.pool_size, self.database.pool_max_size)?;
        writeln!(f, "  Task queue: {} (capacity={}, consumer={}, concurrency={}, results_expire_in={}s)",
            self.task.default_queue,
            self.task.queue_capacity,
            self.task.consumer_enable,
            self.task.consumer_concurrent_tasks,
            self.task.results_expire_in_secs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::try_parse_from(["visit_service"]).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.command(), Command::Serve);
        assert_eq!(config.health_live_route(), "/health/live");
        assert_eq!(config.health_ready_route(), "/health/ready");
    }

    #[test]
    fn test_rollback_subcommand() {
        let config = Config::try_parse_from(["visit_service", "rollback", "--target", "1"]).unwrap();
        assert_eq!(config.command(), Command::Rollback { target: 1 });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = defaults();
        config.app.grpc_port = config.app.port;
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.app.request_err_per_threshold = 101;
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.database.driver = "mysql".to_string();
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.log.format = Some("xml".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_definition() {
        <Config as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_section_names_do_not_clash() {
        let config = Config::try_parse_from([
            "visit_service",
            "--app-name",
            "visits-api",
            "--database-name",
            "archive",
        ])
        .unwrap();
        assert_eq!(config.app.name, "visits-api");
        assert_eq!(config.database.name, "archive");
    }

    #[test]
    fn test_switches() {
        let config = Config::try_parse_from([
            "visit_service",
            "--database-auto-migrate",
            "on",
            "--task-consumer-enable",
            "yes",
        ])
        .unwrap();
        assert!(config.database.auto_migrate);
        assert!(config.task.consumer_enable);

        let config = Config::try_parse_from(["visit_service", "--task-consumer-enable", "OFF"]).unwrap();
        assert!(!config.task.consumer_enable);

        assert!(Config::try_parse_from(["visit_service", "--task-consumer-enable", "maybe"]).is_err());
    }

    #[test]
    fn test_log_format_follows_environment() {
        let mut config = defaults();
        config.log.format = None;
        config.environment = "production".to_string();
        assert_eq!(config.log_format().unwrap(), LogFormat::Json);

        config.environment = "development".to_string();
        assert_eq!(config.log_format().unwrap(), LogFormat::Compact);
    }
}
