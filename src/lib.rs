pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod pool;
pub mod proto;
pub mod repository;
pub mod retry;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod surreal_client;
pub mod tasks;
pub mod validation;
pub mod visit;

use clap::Parser;

/// Run the visit service
pub async fn run_service() -> anyhow::Result<()> {
    // Parse config from environment/CLI
    let config = config::Config::parse();

    logging::init(config.log_format()?, &config.log.level)?;

    // Run the service
    service::run_with_config(config).await
}
