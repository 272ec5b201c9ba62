//! The HTTP surface wired the way the service wires it: gateway, health,
//! echo and a running task worker

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use clap::Parser;
use serde_json::{json, Value};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use visit_service::config::Config;
use visit_service::grpc::VisitTransport;
use visit_service::health::{database_check, HealthChecker};
use visit_service::repository::{MemoryVisitRepository, VisitRepository};
use visit_service::retry::RetryConfig;
use visit_service::server::{create_router, AppState};
use visit_service::service::configure_breakers;
use visit_service::shutdown::ShutdownController;
use visit_service::tasks::{
    register_builtin_tasks, MemoryBroker, MemoryResultBackend, Producer, QueueProducer, TaskRegistry,
    TaskRequest, Worker,
};
use visit_service::visit::VisitService;

struct Stack {
    router: Router,
    producer: Arc<dyn Producer>,
    shutdown: ShutdownController,
}

fn stack() -> Stack {
    let config = Config::try_parse_from(["visit_service", "--grpc-http-route-prefix", "/api"]).unwrap();
    let breakers = configure_breakers(&config);

    let repository: Arc<dyn VisitRepository> = Arc::new(MemoryVisitRepository::new());
    let health = Arc::new(HealthChecker::new(Duration::from_millis(200)));
    health.add_readiness_check("database", database_check(repository.clone()));

    let broker = Arc::new(MemoryBroker::new(config.task.queue_capacity));
    let backend = Arc::new(MemoryResultBackend::new());
    let producer: Arc<dyn Producer> = Arc::new(
        QueueProducer::new(
            broker.clone(),
            backend.clone(),
            breakers.clone(),
            config.broker_retry(),
            config.task.default_queue.clone(),
        )
        .with_poll_interval(Duration::from_millis(5)),
    );

    let registry = TaskRegistry::new();
    register_builtin_tasks(&registry);
    let (errors, _errors_rx) = mpsc::channel(8);
    let (shutdown, shutdown_rx) = ShutdownController::new();
    let worker = Worker::new("it", config.task.default_queue.clone(), 2, broker, backend, registry, errors);
    tokio::spawn(worker.run(shutdown_rx));

    let service = VisitService::new(repository, breakers.clone(), RetryConfig::default());
    let state = AppState {
        health,
        producer: producer.clone(),
        breakers,
        in_flight: Arc::new(AtomicUsize::new(0)),
    };

    Stack {
        router: create_router(&config, state, VisitTransport::new(service)),
        producer,
        shutdown,
    }
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_gateway_under_custom_prefix() {
    let stack = stack();

    let (status, created) = call(
        &stack.router,
        Request::post("/api/visit")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"FirstName":"Alan","LastName":"Turing"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!("/api/visit/{}", created["ID"]);
    let (status, fetched) = call(&stack.router, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["FirstName"], "Alan");

    let (status, _) = call(&stack.router, Request::get("/v1/visit/1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    stack.shutdown.shutdown();
}

#[tokio::test]
async fn test_readiness_reports_every_check() {
    let stack = stack();

    let (status, body) = call(&stack.router, Request::get("/health/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "database": "OK" }));

    stack.shutdown.shutdown();
}

#[tokio::test]
async fn test_echo_and_worker() {
    let stack = stack();

    let (status, body) = call(&stack.router, Request::get("/echo").body(Body::empty()).unwrap()).await;
    assert!(status == StatusCode::OK || status == StatusCode::CREATED);
    assert!(body["message"] == "Hello" || body["message"] == "Done");

    let mut response = stack
        .producer
        .produce(TaskRequest::new("repeat").arg("ping"))
        .await
        .unwrap();
    response.subscribe(Duration::from_secs(2)).await.unwrap();
    assert_eq!(response.result().unwrap()[0].as_str(), Some("ping"));

    stack.shutdown.shutdown();
}
