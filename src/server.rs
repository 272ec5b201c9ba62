use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::Config;
use crate::gateway;
use crate::grpc::VisitTransport;
use crate::health::{HealthChecker, HealthReport};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownReceiver;
use crate::tasks::{Producer, TaskRequest};

pub const HTTP_BREAKER: &str = "http";

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthChecker>,
    pub producer: Arc<dyn Producer>,
    pub breakers: Arc<CircuitBreakerManager>,
    /// Requests currently being served, read by the in-flight health check
    pub in_flight: Arc<AtomicUsize>,
}

fn health_response(report: HealthReport) -> Response {
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

pub async fn health_live(State(state): State<AppState>) -> Response {
    health_response(state.health.live().await)
}

pub async fn health_ready(State(state): State<AppState>) -> Response {
    health_response(state.health.ready().await)
}

pub async fn metrics_handler() -> Response {
    let Some(metrics) = Metrics::get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    };

    match metrics.render() {
        Ok((content_type, buffer)) => ([(header::CONTENT_TYPE, content_type)], buffer).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn ping() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}

/// Produces a `repeat("hello")` task and reports its state right away:
/// 201 once it succeeded, 401 once it failed, 200 while it is pending.
pub async fn echo(State(state): State<AppState>) -> Response {
    let response = match state.producer.produce(TaskRequest::new("repeat").arg("hello")).await {
        Ok(response) => response,
        Err(e) => {
            error!("Echo failed to produce task: {}", e);
            return (StatusCode::NOT_IMPLEMENTED, Json(json!({}))).into_response();
        }
    };

    let status = if response.is_failure() {
        StatusCode::UNAUTHORIZED
    } else if response.is_success() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let message = if response.is_completed() { "Done" } else { "Hello" };

    (
        status,
        Json(json!({
            "message": message,
            "results": response.results(),
        })),
    )
        .into_response()
}

/// Runs application routes under the `http` breaker. Server errors and
/// responses slower than the breaker timeout count as failures.
async fn http_breaker(
    State(breakers): State<Arc<CircuitBreakerManager>>,
    request: Request,
    next: Next,
) -> Response {
    let guard = match breakers.acquire(HTTP_BREAKER) {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Rejected {} {}: {}", request.method(), request.uri(), e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let response = next.run(request).await;
    let success = !response.status().is_server_error() && guard.elapsed() <= guard.timeout();
    guard.record(success);
    response
}

/// Counts a request as in flight until dropped, so requests whose client
/// went away are released too
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::update_http_in_flight(1);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::update_http_in_flight(-1);
    }
}

async fn track_metrics(
    State(in_flight): State<Arc<AtomicUsize>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let guard = InFlight::enter(in_flight);
    let started = Instant::now();

    let response = next.run(request).await;

    drop(guard);
    crate::metrics::observe_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );

    response
}

/// Health, metrics, ping, echo and the gateway behind request-id, tracing and
/// compression layers
pub fn create_router(config: &Config, state: AppState, transport: VisitTransport) -> Router {
    let app = Router::new()
        .route("/ping", get(ping))
        .route("/echo", get(echo))
        .with_state(state.clone())
        .merge(gateway::router(&config.app.http_route_prefix, transport))
        .layer(middleware::from_fn_with_state(state.breakers.clone(), http_breaker));

    let monitoring = Router::new()
        .route(&config.health_live_route(), get(health_live))
        .route(&config.health_ready_route(), get(health_ready))
        .route(&config.prometheus.route, get(metrics_handler))
        .with_state(state.clone());

    monitoring
        .merge(app)
        .route_layer(middleware::from_fn_with_state(state.in_flight.clone(), track_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");
                    info_span!(
                        "http",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CompressionLayer::new())
                .layer(CatchPanicLayer::new()),
        )
}

pub async fn run_http_server(addr: SocketAddr, router: Router, shutdown: ShutdownReceiver) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.wait_for_shutdown())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
