use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;
use tonic::codegen::http::{self, header::CONTENT_TYPE, HeaderValue};
use tonic::{transport::Server, Request, Response, Status};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::proto::{visit_server, Id, VisitRequest, VisitResponse};
use crate::shutdown::ShutdownReceiver;
use crate::visit::VisitService;

/// gRPC face of [`VisitService`]
#[derive(Clone)]
pub struct VisitTransport {
    service: VisitService,
}

impl VisitTransport {
    pub fn new(service: VisitService) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> visit_server::VisitServer<Self> {
        visit_server::VisitServer::new(self)
    }
}

fn request_id<T>(request: &Request<T>) -> &str {
    request
        .metadata()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

fn finish(
    method: &str,
    started: Instant,
    result: crate::error::Result<VisitResponse>,
) -> Result<Response<VisitResponse>, Status> {
    let result = result.map(Response::new).map_err(Status::from);
    let code = match &result {
        Ok(_) => tonic::Code::Ok,
        Err(status) => status.code(),
    };
    crate::metrics::record_grpc_request(method, code, started.elapsed().as_secs_f64());
    result
}

#[tonic::async_trait]
impl visit_server::Visit for VisitTransport {
    async fn get(&self, request: Request<Id>) -> Result<Response<VisitResponse>, Status> {
        let started = Instant::now();
        debug!(request_id = request_id(&request), "pb.Visit/Get");

        let id = request.into_inner().id;
        let result = self.service.get(id).await.map(VisitResponse::from);

        finish("Get", started, result)
    }

    async fn set(&self, request: Request<VisitRequest>) -> Result<Response<VisitResponse>, Status> {
        let started = Instant::now();
        debug!(request_id = request_id(&request), "pb.Visit/Set");

        let input = request.into_inner().into();
        let result = self.service.set(input).await.map(VisitResponse::from);

        finish("Set", started, result)
    }
}

/// Trailers-only `Internal` reply for a handler that panicked
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> http::Response<String> {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("gRPC handler panicked: {}", message);

    let mut response = http::Response::new(String::new());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from(tonic::Code::Internal as i32));
    headers.insert("grpc-message", HeaderValue::from_static("internal%20error"));
    response
}

pub async fn run_grpc_server(
    addr: SocketAddr,
    transport: VisitTransport,
    shutdown: ShutdownReceiver,
) -> anyhow::Result<()> {
    info!("gRPC server listening on {}", addr);

    Server::builder()
        .layer(TraceLayer::new_for_grpc())
        .layer(CatchPanicLayer::custom(panic_response))
        .add_service(transport.into_server())
        .serve_with_shutdown(addr, shutdown.wait_for_shutdown())
        .await?;

    info!("gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerManager;
    use crate::proto::visit_server::Visit;
    use crate::repository::MemoryVisitRepository;
    use crate::retry::RetryConfig;
    use std::sync::Arc;
    use tonic::Code;
    use tonic_types::StatusExt;

    fn transport() -> VisitTransport {
        VisitTransport::new(VisitService::new(
            Arc::new(MemoryVisitRepository::new()),
            Arc::new(CircuitBreakerManager::new()),
            RetryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let transport = transport();

        let created = transport
            .set(Request::new(VisitRequest {
                id: 0,
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(created.id, 1);
        assert!(created.created_at.is_some());

        let fetched = transport
            .get(Request::new(Id { id: created.id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_invalid_request_has_field_violations() {
        let status = transport()
            .set(Request::new(VisitRequest {
                id: 0,
                first_name: "A".to_string(),
                last_name: "Lovelace".to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        let details = status.get_error_details();
        let bad_request = details.bad_request().expect("bad request details");
        assert_eq!(bad_request.field_violations.len(), 1);
        assert_eq!(bad_request.field_violations[0].field, "FirstName");
    }

    #[test]
    fn test_panic_response_is_internal_status() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "13");

        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_missing_visit_is_not_found() {
        let status = transport().get(Request::new(Id { id: 99 })).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
}
