use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tonic::{metadata::AsciiMetadataValue, Code, Request, Status};
use tonic_types::StatusExt;
use tracing::debug;

use crate::grpc::VisitTransport;
use crate::proto::{from_timestamp, visit_server::Visit, Id, VisitRequest, VisitResponse};

/// JSON form of `VisitRequest`, using the proto field names
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VisitBody {
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "FirstName")]
    pub first_name: String,
    #[serde(rename = "LastName")]
    pub last_name: String,
}

/// JSON form of `VisitResponse`; timestamps are RFC 3339
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct VisitJson {
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "FirstName")]
    pub first_name: String,
    #[serde(rename = "LastName")]
    pub last_name: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: Option<String>,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: Option<String>,
}

impl From<VisitResponse> for VisitJson {
    fn from(response: VisitResponse) -> Self {
        let rfc3339 = |ts: Option<prost_types::Timestamp>| {
            ts.as_ref()
                .and_then(from_timestamp)
                .map(|time| time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        };

        Self {
            id: response.id,
            created_at: rfc3339(response.created_at),
            updated_at: rfc3339(response.updated_at),
            first_name: response.first_name,
            last_name: response.last_name,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(rename = "fieldViolation", default)]
    pub field_violation: Vec<FieldViolationJson>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldViolationJson {
    pub field: String,
    pub description: String,
}

/// Status a gRPC code is served with over HTTP
pub fn http_status_from_code(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A gRPC status rendered as the gateway error body
pub struct GatewayError(pub Status);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.0;
        let details = status.get_error_details();

        let field_violation = details
            .bad_request()
            .map(|bad_request| {
                bad_request
                    .field_violations
                    .iter()
                    .map(|v| FieldViolationJson {
                        field: v.field.clone(),
                        description: v.description.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let body = ErrorBody {
            error: status.message().to_string(),
            field_violation,
        };

        (http_status_from_code(status.code()), Json(body)).into_response()
    }
}

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

fn grpc_request<T>(message: T, headers: &HeaderMap) -> Request<T> {
    let mut request = Request::new(message);

    if let Some(value) = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<AsciiMetadataValue>().ok())
    {
        request.metadata_mut().insert("x-request-id", value);
    }

    request
}

async fn get_visit(
    State(transport): State<VisitTransport>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<VisitJson>, GatewayError> {
    let id: u32 = id.parse().map_err(|e| {
        Status::invalid_argument(format!("type mismatch, parameter: ID, error: {}", e))
    })?;

    debug!("Gateway GET visit {}", id);
    let response = transport.get(grpc_request(Id { id }, &headers)).await?;

    Ok(Json(response.into_inner().into()))
}

async fn set_visit(
    State(transport): State<VisitTransport>,
    headers: HeaderMap,
    body: Result<Json<VisitBody>, JsonRejection>,
) -> Result<Json<VisitJson>, GatewayError> {
    let Json(body) = body.map_err(|rejection| Status::invalid_argument(rejection.body_text()))?;

    let request = VisitRequest {
        id: body.id,
        first_name: body.first_name,
        last_name: body.last_name,
    };
    let response = transport.set(grpc_request(request, &headers)).await?;

    Ok(Json(response.into_inner().into()))
}

/// `GET {prefix}/visit/{ID}`, `POST {prefix}/visit`, `PUT {prefix}/visit`
pub fn router(prefix: &str, transport: VisitTransport) -> Router {
    let prefix = prefix.trim_end_matches('/');

    Router::new()
        .route(&format!("{}/visit/:id", prefix), get(get_visit))
        .route(&format!("{}/visit", prefix), post(set_visit).put(set_visit))
        .with_state(transport)
}
