use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::backend::{Broker, ResultBackend};
use super::signature::{Signature, TaskRequest, TaskState, TaskStatus};
use super::TaskArg;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::{Result, ServiceError};
use crate::retry::{with_breaker_and_retry, RetryConfig};

/// Status of a produced task as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    Init,
    Queued,
    InProgress,
    Retry,
    Unknown,
    Success,
    Failure,
}

impl ProduceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProduceStatus::Init => "INIT",
            ProduceStatus::Queued => "QUEUED",
            ProduceStatus::InProgress => "INPROGRESS",
            ProduceStatus::Retry => "RETRY",
            ProduceStatus::Unknown => "UNKNOWN",
            ProduceStatus::Success => "SUCCESS",
            ProduceStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for ProduceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TaskStatus> for ProduceStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => ProduceStatus::Init,
            TaskStatus::Received => ProduceStatus::Queued,
            TaskStatus::Started => ProduceStatus::InProgress,
            TaskStatus::Retry => ProduceStatus::Retry,
            TaskStatus::Success => ProduceStatus::Success,
            TaskStatus::Failure => ProduceStatus::Failure,
        }
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, request: TaskRequest) -> Result<AsyncResponse>;
}

/// Publishes to a [`Broker`] through a circuit breaker with constant-backoff
/// retries, recording the pending state first.
pub struct QueueProducer {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    breakers: Arc<CircuitBreakerManager>,
    breaker: String,
    retry: RetryConfig,
    default_queue: String,
    poll_interval: Duration,
}

impl QueueProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        breakers: Arc<CircuitBreakerManager>,
        retry: RetryConfig,
        default_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            backend,
            breakers,
            breaker: super::BROKER_BREAKER.to_string(),
            retry,
            default_queue: default_queue.into(),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_breaker(mut self, breaker: impl Into<String>) -> Self {
        self.breaker = breaker.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn signature(&self, request: &TaskRequest) -> Signature {
        Signature::from_request(request, &self.default_queue)
    }
}

#[async_trait]
impl Producer for QueueProducer {
    async fn produce(&self, request: TaskRequest) -> Result<AsyncResponse> {
        let signature = self.signature(&request);
        let uuid = signature.uuid.clone();

        self.backend
            .set_state(TaskState::new(&signature, TaskStatus::Pending))
            .await?;

        let broker = self.broker.clone();
        let published = with_breaker_and_retry(&self.breakers, &self.breaker, &self.retry, || {
            let broker = broker.clone();
            let signature = signature.clone();
            async move { broker.publish(signature).await }
        })
        .await;

        crate::metrics::record_task_produced(&request.name, published.is_ok());
        if let Err(e) = published {
            error!("Failed to produce task {} ({}): {}", request.name, uuid, e);
            if let Err(purge) = self.backend.purge_state(&uuid).await {
                warn!("Failed to purge state of task {}: {}", uuid, purge);
            }
            return Err(e);
        }
        debug!("Produced task {} ({})", request.name, uuid);

        let mut response = AsyncResponse::new(uuid, request, self.backend.clone(), self.poll_interval);
        response.sync().await?;
        Ok(response)
    }
}

/// Handle on a produced task
pub struct AsyncResponse {
    uuid: String,
    request: TaskRequest,
    backend: Arc<dyn ResultBackend>,
    state: Option<TaskState>,
    poll_interval: Duration,
}

impl AsyncResponse {
    pub fn new(
        uuid: String,
        request: TaskRequest,
        backend: Arc<dyn ResultBackend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            uuid,
            request,
            backend,
            state: None,
            poll_interval,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    /// Re-reads the state from the result backend
    pub async fn sync(&mut self) -> Result<()> {
        self.state = self.backend.get_state(&self.uuid).await?;
        Ok(())
    }

    pub fn status(&self) -> ProduceStatus {
        self.state
            .as_ref()
            .map(|state| state.status.into())
            .unwrap_or(ProduceStatus::Unknown)
    }

    /// Polls until the task completes. Fails with the task error when it
    /// failed, or with `Timeout` when `timeout` elapses first.
    pub async fn subscribe(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait_until_completed()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout("Timeout reached".to_string())),
        }
    }

    async fn wait_until_completed(&mut self) -> Result<()> {
        loop {
            self.sync().await?;
            match self.status() {
                ProduceStatus::Success => return Ok(()),
                ProduceStatus::Failure => {
                    let error = self.error().unwrap_or_else(|| "unknown error".to_string());
                    return Err(ServiceError::TaskFailed(error));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Results of a successful task
    pub fn result(&self) -> Result<Vec<TaskArg>> {
        match &self.state {
            Some(state) if state.status == TaskStatus::Success => Ok(state.results.clone()),
            _ => Err(ServiceError::TaskNotSuccessful(self.uuid.clone())),
        }
    }

    pub fn results(&self) -> Vec<TaskArg> {
        self.state
            .as_ref()
            .map(|state| state.results.clone())
            .unwrap_or_default()
    }

    pub fn error(&self) -> Option<String> {
        self.state.as_ref().and_then(|state| state.error.clone())
    }

    pub fn is_completed(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_success(&self) -> bool {
        self.status() == ProduceStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status() == ProduceStatus::Failure
    }
}
