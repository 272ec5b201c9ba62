use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::TaskArg;

/// What a caller wants run. Continuations run after this task succeeds or
/// finally fails.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskRequest {
    pub name: String,
    pub args: Vec<TaskArg>,
    pub routing_key: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub on_success: Vec<TaskRequest>,
    pub on_error: Vec<TaskRequest>,
    pub headers: HashMap<String, String>,
    /// Immutable tasks do not receive the results of the task they follow
    pub immutable: bool,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<TaskArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn on_success(mut self, request: TaskRequest) -> Self {
        self.on_success.push(request);
        self
    }

    pub fn on_error(mut self, request: TaskRequest) -> Self {
        self.on_error.push(request);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

/// Wire form of a task as it travels through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub uuid: String,
    pub name: String,
    pub routing_key: String,
    pub eta: Option<DateTime<Utc>>,
    pub args: Vec<TaskArg>,
    pub headers: HashMap<String, String>,
    pub immutable: bool,
    pub retry_count: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub on_success: Vec<Signature>,
    pub on_error: Vec<Signature>,
}

impl Signature {
    /// Builds the signature tree for `request`. Every node gets its own id;
    /// tasks without a routing key go to `default_queue`.
    pub fn from_request(request: &TaskRequest, default_queue: &str) -> Self {
        Self {
            uuid: format!("task_{}", Uuid::new_v4()),
            name: request.name.clone(),
            routing_key: request
                .routing_key
                .clone()
                .unwrap_or_else(|| default_queue.to_string()),
            eta: request.eta,
            args: request.args.clone(),
            headers: request.headers.clone(),
            immutable: request.immutable,
            retry_count: request.retry_count,
            retry_delay: request.retry_delay,
            on_success: request
                .on_success
                .iter()
                .map(|r| Signature::from_request(r, default_queue))
                .collect(),
            on_error: request
                .on_error
                .iter()
                .map(|r| Signature::from_request(r, default_queue))
                .collect(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Received => "received",
            TaskStatus::Started => "started",
            TaskStatus::Retry => "retry",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }
}

/// Last known state of a task in the result backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_uuid: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub results: Vec<TaskArg>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(signature: &Signature, status: TaskStatus) -> Self {
        Self {
            task_uuid: signature.uuid.clone(),
            task_name: signature.name.clone(),
            status,
            results: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn success(signature: &Signature, results: Vec<TaskArg>) -> Self {
        Self {
            results,
            ..Self::new(signature, TaskStatus::Success)
        }
    }

    pub fn failure(signature: &Signature, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(signature, TaskStatus::Failure)
        }
    }
}
