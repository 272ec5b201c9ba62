//! Asynchronous task queue: requests are turned into signatures, published
//! to a broker, run by a worker pool, and tracked in a result backend.

pub mod backend;
pub mod producer;
pub mod signature;
pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use backend::{Broker, MemoryBroker, MemoryResultBackend, ResultBackend};
pub use producer::{AsyncResponse, ProduceStatus, Producer, QueueProducer};
pub use signature::{Signature, TaskRequest, TaskState, TaskStatus};
pub use worker::{register_builtin_tasks, spawn_error_logger, TaskRegistry, Worker};

pub const BROKER_BREAKER: &str = "task_broker";

/// A typed task argument or result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArg {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Value,
}

impl TaskArg {
    pub fn new(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

impl From<&str> for TaskArg {
    fn from(value: &str) -> Self {
        TaskArg::new("string", Value::from(value))
    }
}

impl From<String> for TaskArg {
    fn from(value: String) -> Self {
        TaskArg::new("string", Value::from(value))
    }
}

impl From<i64> for TaskArg {
    fn from(value: i64) -> Self {
        TaskArg::new("int64", Value::from(value))
    }
}

impl From<f64> for TaskArg {
    fn from(value: f64) -> Self {
        TaskArg::new("float64", Value::from(value))
    }
}

impl From<bool> for TaskArg {
    fn from(value: bool) -> Self {
        TaskArg::new("bool", Value::from(value))
    }
}
