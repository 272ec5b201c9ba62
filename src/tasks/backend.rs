use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::signature::{Signature, TaskState};
use crate::error::{Result, ServiceError};

/// Carries signatures from producers to workers, one queue per routing key
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, signature: Signature) -> Result<()>;

    /// Waits for the next signature on `queue`
    async fn receive(&self, queue: &str) -> Result<Signature>;
}

/// Stores the latest state of every task
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn set_state(&self, state: TaskState) -> Result<()>;

    async fn get_state(&self, uuid: &str) -> Result<Option<TaskState>>;

    /// Forgets the state of a task
    async fn purge_state(&self, uuid: &str) -> Result<()>;
}

struct Queue {
    tx: mpsc::Sender<Signature>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Signature>>>,
}

/// Bounded in-process queues. A full queue is reported as a broker error so
/// the producer retries it.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Queue>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, queue: &str) -> mpsc::Sender<Signature> {
        self.queue(queue, |q| q.tx.clone())
    }

    fn receiver(&self, queue: &str) -> Arc<tokio::sync::Mutex<mpsc::Receiver<Signature>>> {
        self.queue(queue, |q| q.rx.clone())
    }

    fn queue<T>(&self, name: &str, f: impl FnOnce(&Queue) -> T) -> T {
        let mut queues = self.queues.lock();
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            Queue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        f(queue)
    }

    /// Signatures waiting on `queue`
    pub fn depth(&self, queue: &str) -> usize {
        let sender = self.sender(queue);
        self.capacity - sender.capacity()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, signature: Signature) -> Result<()> {
        let queue = signature.routing_key.clone();
        let uuid = signature.uuid.clone();

        match self.sender(&queue).try_send(signature) {
            Ok(()) => {
                debug!("Published task {} to queue {}", uuid, queue);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ServiceError::Broker(format!("queue {} is full", queue))),
            Err(TrySendError::Closed(_)) => Err(ServiceError::Broker(format!("queue {} is closed", queue))),
        }
    }

    async fn receive(&self, queue: &str) -> Result<Signature> {
        let receiver = self.receiver(queue);
        let mut receiver = receiver.lock().await;
        receiver
            .recv()
            .await
            .ok_or_else(|| ServiceError::Broker(format!("queue {} is closed", queue)))
    }
}

/// Default lifetime of a stored state, counted from its last update
pub const DEFAULT_RESULTS_EXPIRE_IN: Duration = Duration::from_secs(3600);

const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

struct Results {
    states: HashMap<String, (TaskState, Instant)>,
    last_pruned: Instant,
}

/// Task states kept in process. A state expires `expire_in` after it was
/// last written.
pub struct MemoryResultBackend {
    results: RwLock<Results>,
    expire_in: Duration,
}

impl Default for MemoryResultBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResultBackend {
    pub fn new() -> Self {
        Self::with_expiry(DEFAULT_RESULTS_EXPIRE_IN)
    }

    pub fn with_expiry(expire_in: Duration) -> Self {
        Self {
            results: RwLock::new(Results {
                states: HashMap::new(),
                last_pruned: Instant::now(),
            }),
            expire_in,
        }
    }

    /// States currently stored, expired ones included until the next prune
    pub fn len(&self) -> usize {
        self.results.read().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, results: &mut Results, now: Instant) {
        if now.duration_since(results.last_pruned) < self.expire_in.min(MAX_PRUNE_INTERVAL) {
            return;
        }
        let before = results.states.len();
        results
            .states
            .retain(|_, (_, updated)| now.duration_since(*updated) < self.expire_in);
        results.last_pruned = now;

        let expired = before - results.states.len();
        if expired > 0 {
            debug!("Expired {} task states", expired);
        }
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn set_state(&self, state: TaskState) -> Result<()> {
        let now = Instant::now();
        let mut results = self.results.write();
        self.prune(&mut results, now);
        results.states.insert(state.task_uuid.clone(), (state, now));
        Ok(())
    }

    async fn get_state(&self, uuid: &str) -> Result<Option<TaskState>> {
        let results = self.results.read();
        Ok(results
            .states
            .get(uuid)
            .filter(|(_, updated)| updated.elapsed() < self.expire_in)
            .map(|(state, _)| state.clone()))
    }

    async fn purge_state(&self, uuid: &str) -> Result<()> {
        self.results.write().states.remove(uuid);
        Ok(())
    }
}
