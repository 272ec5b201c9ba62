use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{Broker, ResultBackend};
use super::signature::{Signature, TaskState, TaskStatus};
use super::TaskArg;
use crate::error::ServiceError;
use crate::shutdown::ShutdownReceiver;

/// Outcome of a task handler: its results, or an error message
pub type TaskResult = std::result::Result<Vec<TaskArg>, String>;

type Handler = Arc<dyn Fn(Vec<TaskArg>) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Task handlers by name
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<TaskArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        debug!("Registered task handler: {}", name);
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.handlers.write().insert(name.to_string(), handler);
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.read().get(name).cloned()
    }
}

/// Registers the tasks every worker knows about
pub fn register_builtin_tasks(registry: &TaskRegistry) {
    registry.register("repeat", |args: Vec<TaskArg>| async move { repeat(&args) });
}

/// Returns its single string argument
fn repeat(args: &[TaskArg]) -> TaskResult {
    match args {
        [arg] => arg
            .as_str()
            .map(|value| vec![TaskArg::from(value)])
            .ok_or_else(|| format!("repeat expects a string argument, got {}", arg.type_name)),
        _ => Err(format!("repeat expects 1 argument, got {}", args.len())),
    }
}

/// Consumes one queue, running at most `concurrency` tasks at a time
#[derive(Clone)]
pub struct Worker {
    tag: String,
    queue: String,
    concurrency: usize,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    registry: TaskRegistry,
    errors: mpsc::Sender<ServiceError>,
}

impl Worker {
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        concurrency: usize,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        registry: TaskRegistry,
        errors: mpsc::Sender<ServiceError>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            concurrency: concurrency.max(1),
            broker,
            backend,
            registry,
            errors,
        }
    }

    /// Runs until `shutdown` fires, then waits for in-flight tasks. Tasks
    /// whose ETA is still ahead are parked without taking a slot.
    pub async fn run(self, mut shutdown: ShutdownReceiver) {
        info!(
            "Worker {} consuming queue {} (concurrency={})",
            self.tag, self.queue, self.concurrency
        );
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown.recv() => break,
                received = self.broker.receive(&self.queue) => received,
            };

            match received {
                Ok(signature) => {
                    if let Some(wait) = until_eta(&signature) {
                        drop(permit);
                        self.park(signature, wait, shutdown.subscribe());
                        continue;
                    }

                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(signature).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Worker {} stopped receiving from {}: {}", self.tag, self.queue, e);
                    self.report(e);
                    break;
                }
            }
        }

        info!("Worker {} waiting for in-flight tasks", self.tag);
        let _ = permits.acquire_many(self.concurrency as u32).await;
        info!("Worker {} stopped", self.tag);
    }

    /// Publishes `signature` back to its queue once its ETA is reached. A
    /// shutdown before then fails the task.
    fn park(&self, signature: Signature, wait: std::time::Duration, mut shutdown: ShutdownReceiver) {
        debug!(
            "Worker {} delaying task {} ({}) by {:?}",
            self.tag, signature.name, signature.uuid, wait
        );
        let worker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = worker.broker.publish(signature.clone()).await {
                        worker.fail(&signature, format!("delayed task not requeued: {}", e)).await;
                    }
                }
                _ = shutdown.recv() => {
                    worker.fail(&signature, "worker stopped before the task's ETA".to_string()).await;
                }
            }
        });
    }

    async fn process(&self, signature: Signature) {
        let started = Instant::now();
        debug!("Worker {} received task {} ({})", self.tag, signature.name, signature.uuid);
        self.store(TaskState::new(&signature, TaskStatus::Received)).await;

        let Some(handler) = self.registry.get(&signature.name) else {
            let message = format!("Task not registered: {}", signature.name);
            self.fail(&signature, message).await;
            crate::metrics::record_task_processed(&signature.name, "failure", started.elapsed().as_secs_f64());
            return;
        };

        self.store(TaskState::new(&signature, TaskStatus::Started)).await;

        let outcome = AssertUnwindSafe(handler(signature.args.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(format!("task {} panicked", signature.name)));

        let status = match outcome {
            Ok(results) => {
                self.succeed(&signature, results).await;
                "success"
            }
            Err(message) if signature.retry_count > 0 => {
                self.retry(signature.clone(), message).await;
                "retry"
            }
            Err(message) => {
                self.fail(&signature, message).await;
                "failure"
            }
        };

        crate::metrics::record_task_processed(&signature.name, status, started.elapsed().as_secs_f64());
    }

    async fn succeed(&self, signature: &Signature, results: Vec<TaskArg>) {
        debug!("Task {} ({}) succeeded", signature.name, signature.uuid);
        self.store(TaskState::success(signature, results.clone())).await;

        for callback in &signature.on_success {
            let mut callback = callback.clone();
            if !callback.immutable {
                callback.args.extend(results.iter().cloned());
            }
            self.publish(callback).await;
        }
    }

    async fn retry(&self, mut signature: Signature, message: String) {
        signature.retry_count -= 1;
        let delay = chrono::Duration::from_std(signature.retry_delay).unwrap_or_else(|_| chrono::Duration::zero());
        signature.eta = Some(Utc::now() + delay);

        warn!(
            "Task {} ({}) failed, retrying in {:?} ({} retries left): {}",
            signature.name, signature.uuid, signature.retry_delay, signature.retry_count, message
        );
        self.store(TaskState::new(&signature, TaskStatus::Retry)).await;

        if let Err(e) = self.broker.publish(signature.clone()).await {
            self.fail(&signature, format!("{} (retry not scheduled: {})", message, e)).await;
        }
    }

    async fn fail(&self, signature: &Signature, message: String) {
        self.store(TaskState::failure(signature, message.clone())).await;

        for callback in &signature.on_error {
            let mut callback = callback.clone();
            callback.args.insert(0, TaskArg::from(message.as_str()));
            self.publish(callback).await;
        }

        self.report(ServiceError::TaskFailed(format!(
            "{} ({}): {}",
            signature.name, signature.uuid, message
        )));
    }

    async fn publish(&self, signature: Signature) {
        if let Err(e) = self.broker.publish(signature).await {
            self.report(e);
        }
    }

    async fn store(&self, state: TaskState) {
        if let Err(e) = self.backend.set_state(state).await {
            self.report(e);
        }
    }

    /// Hands an error to the drain loop without blocking the task
    fn report(&self, error: ServiceError) {
        match self.errors.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(error)) => warn!("Task error channel full, dropping: {}", error),
            Err(TrySendError::Closed(error)) => warn!("Task error channel closed, dropping: {}", error),
        }
    }
}

/// Time left until the ETA of `signature`, if it is still ahead
fn until_eta(signature: &Signature) -> Option<std::time::Duration> {
    signature
        .eta
        .and_then(|eta| (eta - Utc::now()).to_std().ok())
        .filter(|wait| !wait.is_zero())
}

/// Logs every error a worker reports until shutdown
pub fn spawn_error_logger(
    mut errors: mpsc::Receiver<ServiceError>,
    mut shutdown: ShutdownReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = errors.recv() => match received {
                    Some(e) => error!(code = e.error_code(), "Task consumer: {}", e),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("Task error logger stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerManager;
    use crate::retry::RetryConfig;
    use crate::shutdown::ShutdownController;
    use crate::tasks::backend::{MemoryBroker, MemoryResultBackend};
    use crate::tasks::producer::{Producer, QueueProducer};
    use crate::tasks::signature::TaskRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const IDLE_POLL: Duration = Duration::from_millis(10);

    struct Harness {
        broker: Arc<MemoryBroker>,
        producer: QueueProducer,
        errors: mpsc::Receiver<ServiceError>,
        shutdown: ShutdownController,
        worker: JoinHandle<()>,
    }

    fn start(registry: TaskRegistry) -> Harness {
        start_with_concurrency(registry, 4)
    }

    fn start_with_concurrency(registry: TaskRegistry, concurrency: usize) -> Harness {
        let broker = Arc::new(MemoryBroker::new(16));
        let backend = Arc::new(MemoryResultBackend::new());
        let (errors_tx, errors) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = ShutdownController::new();

        let worker = Worker::new("test", "tasks", concurrency, broker.clone(), backend.clone(), registry, errors_tx);
        let worker = tokio::spawn(worker.run(shutdown_rx));

        let producer = QueueProducer::new(
            broker.clone(),
            backend,
            Arc::new(CircuitBreakerManager::new()),
            RetryConfig::default(),
            "tasks",
        )
        .with_poll_interval(IDLE_POLL);

        Harness {
            broker,
            producer,
            errors,
            shutdown,
            worker,
        }
    }

    fn builtin() -> TaskRegistry {
        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry);
        registry
    }

    async fn stop(harness: Harness) {
        harness.shutdown.shutdown();
        harness.worker.await.unwrap();
    }

    #[test]
    fn test_repeat_task() {
        assert_eq!(repeat(&[TaskArg::from("hello")]).unwrap()[0].as_str(), Some("hello"));
        assert!(repeat(&[]).is_err());
        assert!(repeat(&[TaskArg::from(1i64)]).is_err());
    }

    #[tokio::test]
    async fn test_repeat_runs_to_success() {
        let harness = start(builtin());

        let mut response = harness
            .producer
            .produce(TaskRequest::new("repeat").arg("hello"))
            .await
            .unwrap();
        response.subscribe(Duration::from_secs(1)).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.result().unwrap()[0].as_str(), Some("hello"));
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_unregistered_task_fails() {
        let mut harness = start(builtin());

        let mut response = harness.producer.produce(TaskRequest::new("missing")).await.unwrap();
        let result = response.subscribe(Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ServiceError::TaskFailed(_))));
        assert!(response.error().unwrap().contains("not registered"));
        assert!(matches!(harness.errors.recv().await, Some(ServiceError::TaskFailed(_))));
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_failed_task_is_retried() {
        let registry = TaskRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        registry.register("flaky", move |_args| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(vec![TaskArg::from(true)])
                }
            }
        });
        let harness = start(registry);

        let mut response = harness
            .producer
            .produce(TaskRequest::new("flaky").retry(2, Duration::from_millis(5)))
            .await
            .unwrap();
        response.subscribe(Duration::from_secs(1)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(response.is_success());
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_callbacks_receive_results_and_errors() {
        let registry = builtin();
        registry.register("boom", |_args| async { Err("exploded".to_string()) });
        let harness = start(registry);

        let mut ok = harness
            .producer
            .produce(
                TaskRequest::new("repeat")
                    .arg("hi")
                    .on_success(TaskRequest::new("notify").arg("first").routing_key("callbacks"))
                    .on_success(TaskRequest::new("audit").immutable().routing_key("callbacks")),
            )
            .await
            .unwrap();
        ok.subscribe(Duration::from_secs(1)).await.unwrap();

        let notify = harness.broker.receive("callbacks").await.unwrap();
        assert_eq!(notify.name, "notify");
        let args: Vec<_> = notify.args.iter().filter_map(TaskArg::as_str).collect();
        assert_eq!(args, vec!["first", "hi"]);

        let audit = harness.broker.receive("callbacks").await.unwrap();
        assert!(audit.args.is_empty());

        let mut failed = harness
            .producer
            .produce(
                TaskRequest::new("boom")
                    .on_error(TaskRequest::new("alert").arg("ctx").routing_key("callbacks")),
            )
            .await
            .unwrap();
        assert!(failed.subscribe(Duration::from_secs(1)).await.is_err());

        let alert = harness.broker.receive("callbacks").await.unwrap();
        let args: Vec<_> = alert.args.iter().filter_map(TaskArg::as_str).collect();
        assert_eq!(args, vec!["exploded", "ctx"]);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_eta_delays_execution() {
        let harness = start(builtin());
        let eta = Utc::now() + chrono::Duration::milliseconds(100);

        let mut response = harness
            .producer
            .produce(TaskRequest::new("repeat").arg("later").eta(eta))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        response.sync().await.unwrap();
        assert!(!response.is_completed());

        response.subscribe(Duration::from_secs(1)).await.unwrap();
        assert!(Utc::now() >= eta);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_delayed_task_does_not_hold_a_slot() {
        let harness = start_with_concurrency(builtin(), 1);

        let mut later = harness
            .producer
            .produce(
                TaskRequest::new("repeat")
                    .arg("later")
                    .eta(Utc::now() + chrono::Duration::seconds(3)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut now = harness
            .producer
            .produce(TaskRequest::new("repeat").arg("now"))
            .await
            .unwrap();
        now.subscribe(Duration::from_millis(500)).await.unwrap();
        assert_eq!(now.result().unwrap()[0].as_str(), Some("now"));

        let started = std::time::Instant::now();
        stop(harness).await;
        assert!(started.elapsed() < Duration::from_millis(500));

        // Parked task is failed once the worker stops
        let result = later.subscribe(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(ServiceError::TaskFailed(_))));
    }

    #[tokio::test]
    async fn test_error_logger_stops_on_shutdown() {
        let (tx, rx) = mpsc::channel(4);
        let (shutdown, shutdown_rx) = ShutdownController::new();
        let handle = spawn_error_logger(rx, shutdown_rx);

        tx.send(ServiceError::Broker("down".to_string())).await.unwrap();
        shutdown.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_started_after_shutdown_returns() {
        let (controller, receiver) = ShutdownController::new();
        controller.shutdown();
        let (errors_tx, _errors) = mpsc::channel(1);

        let worker = Worker::new(
            "late",
            "tasks",
            2,
            Arc::new(MemoryBroker::new(4)),
            Arc::new(MemoryResultBackend::new()),
            builtin(),
            errors_tx,
        );
        tokio::time::timeout(Duration::from_millis(200), worker.run(receiver.subscribe()))
            .await
            .unwrap();
    }
}
