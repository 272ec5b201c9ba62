use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownReceiver) {
        let (tx, rx) = broadcast::channel(1);
        let triggered = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                triggered: triggered.clone(),
            },
            ShutdownReceiver { rx, triggered },
        )
    }

    /// Signals every receiver. Returns false when shutdown was already
    /// triggered.
    pub fn shutdown(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn receiver(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
            triggered: self.triggered.clone(),
        }
    }
}

pub struct ShutdownReceiver {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownReceiver {
    /// Resolves once shutdown has been triggered, also when that happened
    /// before this receiver was created. Cancel safe.
    pub async fn recv(&mut self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.rx.recv().await;
    }

    pub async fn wait_for_shutdown(mut self) {
        self.recv().await
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.rx.resubscribe(),
            triggered: self.triggered.clone(),
        }
    }
}

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Stops registered tasks, then runs the wishlist of shutdown hooks in the
/// order they were added.
pub struct GracefulShutdown {
    tasks: Vec<(String, JoinHandle<()>)>,
    hooks: Vec<(String, Hook)>,
    controller: ShutdownController,
}

impl GracefulShutdown {
    pub fn new(controller: ShutdownController) -> Self {
        Self {
            tasks: Vec::new(),
            hooks: Vec::new(),
            controller,
        }
    }

    pub fn register_task(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.push((name.into(), handle));
    }

    pub fn add_hook<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.push((name.into(), Box::new(move || hook().boxed())));
    }

    pub async fn shutdown(self, timeout: Duration) {
        info!("Initiating graceful shutdown...");
        let deadline = Instant::now() + timeout;

        // Signal all tasks to shutdown
        self.controller.shutdown();

        let tasks = async {
            for (name, handle) in self.tasks {
                match handle.await {
                    Ok(_) => info!("Task '{}' shut down successfully", name),
                    Err(e) => error!("Task '{}' panicked during shutdown: {:?}", name, e),
                }
            }
        };

        match tokio::time::timeout_at(deadline, tasks).await {
            Ok(_) => info!("All tasks shut down successfully"),
            Err(_) => warn!("Shutdown timeout exceeded, some tasks may not have completed cleanly"),
        }

        for (name, hook) in self.hooks {
            match tokio::time::timeout_at(deadline, hook()).await {
                Ok(Ok(())) => info!("Shutdown hook '{}' completed", name),
                Ok(Err(e)) => error!("Shutdown hook '{}' failed: {}", name, e),
                Err(_) => warn!("Shutdown hook '{}' did not finish before the deadline", name),
            }
        }
    }
}

async fn next_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = interrupt.recv() => Ok("SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

/// Triggers `controller` on the first SIGINT/SIGTERM. Later signals are
/// logged and ignored.
pub fn setup_signal_handlers(controller: ShutdownController) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match next_signal().await {
                Ok(name) if controller.shutdown() => info!("Received {}, shutting down", name),
                Ok(name) => warn!("Received {} while already shutting down, ignoring", name),
                Err(e) => {
                    error!("Failed to install signal handlers: {}", e);
                    break;
                }
            }
        }
    })
}
