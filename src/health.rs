use futures::future::{join_all, ready, BoxFuture, FutureExt, Ready};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::repository::VisitRepository;
use crate::shutdown::ShutdownReceiver;

pub type CheckResult = Result<(), String>;

type Check = Arc<dyn Fn() -> BoxFuture<'static, CheckResult> + Send + Sync>;

/// Outcome of one probe: every check by name, "OK" or its error
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    #[serde(skip)]
    pub healthy: bool,
    #[serde(flatten)]
    pub checks: BTreeMap<String, String>,
}

/// Named liveness and readiness checks. Readiness also runs the liveness
/// checks, so a dead process is never reported ready.
pub struct HealthChecker {
    liveness: RwLock<Vec<(String, Check)>>,
    readiness: RwLock<Vec<(String, Check)>>,
    timeout: Duration,
}

fn boxed<F, Fut>(check: F) -> Check
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CheckResult> + Send + 'static,
{
    Arc::new(move || check().boxed())
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            liveness: RwLock::new(Vec::new()),
            readiness: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn add_liveness_check<F, Fut>(&self, name: &str, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CheckResult> + Send + 'static,
    {
        debug!("Registered liveness check: {}", name);
        self.liveness.write().push((name.to_string(), boxed(check)));
    }

    pub fn add_readiness_check<F, Fut>(&self, name: &str, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CheckResult> + Send + 'static,
    {
        debug!("Registered readiness check: {}", name);
        self.readiness.write().push((name.to_string(), boxed(check)));
    }

    pub async fn live(&self) -> HealthReport {
        let checks = self.liveness.read().clone();
        self.run(checks).await
    }

    pub async fn ready(&self) -> HealthReport {
        let mut checks = self.liveness.read().clone();
        checks.extend(self.readiness.read().iter().cloned());
        self.run(checks).await
    }

    async fn run(&self, checks: Vec<(String, Check)>) -> HealthReport {
        let timeout = self.timeout;

        let results = join_all(checks.into_iter().map(|(name, check)| async move {
            let result = match tokio::time::timeout(timeout, check()).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            };
            (name, result)
        }))
        .await;

        let mut report = HealthReport {
            healthy: true,
            checks: BTreeMap::new(),
        };

        for (name, result) in results {
            crate::metrics::set_health_check_status(&name, result.is_ok());
            let text = match result {
                Ok(()) => "OK".to_string(),
                Err(error) => {
                    warn!("Health check '{}' failed: {}", name, error);
                    report.healthy = false;
                    error
                }
            };
            report.checks.insert(name, text);
        }

        report
    }
}

/// Always fails with `error`. Registered when a component cannot start.
pub fn permanent_failure(error: impl Into<String>) -> impl Fn() -> Ready<CheckResult> + Send + Sync + 'static {
    let error = error.into();
    move || ready(Err(error.clone()))
}

/// Runs `check` every `interval` in the background and answers from the last
/// result. Fails until the first run completes.
pub fn cached<F, Fut>(
    check: F,
    interval: Duration,
    mut shutdown: ShutdownReceiver,
) -> (impl Fn() -> Ready<CheckResult> + Send + Sync + 'static, JoinHandle<()>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CheckResult> + Send + 'static,
{
    let last: Arc<RwLock<CheckResult>> = Arc::new(RwLock::new(Err("no data yet".to_string())));

    let writer = last.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = check().await;
                    *writer.write() = result;
                }
                _ = shutdown.recv() => break,
            }
        }
    });

    let reader = move || ready(last.read().clone());
    (reader, handle)
}

/// Fails when the store does not answer a ping
pub fn database_check(
    repository: Arc<dyn VisitRepository>,
) -> impl Fn() -> BoxFuture<'static, CheckResult> + Send + Sync + 'static {
    move || {
        let repository = repository.clone();
        async move { repository.ping().await.map_err(|e| e.to_string()) }.boxed()
    }
}

/// Fails when more than `threshold` requests are being served at once
pub fn in_flight_check(
    in_flight: Arc<AtomicUsize>,
    threshold: usize,
) -> impl Fn() -> Ready<CheckResult> + Send + Sync + 'static {
    move || {
        let current = in_flight.load(Ordering::Relaxed);
        if current > threshold {
            ready(Err(format!(
                "too many requests in flight ({} > {})",
                current, threshold
            )))
        } else {
            ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryVisitRepository;
    use crate::shutdown::ShutdownController;

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_empty_checker_is_healthy() {
        let checker = checker();
        assert!(checker.live().await.healthy);
        assert!(checker.ready().await.healthy);
    }

    #[tokio::test]
    async fn test_ready_includes_liveness() {
        let checker = checker();
        checker.add_liveness_check("process", permanent_failure("boom"));
        checker.add_readiness_check("database", database_check(Arc::new(MemoryVisitRepository::new())));

        let live = checker.live().await;
        assert!(!live.healthy);
        assert_eq!(live.checks.len(), 1);

        let ready = checker.ready().await;
        assert!(!ready.healthy);
        assert_eq!(ready.checks["process"], "boom");
        assert_eq!(ready.checks["database"], "OK");
    }

    #[tokio::test]
    async fn test_slow_check_times_out() {
        let checker = checker();
        checker.add_readiness_check("slow", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });

        let report = checker.ready().await;
        assert!(!report.healthy);
        assert!(report.checks["slow"].starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_in_flight_threshold() {
        let counter = Arc::new(AtomicUsize::new(0));
        let check = in_flight_check(counter.clone(), 2);

        assert!(check().await.is_ok());
        counter.store(3, Ordering::Relaxed);
        assert!(check().await.is_err());
    }

    #[tokio::test]
    async fn test_cached_check_refreshes() {
        let (controller, receiver) = ShutdownController::new();
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = healthy.clone();

        let (check, handle) = cached(
            move || {
                let ok = flag.load(Ordering::Relaxed);
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err("down".to_string())
                    }
                }
            },
            Duration::from_millis(10),
            receiver,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(check().await.is_ok());

        healthy.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(check().await, Err("down".to_string()));

        controller.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cached_check_started_after_shutdown_stops() {
        let (controller, receiver) = ShutdownController::new();
        controller.shutdown();

        let (_check, handle) = cached(|| async { Ok(()) }, Duration::from_millis(10), receiver.subscribe());
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_report_serializes_as_flat_map() {
        let mut checks = BTreeMap::new();
        checks.insert("database".to_string(), "OK".to_string());
        let report = HealthReport { healthy: true, checks };

        assert_eq!(serde_json::to_string(&report).unwrap(), r#"{"database":"OK"}"#);
    }
}
