use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

pub struct Metrics {
    pub registry: Registry,
    pub http_duration: HistogramVec,
    pub http_in_flight: IntGauge,
    pub grpc_requests: IntCounterVec,
    pub grpc_duration: HistogramVec,
    pub circuit_breaker_state: IntGaugeVec,
    pub retry_attempts: CounterVec,
    pub tasks_produced: IntCounterVec,
    pub tasks_processed: IntCounterVec,
    pub task_duration: HistogramVec,
    pub health_check_status: IntGaugeVec,
    pub pool_connections: IntCounterVec,
    pub log_messages: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

impl Metrics {
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            http_duration: HistogramVec::new(
                HistogramOpts::new("http_duration_seconds", "Duration of HTTP requests by route")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["method", "path", "status"],
            )?,
            http_in_flight: IntGauge::new("http_requests_in_flight", "HTTP requests being served")?,
            grpc_requests: IntCounterVec::new(
                Opts::new("grpc_requests_total", "Total gRPC requests by method and status code"),
                &["method", "code"],
            )?,
            grpc_duration: HistogramVec::new(
                HistogramOpts::new("grpc_request_duration_seconds", "Duration of gRPC requests")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["method"],
            )?,
            circuit_breaker_state: IntGaugeVec::new(
                Opts::new("circuit_breaker_state", "Circuit breaker state (0=closed, 1=open, 2=half-open)"),
                &["breaker"],
            )?,
            retry_attempts: CounterVec::new(
                Opts::new("retry_attempts_total", "Total retry attempts"),
                &["operation"],
            )?,
            tasks_produced: IntCounterVec::new(
                Opts::new("tasks_produced_total", "Tasks sent to the broker"),
                &["task", "status"],
            )?,
            tasks_processed: IntCounterVec::new(
                Opts::new("tasks_processed_total", "Tasks finished by the worker"),
                &["task", "status"],
            )?,
            task_duration: HistogramVec::new(
                HistogramOpts::new("task_duration_seconds", "Time spent running task handlers")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["task"],
            )?,
            health_check_status: IntGaugeVec::new(
                Opts::new("health_check_status", "Health check status (0=healthy, 1=failing)"),
                &["check"],
            )?,
            pool_connections: IntCounterVec::new(
                Opts::new("pool_connections_total", "Database pool connection events"),
                &["event"],
            )?,
            log_messages: IntCounterVec::new(
                Opts::new("log_messages", "Log events by level"),
                &["level"],
            )?,
            registry,
        };

        metrics.registry.register(Box::new(metrics.http_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.http_in_flight.clone()))?;
        metrics.registry.register(Box::new(metrics.grpc_requests.clone()))?;
        metrics.registry.register(Box::new(metrics.grpc_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.circuit_breaker_state.clone()))?;
        metrics.registry.register(Box::new(metrics.retry_attempts.clone()))?;
        metrics.registry.register(Box::new(metrics.tasks_produced.clone()))?;
        metrics.registry.register(Box::new(metrics.tasks_processed.clone()))?;
        metrics.registry.register(Box::new(metrics.task_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.health_check_status.clone()))?;
        metrics.registry.register(Box::new(metrics.pool_connections.clone()))?;
        metrics.registry.register(Box::new(metrics.log_messages.clone()))?;

        #[cfg(target_os = "linux")]
        metrics
            .registry
            .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(metrics)
    }

    /// Creates the process-wide metrics in a registry namespaced by `app_name`.
    /// Later calls return the already registered instance.
    pub fn init(app_name: &str) -> prometheus::Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let registry = Registry::new_custom(namespace(app_name), None)?;
        let metrics = Self::new(registry)?;
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| prometheus::Error::Msg("Metrics not initialized".to_string()))
    }

    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Text exposition of everything in the registry
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Prometheus names only allow `[a-zA-Z0-9_]` and must not start with a digit
pub fn namespace(app_name: &str) -> Option<String> {
    let mut name: String = app_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if name.is_empty() {
        return None;
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    Some(name)
}

pub fn observe_http_request(method: &str, path: &str, status: u16, duration: f64) {
    if let Some(metrics) = Metrics::get() {
        metrics
            .http_duration
            .with_label_values(&[method, path, &status.to_string()])
            .observe(duration);
    }
}

pub fn update_http_in_flight(delta: i64) {
    if let Some(metrics) = Metrics::get() {
        metrics.http_in_flight.add(delta);
    }
}

pub fn record_grpc_request(method: &str, code: tonic::Code, duration: f64) {
    if let Some(metrics) = Metrics::get() {
        metrics
            .grpc_requests
            .with_label_values(&[method, &format!("{:?}", code)])
            .inc();
        metrics.grpc_duration.with_label_values(&[method]).observe(duration);
    }
}

pub fn set_circuit_breaker_state(breaker: &str, value: i64) {
    if let Some(metrics) = Metrics::get() {
        metrics.circuit_breaker_state.with_label_values(&[breaker]).set(value);
    }
}

pub fn record_retry(operation: &str) {
    if let Some(metrics) = Metrics::get() {
        metrics.retry_attempts.with_label_values(&[operation]).inc();
    }
}

pub fn record_task_produced(task: &str, success: bool) {
    if let Some(metrics) = Metrics::get() {
        let status = if success { "success" } else { "failure" };
        metrics.tasks_produced.with_label_values(&[task, status]).inc();
    }
}

pub fn record_task_processed(task: &str, status: &str, duration: f64) {
    if let Some(metrics) = Metrics::get() {
        metrics.tasks_processed.with_label_values(&[task, status]).inc();
        metrics.task_duration.with_label_values(&[task]).observe(duration);
    }
}

pub fn set_health_check_status(check: &str, healthy: bool) {
    if let Some(metrics) = Metrics::get() {
        metrics
            .health_check_status
            .with_label_values(&[check])
            .set(if healthy { 0 } else { 1 });
    }
}

pub fn record_pool_event(event: &str) {
    if let Some(metrics) = Metrics::get() {
        metrics.pool_connections.with_label_values(&[event]).inc();
    }
}

pub fn record_log_message(level: &str) {
    if let Some(metrics) = Metrics::get() {
        metrics.log_messages.with_label_values(&[level]).inc();
    }
}
