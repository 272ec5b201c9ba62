use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LogFormat;

/// Counts every event that passes the filter into `log_messages{level}`.
/// Counting starts once the metrics registry exists.
pub struct LogLevelCounter;

impl<S: Subscriber> Layer<S> for LogLevelCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        crate::metrics::record_log_message(level_label(event.metadata().level()));
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// Default directive when RUST_LOG is unset: our crate at `level`, noisy
/// dependencies at warn.
pub fn default_directive(level: &str) -> String {
    format!(
        "warn,visit_service={level},tower_http={level},h2=warn,hyper=warn",
        level = level
    )
}

pub fn init(format: LogFormat, level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let registry = tracing_subscriber::registry().with(filter).with(LogLevelCounter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_labels() {
        assert_eq!(level_label(&Level::WARN), "warning");
        assert_eq!(level_label(&Level::ERROR), "error");
    }

    #[test]
    fn test_default_directive() {
        let directive = default_directive("debug");
        assert!(directive.contains("visit_service=debug"));
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}
