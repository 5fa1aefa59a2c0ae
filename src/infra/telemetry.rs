use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_SKIP, METRIC_CACHE_STORE};
use crate::config::{LogFormat, LoggingSettings};
use crate::http::METRIC_HTTP_REQUEST_MS;
use crate::pubsub::METRIC_PUBSUB_DROPPED;
use crate::queue::{METRIC_QUEUE_ENQUEUED, METRIC_QUEUE_HANDLER_FAILED, METRIC_QUEUE_HANDLER_PANIC};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of response-cache misses."
        );
        describe_counter!(
            METRIC_CACHE_STORE,
            Unit::Count,
            "Total number of responses written to the cache."
        );
        describe_counter!(
            METRIC_CACHE_SKIP,
            Unit::Count,
            "Total number of responses not cached because of status or empty body."
        );
        describe_counter!(
            METRIC_PUBSUB_DROPPED,
            Unit::Count,
            "Total number of messages dropped because a subscriber buffer was full."
        );
        describe_counter!(
            METRIC_QUEUE_ENQUEUED,
            Unit::Count,
            "Total number of tasks accepted by a queue."
        );
        describe_counter!(
            METRIC_QUEUE_HANDLER_FAILED,
            Unit::Count,
            "Total number of task handlers that returned an error."
        );
        describe_counter!(
            METRIC_QUEUE_HANDLER_PANIC,
            Unit::Count,
            "Total number of task handlers that panicked."
        );
        describe_histogram!(
            METRIC_HTTP_REQUEST_MS,
            Unit::Milliseconds,
            "Request handling latency in milliseconds."
        );
    });
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
            access_log: false,
        };

        // Another test may already have installed a subscriber; either way the
        // last of two calls must fail.
        let _ = init(&logging);
        assert!(matches!(init(&logging), Err(InfraError::Telemetry(_))));
    }
}
