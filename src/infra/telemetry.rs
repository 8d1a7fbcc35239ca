use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so the `resolve` command can write the document to stdout.
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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
            "vitae_cache_hit_total",
            Unit::Count,
            "Total number of fresh value-cache hits."
        );
        describe_counter!(
            "vitae_cache_stale_hit_total",
            Unit::Count,
            "Total number of stale value-cache hits served while revalidating."
        );
        describe_counter!(
            "vitae_cache_miss_total",
            Unit::Count,
            "Total number of value-cache misses, labelled by reason."
        );
        describe_counter!(
            "vitae_cache_evict_total",
            Unit::Count,
            "Total number of value-cache evictions due to the size budget."
        );
        describe_counter!(
            "vitae_cache_revalidate_failed_total",
            Unit::Count,
            "Total number of failed background revalidations."
        );
        describe_counter!(
            "vitae_response_cache_hit_total",
            Unit::Count,
            "Total number of API response-cache hits."
        );
        describe_counter!(
            "vitae_response_cache_miss_total",
            Unit::Count,
            "Total number of API response-cache misses."
        );
        describe_counter!(
            "vitae_response_cache_invalidate_total",
            Unit::Count,
            "Total number of API response-cache invalidations after writes."
        );
    });
}
