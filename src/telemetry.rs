//! Logging and metrics exporter setup for the daemon.
//!
//! `RUST_LOG` wins over `telemetry.log_level`. The Prometheus exporter only
//! exists with the `prometheus` feature and only starts when
//! `telemetry.prometheus_addr` is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Query and registration latencies are sub-millisecond on a healthy zone.
#[cfg(feature = "prometheus")]
const LATENCY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Install the global subscriber and, when configured, the metrics exporter.
pub fn init(config: &TelemetryConfig) -> InitResult {
    tracing_subscriber::registry()
        .with(log_filter(config)?)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    match config.prometheus_addr {
        #[cfg(feature = "prometheus")]
        Some(addr) => start_prometheus_exporter(addr)?,
        #[cfg(not(feature = "prometheus"))]
        Some(addr) => tracing::warn!(%addr, "prometheus_addr ignored, built without `prometheus`"),
        None => {}
    }

    Ok(())
}

fn log_filter(config: &TelemetryConfig) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))
}

#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(addr: std::net::SocketAddr) -> InitResult {
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration.seconds".to_string()), LATENCY_BUCKETS)?
        .install()?;

    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_log_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = TelemetryConfig {
            log_level: "discover_dns=loud".to_string(),
            prometheus_addr: None,
        };
        assert!(log_filter(&config).is_err());
    }

    #[test]
    fn test_default_level_parses() {
        assert!(log_filter(&TelemetryConfig::default()).is_ok());
    }
}
