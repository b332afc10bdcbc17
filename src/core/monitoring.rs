//! Monitoring for the traffic forwarder.
//!
//! Registers metric descriptions, installs the Prometheus exporter and runs
//! a periodic loop that publishes the flood detector's table sizes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;
use tokio::time;

use crate::core::flood_detector::{DetectorStats, FloodDetector};
use crate::models::{MetricsConfig, MonitoringConfig};

/// Errors that can occur while setting up monitoring
#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("invalid metrics listen address {0:?}")]
    InvalidListenAddress(String),
    #[error("failed to install Prometheus exporter: {0}")]
    Exporter(#[from] BuildError),
}

/// Describe every metric the forwarder emits
pub fn describe_metrics() {
    describe_counter!("forwarder_packets_admitted_total", "Packets and connections admitted by the flood detector");
    describe_counter!("forwarder_packets_denied_total", "Packets and connections denied by the flood detector");
    describe_counter!("forwarder_blocks_total", "Sources blocked for flooding");
    describe_counter!("forwarder_udp_datagrams_total", "UDP datagrams relayed, by direction");
    describe_counter!("forwarder_tcp_connections_total", "Inbound TCP connections, by outcome");
    describe_counter!("forwarder_tcp_bytes_total", "TCP bytes relayed, by direction");
    describe_counter!("forwarder_alerts_total", "Backend notifications, by kind and outcome");
    describe_gauge!("forwarder_tracked_sources", "Source addresses with a traffic record");
    describe_gauge!("forwarder_blocked_sources", "Source addresses currently blocked");
}

/// Serve metrics over HTTP on the configured address
pub fn install_exporter(config: &MetricsConfig) -> Result<SocketAddr, MonitoringError> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|_| MonitoringError::InvalidListenAddress(config.listen.clone()))?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Serving Prometheus metrics on {}", addr);
    Ok(addr)
}

/// Monitoring service
pub struct Monitoring {
    detector: Arc<FloodDetector>,
    /// Monitoring configuration
    config: MonitoringConfig,
}

impl Monitoring {
    pub fn new(detector: Arc<FloodDetector>, config: MonitoringConfig) -> Self {
        Self { detector, config }
    }

    /// Publish detector gauges on every interval tick
    pub async fn start_monitoring(&self) {
        info!("Starting monitoring service...");
        let mut interval = time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));

        loop {
            interval.tick().await;
            self.record_detector_state();
        }
    }

    /// Publish the current table sizes and warn past the threshold
    pub fn record_detector_state(&self) -> DetectorStats {
        let stats = self.detector.stats();

        gauge!("forwarder_tracked_sources", stats.tracked_sources as f64);
        gauge!("forwarder_blocked_sources", stats.blocked_sources as f64);

        if stats.blocked_sources > self.config.blocked_sources_warning {
            warn!(
                "Blocked sources exceed threshold: {} (threshold: {})",
                stats.blocked_sources, self.config.blocked_sources_warning
            );
        }

        stats
    }
}
