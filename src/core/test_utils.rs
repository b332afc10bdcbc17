//! Shared helpers for the forwarder's unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::core::alert_dispatcher::{AlertSink, FloodAlert};
use crate::core::flood_detector::{FloodDetectionConfig, FloodDetector};
use crate::utils::ManualClock;

/// Sink that keeps every alert it receives
#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<FloodAlert>>,
}

impl RecordingSink {
    pub fn alerts(&self) -> Vec<FloodAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingSink {
    fn notify(&self, alert: FloodAlert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Detector with the given per-second limit on a clock that never moves,
/// so every packet of a test lands in the same window.
pub fn detector(limit: u32) -> (Arc<FloodDetector>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let config = FloodDetectionConfig {
        packets_per_second: limit,
        block_seconds: 30,
    };
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
    (
        Arc::new(FloodDetector::with_clock(config, sink.clone(), clock)),
        sink,
    )
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Receive one datagram, or `None` if nothing arrives in time
pub async fn recv_within(socket: &UdpSocket, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}
