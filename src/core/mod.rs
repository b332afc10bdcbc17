//! Core functionality for the traffic forwarder.
//!
//! This module contains the forwarder proper: the port mapping table,
//! flood detection, alert reporting, the UDP and TCP relays, and the
//! supervisor that runs them.

pub mod alert_dispatcher;
pub mod flood_detector;
pub mod monitoring;
pub mod port_map;
pub mod supervisor;
pub mod tcp_relay;
pub mod udp_relay;

#[cfg(test)]
pub(crate) mod test_utils;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop a single relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {protocol} relay on {addr}: {source}")]
    Bind {
        protocol: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{protocol} relay on {addr} failed: {source}")]
    Io {
        protocol: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub use alert_dispatcher::{AlertDispatcher, AlertSink, FloodAlert, LogOnlyAlertSink, ReportingClient};
pub use flood_detector::{BlockedSource, DetectorStats, FloodDetectionConfig, FloodDetector};
pub use monitoring::Monitoring;
pub use port_map::{PortMapping, PortMappingTable};
pub use supervisor::Supervisor;
pub use tcp_relay::TcpRelay;
pub use udp_relay::UdpRelay;
