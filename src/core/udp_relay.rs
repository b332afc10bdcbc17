//! UDP relay for one port mapping.
//!
//! A single socket bound to the listen port talks to both sides. Datagrams
//! whose sender is the backend go back to the most recently admitted client;
//! everything else is client traffic and goes through the flood detector.
//!
//! Only one client is remembered per port. With two concurrent clients on
//! the same port, backend replies go to whichever client sent last. This is
//! a known limitation of the relay and not a NAT table.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info};
use metrics::increment_counter;
use tokio::net::UdpSocket;

use crate::core::flood_detector::FloodDetector;
use crate::core::RelayError;

pub struct UdpRelay {
    socket: UdpSocket,
    local: SocketAddr,
    backend: SocketAddr,
    detector: Arc<FloodDetector>,
    buffer_size: usize,
    /// Last admitted client; replies from the backend go here
    client: Option<SocketAddr>,
}

impl UdpRelay {
    /// Bind the listen socket
    pub async fn bind(
        listen: SocketAddr,
        backend: SocketAddr,
        detector: Arc<FloodDetector>,
        buffer_size: usize,
    ) -> Result<Self, RelayError> {
        let bind_error = |source: io::Error| RelayError::Bind {
            protocol: "UDP",
            addr: listen,
            source,
        };
        let socket = UdpSocket::bind(listen).await.map_err(bind_error)?;
        let local = socket.local_addr().map_err(bind_error)?;

        Ok(Self {
            socket,
            local,
            backend,
            detector,
            buffer_size,
            client: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Relay datagrams until the socket fails
    pub async fn run(mut self) -> Result<(), RelayError> {
        let local = self.local;
        info!("[UDP] Listening on {} <-> {}", local, self.backend);

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP errors from an earlier send surface here on some platforms
                Err(e) if is_transient(&e) => {
                    debug!("[UDP] Ignoring transient error on {}: {}", local, e);
                    continue;
                }
                Err(source) => {
                    return Err(RelayError::Io {
                        protocol: "UDP",
                        addr: local,
                        source,
                    })
                }
            };

            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if from == self.backend {
            let Some(client) = self.client else {
                debug!("[UDP] No client yet, dropping {} bytes from backend {}", data.len(), from);
                return;
            };
            increment_counter!("forwarder_udp_datagrams_total", "direction" => "downstream");
            if let Err(e) = self.socket.send_to(data, client).await {
                error!("[UDP] Failed to send to client {}: {}", client, e);
            }
            return;
        }

        if !self.detector.admit(from.ip()) {
            debug!("[DDoS] Dropped packet from {}", from);
            return;
        }

        self.client = Some(from);
        increment_counter!("forwarder_udp_datagrams_total", "direction" => "upstream");
        if let Err(e) = self.socket.send_to(data, self.backend).await {
            error!("[UDP] Failed to send to backend {}: {}", self.backend, e);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
