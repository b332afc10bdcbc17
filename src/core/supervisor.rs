//! Startup orchestration.
//!
//! Starts one UDP relay and one TCP relay per port mapping. Each relay runs
//! on its own task, so a bind failure or runtime error on one mapping only
//! stops that relay.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{error, info, warn};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::core::flood_detector::FloodDetector;
use crate::core::port_map::{PortMapping, PortMappingTable};
use crate::core::tcp_relay::TcpRelay;
use crate::core::udp_relay::UdpRelay;
use crate::core::RelayError;
use crate::models::ForwarderConfig;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid listen host {0:?}")]
    ListenHost(String),
    #[error("could not resolve backend host {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("backend host {0:?} resolved to no addresses")]
    NoBackendAddress(String),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("every relay has stopped")]
    AllRelaysStopped,
}

#[derive(Debug, Clone, Copy)]
enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

struct RelayExit {
    protocol: Protocol,
    mapping: PortMapping,
    outcome: Result<Result<(), RelayError>, JoinError>,
}

pub struct Supervisor {
    settings: ForwarderConfig,
    mappings: PortMappingTable,
    detector: Arc<FloodDetector>,
}

impl Supervisor {
    pub fn new(
        settings: ForwarderConfig,
        mappings: PortMappingTable,
        detector: Arc<FloodDetector>,
    ) -> Self {
        Self {
            settings,
            mappings,
            detector,
        }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), SupervisorError> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Run until `shutdown` resolves.
    ///
    /// Returns `AllRelaysStopped` if every relay ends before that.
    /// In-flight sessions are abandoned when this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = Result<&'static str, io::Error>>,
    {
        let listen_ip: IpAddr = self
            .settings
            .listen_host
            .parse()
            .map_err(|_| SupervisorError::ListenHost(self.settings.listen_host.clone()))?;
        let backend_ip = resolve_backend(&self.settings.backend_host).await?;

        let mut relays = FuturesUnordered::new();
        for mapping in self.mappings.iter().copied() {
            let listen = SocketAddr::new(listen_ip, mapping.listen_port);
            let backend = SocketAddr::new(backend_ip, mapping.backend_port);

            let detector = Arc::clone(&self.detector);
            let buffer_size = self.settings.udp_buffer_size;
            let udp = tokio::spawn(async move {
                UdpRelay::bind(listen, backend, detector, buffer_size)
                    .await?
                    .run()
                    .await
            });
            relays.push(watch(Protocol::Udp, mapping, udp));

            let detector = Arc::clone(&self.detector);
            let backlog = self.settings.tcp_backlog;
            let chunk_size = self.settings.tcp_chunk_size;
            let tcp = tokio::spawn(async move {
                TcpRelay::bind(listen, backend, detector, backlog, chunk_size)
                    .await?
                    .run()
                    .await
            });
            relays.push(watch(Protocol::Tcp, mapping, tcp));
        }
        info!("Started relays for {} port mappings", self.mappings.len());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    let signal = signal.map_err(SupervisorError::Signal)?;
                    info!("Received {}, stopping forwarder", signal);
                    return Ok(());
                }
                Some(exit) = relays.next() => {
                    report_exit(&exit);
                    if relays.is_empty() {
                        return Err(SupervisorError::AllRelaysStopped);
                    }
                }
            }
        }
    }
}

fn watch(
    protocol: Protocol,
    mapping: PortMapping,
    handle: JoinHandle<Result<(), RelayError>>,
) -> impl Future<Output = RelayExit> {
    async move {
        RelayExit {
            protocol,
            mapping,
            outcome: handle.await,
        }
    }
}

fn report_exit(exit: &RelayExit) {
    let (protocol, listen, backend) = (
        exit.protocol.as_str(),
        exit.mapping.listen_port,
        exit.mapping.backend_port,
    );
    match &exit.outcome {
        Ok(Ok(())) => warn!("[{}] Relay {} -> {} stopped", protocol, listen, backend),
        Ok(Err(e)) => error!("[{}] Error on port {}: {}", protocol, listen, e),
        Err(e) => error!("[{}] Relay task for port {} failed: {}", protocol, listen, e),
    }
}

async fn resolve_backend(host: &str) -> Result<IpAddr, SupervisorError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| SupervisorError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| SupervisorError::NoBackendAddress(host.to_string()))
}

/// Wait for SIGTERM or SIGINT and return the name of the signal.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str, io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str, io::Error> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
