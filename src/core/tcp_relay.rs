//! TCP relay for one port mapping.
//!
//! Every accepted connection is checked against the flood detector before a
//! backend connection is dialed. Admitted sessions run two byte pumps, one
//! per direction; when either pump stops, the other is aborted and both
//! connections close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use metrics::{counter, increment_counter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinError;

use crate::core::flood_detector::FloodDetector;
use crate::core::RelayError;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TcpRelay {
    listener: TcpListener,
    local: SocketAddr,
    backend: SocketAddr,
    detector: Arc<FloodDetector>,
    chunk_size: usize,
}

impl TcpRelay {
    /// Bind the listener with `SO_REUSEADDR` and the given backlog
    pub async fn bind(
        listen: SocketAddr,
        backend: SocketAddr,
        detector: Arc<FloodDetector>,
        backlog: u32,
        chunk_size: usize,
    ) -> Result<Self, RelayError> {
        let bind_error = |source: io::Error| RelayError::Bind {
            protocol: "TCP",
            addr: listen,
            source,
        };

        let socket = if listen.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(listen).map_err(bind_error)?;
        let listener = socket.listen(backlog).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            local,
            backend,
            detector,
            chunk_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), RelayError> {
        info!("[TCP] Listening on {} <-> {}", self.local, self.backend);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => self.handle_connection(stream, peer),
                Err(e) => {
                    warn!("[TCP] Accept failed on {}: {}", self.local, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn handle_connection(&self, client: TcpStream, peer: SocketAddr) {
        if !self.detector.admit(peer.ip()) {
            increment_counter!("forwarder_tcp_connections_total", "outcome" => "denied");
            debug!("[DDoS] Refused connection from {}", peer);
            return;
        }

        let backend = self.backend;
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            run_session(client, peer, backend, chunk_size).await;
        });
    }
}

async fn run_session(client: TcpStream, peer: SocketAddr, backend: SocketAddr, chunk_size: usize) {
    let upstream = match TcpStream::connect(backend).await {
        Ok(stream) => stream,
        Err(e) => {
            increment_counter!("forwarder_tcp_connections_total", "outcome" => "dial_failed");
            error!("[TCP] Connection to {} failed for {}: {}", backend, peer, e);
            return;
        }
    };
    increment_counter!("forwarder_tcp_connections_total", "outcome" => "established");
    info!("[TCP] New connection: {} -> {}", peer, backend);

    let (client_rd, client_wr) = client.into_split();
    let (backend_rd, backend_wr) = upstream.into_split();

    let mut to_backend = tokio::spawn(pump(client_rd, backend_wr, chunk_size, "upstream"));
    let mut to_client = tokio::spawn(pump(backend_rd, client_wr, chunk_size, "downstream"));

    // Aborting the surviving pump drops its socket halves, closing both sides
    tokio::select! {
        outcome = &mut to_backend => {
            to_client.abort();
            log_leg_end(peer, "client -> backend", outcome);
        }
        outcome = &mut to_client => {
            to_backend.abort();
            log_leg_end(peer, "backend -> client", outcome);
        }
    }
}

/// Copy bytes from `reader` to `writer` in chunks until end of stream
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    chunk_size: usize,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        counter!("forwarder_tcp_bytes_total", n as u64, "direction" => direction);
    }
}

fn log_leg_end(peer: SocketAddr, leg: &str, outcome: Result<io::Result<u64>, JoinError>) {
    match outcome {
        Ok(Ok(bytes)) => debug!("[TCP] {} closed {} after {} bytes", peer, leg, bytes),
        Ok(Err(e)) => debug!("[TCP] {} {} failed: {}", peer, leg, e),
        Err(e) => error!("[TCP] {} {} task failed: {}", peer, leg, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::{detector, loopback};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    /// Backend that echoes everything back and counts accepted connections
    async fn echo_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        (addr, accepted)
    }

    async fn start_relay(backend: SocketAddr, limit: u32) -> SocketAddr {
        let (detector, _sink) = detector(limit);
        let relay = TcpRelay::bind(loopback(), backend, detector, 5, 4096)
            .await
            .unwrap();
        let addr = relay.local_addr();
        tokio::spawn(relay.run());
        addr
    }

    async fn read_exact_within(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    /// True once the peer has closed the connection
    async fn closed_within(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(WAIT, stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (backend, accepted) = echo_backend().await;
        let relay = start_relay(backend, 50).await;

        let mut client = TcpStream::connect(relay).await.unwrap();
        client.write_all(b"hello through the relay").await.unwrap();
        assert_eq!(read_exact_within(&mut client, 23).await, b"hello through the relay");

        // Larger than one chunk, order preserved
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        assert_eq!(read_exact_within(&mut client, payload.len()).await, payload);

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_client_never_reaches_backend() {
        let (backend, accepted) = echo_backend().await;
        let relay = start_relay(backend, 1).await;

        let mut first = TcpStream::connect(relay).await.unwrap();
        first.write_all(b"ok").await.unwrap();
        assert_eq!(read_exact_within(&mut first, 2).await, b"ok");

        let mut second = TcpStream::connect(relay).await.unwrap();
        assert!(closed_within(&mut second).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dial_closes_client() {
        let unused = TcpListener::bind(loopback()).await.unwrap();
        let backend = unused.local_addr().unwrap();
        drop(unused);

        let relay = start_relay(backend, 50).await;
        let mut client = TcpStream::connect(relay).await.unwrap();

        assert!(closed_within(&mut client).await);
    }

    #[tokio::test]
    async fn test_backend_close_tears_down_session() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"bye").await;
            }
        });

        let relay = start_relay(backend, 50).await;
        let mut client = TcpStream::connect(relay).await.unwrap();

        assert_eq!(read_exact_within(&mut client, 3).await, b"bye");
        assert!(closed_within(&mut client).await);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_backend_leg() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let backend = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                let closed = matches!(
                    tokio::time::timeout(WAIT, stream.read(&mut buf)).await,
                    Ok(Ok(0)) | Ok(Err(_))
                );
                let _ = tx.send(closed);
            }
        });

        let relay = start_relay(backend, 50).await;
        let client = TcpStream::connect(relay).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        assert!(tokio::time::timeout(WAIT, rx).await.unwrap().unwrap());
    }
}
