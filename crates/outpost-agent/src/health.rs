//! Liveness-check responder.
//!
//! Infrastructure probes connect, send an HTTP request naming
//! `/healthcheck`, and get a fixed `200 OK` back. Runs as a
//! cancellable task: an accept loop selecting on a 1-slot cancel
//! channel, no thread subclassing.

use outpost_core::OutpostResult;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HEALTH_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
Server: outpost-agent\r\n\
Cache-Control: no-cache\r\n\
Pragma: no-cache\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
\r\n\
ok\r\n";

/// Handle to a running health-check responder.
pub struct HealthCheckResponder {
    local_port: u16,
    cancel_tx: mpsc::Sender<()>,
}

impl HealthCheckResponder {
    /// Bind and start serving. Port 0 asks the OS for a free port.
    pub async fn start(port: u16) -> OutpostResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        tokio::spawn(accept_loop(listener, cancel_rx));
        info!(port = local_port, "healthcheck responder started");

        Ok(Self {
            local_port,
            cancel_tx,
        })
    }

    /// The port probes should target. Consumed when system rules are
    /// layered on top of the administrator-defined rule set.
    pub fn port(&self) -> u16 {
        self.local_port
    }

    /// Stop accepting probes.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(()).await;
    }
}

async fn accept_loop(listener: TcpListener, mut cancel_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("healthcheck accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        debug!(peer = %peer, "healthcheck probe");
                        tokio::spawn(async move {
                            if let Err(e) = handle_probe(socket).await {
                                warn!(error = %e, "healthcheck probe failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "healthcheck accept failed");
                    }
                }
            }
        }
    }
}

/// Read request lines until one names `/healthcheck` (or the peer
/// stops sending), then answer with the fixed response.
async fn handle_probe(socket: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.contains("/healthcheck") {
            debug!("healthcheck request found");
            break;
        }
        if line.is_empty() {
            break;
        }
    }

    write_half.write_all(HEALTH_RESPONSE.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn probe(port: u16) -> String {
        let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        socket
            .write_all(b"GET /healthcheck HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn responds_ok_to_healthcheck_request() {
        let responder = HealthCheckResponder::start(0).await.unwrap();
        let response = probe(responder.port()).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok\r\n"));
        responder.shutdown().await;
    }

    #[tokio::test]
    async fn serves_multiple_probes() {
        let responder = HealthCheckResponder::start(0).await.unwrap();
        for _ in 0..3 {
            let response = probe(responder.port()).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"));
        }
        responder.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let responder = HealthCheckResponder::start(0).await.unwrap();
        let port = responder.port();
        responder.shutdown().await;

        // Give the accept loop a moment to observe the cancel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = TcpStream::connect(("127.0.0.1", port)).await;
        match result {
            Err(_) => {}
            Ok(mut socket) => {
                // Connection may still land in the backlog; it must
                // not be served.
                socket.write_all(b"GET /healthcheck\r\n\r\n").await.ok();
                let mut buf = Vec::new();
                let n = socket.read_to_end(&mut buf).await.unwrap_or(0);
                assert_eq!(n, 0);
            }
        }
    }
}
