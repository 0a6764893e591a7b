//! The local SOCKS gateway listener.
//!
//! Connections relayed back through the tunnel land here. Each one is
//! gated by [`SocksAuthenticator`] (credential + destination) before
//! the gateway dials the destination and relays bytes both ways.
//! Sessions never share mutable state; each runs start-to-finish in
//! its own task.

use outpost_core::keystore::KeyStore;
use outpost_core::socks::{self, SocksAuthenticator};
use outpost_core::{OutpostError, OutpostResult};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle to the running gateway.
pub struct SocksGateway {
    local_port: u16,
    cancel_tx: mpsc::Sender<()>,
}

impl SocksGateway {
    /// Bind and start accepting. Port 0 asks the OS for a free port.
    pub async fn start(port: u16, keystore: Arc<dyn KeyStore>) -> OutpostResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        tokio::spawn(accept_loop(listener, keystore, cancel_rx));
        info!(port = local_port, "SOCKS gateway started");

        Ok(Self {
            local_port,
            cancel_tx,
        })
    }

    /// The port the tunnel forward routes to.
    pub fn port(&self) -> u16 {
        self.local_port
    }

    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(()).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    keystore: Arc<dyn KeyStore>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("gateway accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "gateway connection accepted");
                        let keystore = Arc::clone(&keystore);
                        tokio::spawn(async move {
                            handle_connection(stream, keystore).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "gateway accept failed");
                    }
                }
            }
        }
    }
}

/// Gate one relayed connection, then relay it.
///
/// Dropping the stream on any rejection is the whole cleanup; the
/// authenticator has already written whatever failure bytes the
/// protocol calls for.
async fn handle_connection(mut stream: TcpStream, keystore: Arc<dyn KeyStore>) {
    let authenticator = SocksAuthenticator::new(&*keystore);
    let conn_id = authenticator.conn_id().to_string();

    let session = match authenticator.authenticate(&mut stream).await {
        Ok(session) => session,
        Err(OutpostError::NotSocks) => {
            debug!(conn = %conn_id, "dropping non-SOCKS connection");
            return;
        }
        Err(e) => {
            debug!(conn = %conn_id, error = %e, "session rejected");
            return;
        }
    };

    let target = match authenticator.authorize_connect(&mut stream, &session).await {
        Ok(target) => target,
        Err(e) => {
            debug!(conn = %conn_id, error = %e, "connect request denied");
            return;
        }
    };

    match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(mut upstream) => {
            if let Err(e) = socks::write_reply(&mut stream, socks::REP_SUCCEEDED).await {
                debug!(conn = %conn_id, error = %e, "reply write failed");
                return;
            }
            info!(conn = %conn_id, host = %target.host, port = target.port, "relaying");
            match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
                Ok((to_dest, from_dest)) => {
                    debug!(conn = %conn_id, to_dest, from_dest, "relay finished");
                }
                Err(e) => {
                    debug!(conn = %conn_id, error = %e, "relay ended with error");
                }
            }
        }
        Err(e) => {
            warn!(conn = %conn_id, host = %target.host, port = target.port, error = %e, "destination unreachable");
            let _ = socks::write_reply(&mut stream, socks::REP_HOST_UNREACHABLE).await;
        }
    }
}
