//! Tunnel transport: the single outbound forwarding session to the
//! broker.
//!
//! The carrying socket arrives already connected and already secured
//! by an outer layer; the transport only needs a dial abstraction, so
//! [`PreconnectedDial`] wraps the given stream and hands it out from
//! `dial()` exactly once. Identity is proven with an Ed25519 private
//! key; the session username is a fixed placeholder because real
//! authorization happens at the SOCKS layer. No remote host identity
//! is verified; host keys are obtainable by anyone and provide no
//! trust boundary here.
//!
//! After `AuthOk` the session cipher is renegotiated to `none`:
//! encrypting again inside an already-secured carrier is redundant.
//! One remote forward is installed per session (broker-visible port →
//! local SOCKS gateway port), then a mux loop relays broker-opened
//! channels to the gateway until the session closes.

use ed25519_dalek::SigningKey;
use outpost_core::auth;
use outpost_core::codec::{read_frame, write_frame};
use outpost_core::messages::{CipherChoice, TunnelMessage, PROTOCOL_VERSION, TUNNEL_USERNAME};
use outpost_core::{OutpostError, OutpostResult};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Dial abstraction the transport connects through.
#[allow(async_fn_in_trait)]
pub trait TunnelDial {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&mut self) -> OutpostResult<Self::Stream>;
}

/// Wraps an already-established bidirectional stream as a dialer.
///
/// The transport believes it is dialing while it is actually reusing
/// the connection the outer layer secured and handed in.
pub struct PreconnectedDial<S> {
    stream: Option<S>,
}

impl<S> PreconnectedDial<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S> TunnelDial for PreconnectedDial<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn dial(&mut self) -> OutpostResult<S> {
        self.stream
            .take()
            .ok_or_else(|| OutpostError::Other("carrying socket already consumed".into()))
    }
}

/// The agent's asymmetric identity credential, loaded at construction.
pub struct TunnelIdentity {
    signing_key: SigningKey,
}

impl TunnelIdentity {
    /// Load an Ed25519 private key from an OpenSSH-format key file.
    pub fn from_openssh_file(path: &Path) -> OutpostResult<Self> {
        info!(path = %path.display(), "loading tunnel private key");
        let pem = std::fs::read_to_string(path)?;
        let key = ssh_key::PrivateKey::from_openssh(&pem)
            .map_err(|e| OutpostError::AuthFailed(format!("cannot parse private key: {e}")))?;
        let keypair = key.key_data().ed25519().ok_or_else(|| {
            OutpostError::AuthFailed("private key is not Ed25519".into())
        })?;
        let signing_key = auth::signing_key_from_bytes(&keypair.private.to_bytes())?;
        Ok(Self { signing_key })
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

/// The one forward mapping a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardMapping {
    /// Broker-visible port.
    pub remote_port: u16,
    /// Local SOCKS gateway port the forward routes to.
    pub local_port: u16,
}

/// Establishes the outbound session and installs the forward.
pub struct TunnelTransport {
    identity: TunnelIdentity,
    local_gateway_port: u16,
    remote_forward_port: u16,
}

impl TunnelTransport {
    pub fn new(identity: TunnelIdentity, local_gateway_port: u16, remote_forward_port: u16) -> Self {
        Self {
            identity,
            local_gateway_port,
            remote_forward_port,
        }
    }

    /// Connect, authenticate, and install the remote forward.
    ///
    /// Any handshake or connect failure surfaces as a single wrapped
    /// connection error carrying the underlying cause; retry policy
    /// belongs to the caller.
    pub async fn connect<D: TunnelDial>(&self, dial: D) -> OutpostResult<TunnelSession> {
        self.establish(dial).await.map_err(OutpostError::into_connection)
    }

    async fn establish<D: TunnelDial>(&self, mut dial: D) -> OutpostResult<TunnelSession> {
        let mut stream = dial.dial().await?;

        // The protocol mandates a cipher for the handshake phase.
        write_frame(
            &mut stream,
            &TunnelMessage::ClientHello {
                version: PROTOCOL_VERSION.to_string(),
                username: TUNNEL_USERNAME.to_string(),
                cipher: CipherChoice::Aes128Ctr,
            },
        )
        .await?;

        let (session_id, nonce) = match read_frame(&mut stream).await? {
            TunnelMessage::ServerChallenge { session_id, nonce } => (session_id, nonce),
            other => {
                return Err(OutpostError::InvalidMessage(format!(
                    "expected server challenge, got {other:?}"
                )))
            }
        };

        let challenge = auth::Challenge {
            session_id: &session_id,
            nonce: &nonce,
        };
        let signature = challenge.sign(&self.identity.signing_key);
        write_frame(
            &mut stream,
            &TunnelMessage::Authenticate {
                public_key: self.identity.signing_key.verifying_key().to_bytes().to_vec(),
                signature,
            },
        )
        .await?;

        match read_frame(&mut stream).await? {
            TunnelMessage::AuthOk => {}
            TunnelMessage::AuthFail { reason } => {
                return Err(OutpostError::AuthFailed(reason));
            }
            other => {
                return Err(OutpostError::InvalidMessage(format!(
                    "expected auth result, got {other:?}"
                )))
            }
        }

        // Authenticated: turn the session cipher off for both
        // directions. The carrying socket is already secured.
        debug!(session = %session_id, "setting session cipher to 'none'");
        write_frame(
            &mut stream,
            &TunnelMessage::CipherUpdate {
                cipher: CipherChoice::None,
            },
        )
        .await?;

        write_frame(
            &mut stream,
            &TunnelMessage::ForwardRequest {
                remote_port: self.remote_forward_port,
                target_port: self.local_gateway_port,
            },
        )
        .await?;

        let forward = match read_frame(&mut stream).await? {
            TunnelMessage::ForwardOk { remote_port } => ForwardMapping {
                remote_port,
                local_port: self.local_gateway_port,
            },
            TunnelMessage::ForwardFail { reason } => {
                return Err(OutpostError::Other(format!("forward refused: {reason}")));
            }
            other => {
                return Err(OutpostError::InvalidMessage(format!(
                    "expected forward result, got {other:?}"
                )))
            }
        };

        info!(
            session = %session_id,
            remote_port = forward.remote_port,
            local_port = forward.local_port,
            "tunnel connected, remote forward installed"
        );

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let local_port = self.local_gateway_port;
        let task = tokio::spawn(async move {
            mux_loop(stream, cancel_rx, local_port).await;
            debug!("tunnel mux loop ended");
        });

        Ok(TunnelSession {
            cancel_tx,
            task,
            forward,
        })
    }
}

/// A live tunnel session. Fully up until closed; no partial-shutdown
/// state exists.
#[derive(Debug)]
pub struct TunnelSession {
    cancel_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
    forward: ForwardMapping,
}

impl TunnelSession {
    pub fn forward(&self) -> ForwardMapping {
        self.forward
    }

    /// Tear the session down: send `Disconnect`, cancel the mux loop,
    /// release the carrying socket. In-flight channels fail.
    pub async fn close(&mut self) {
        let _ = self.cancel_tx.send(()).await;
        let _ = (&mut self.task).await;
        info!(
            remote_port = self.forward.remote_port,
            "tunnel closed, forward removed"
        );
    }

    /// Run until the broker ends the session.
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }
}

/// Relay loop multiplexing broker-opened channels onto local gateway
/// connections.
///
/// Frame decoding runs in a dedicated reader task; every primitive in
/// the select below is cancel-safe, so a lost select race never drops
/// a half-read frame and the cancel signal stays observable no matter
/// what the channels are doing.
async fn mux_loop<S>(stream: S, mut cancel_rx: mpsc::Receiver<()>, local_port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (rd, mut wr) = tokio::io::split(stream);
    let mut channels: HashMap<u32, mpsc::Sender<Vec<u8>>> = HashMap::new();
    // Frames produced by per-channel relay tasks, serialized here.
    let (out_tx, mut out_rx) = mpsc::channel::<TunnelMessage>(64);
    let (in_tx, mut in_rx) = mpsc::channel::<TunnelMessage>(64);
    let reader = tokio::spawn(read_loop(rd, in_tx));

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                let _ = write_frame(&mut wr, &TunnelMessage::Disconnect).await;
                break;
            }
            Some(msg) = out_rx.recv() => {
                if let TunnelMessage::ChannelClose { channel_id } = msg {
                    channels.remove(&channel_id);
                }
                if let Err(e) = write_frame(&mut wr, &msg).await {
                    warn!(error = %e, "tunnel write failed");
                    break;
                }
            }
            incoming = in_rx.recv() => {
                let Some(msg) = incoming else {
                    // Reader ended: carrier closed or stream desynced.
                    break;
                };
                match msg {
                    TunnelMessage::ChannelOpen { channel_id } => {
                        match TcpStream::connect(("127.0.0.1", local_port)).await {
                            Ok(local) => {
                                debug!(channel_id, local_port, "channel opened to gateway");
                                let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(64);
                                channels.insert(channel_id, data_tx);
                                let out_tx = out_tx.clone();
                                tokio::spawn(async move {
                                    channel_relay(local, data_rx, out_tx, channel_id).await;
                                });
                            }
                            Err(e) => {
                                warn!(channel_id, error = %e, "gateway connect failed");
                                let _ = write_frame(&mut wr, &TunnelMessage::ChannelClose { channel_id }).await;
                            }
                        }
                    }
                    TunnelMessage::ChannelData { channel_id, data } => {
                        // A stalled relay must never park the mux, so
                        // delivery is non-blocking; a channel that
                        // cannot drain its backlog is torn down.
                        if let Some(tx) = channels.get(&channel_id) {
                            match tx.try_send(data) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(channel_id, "channel backlog full, closing channel");
                                    channels.remove(&channel_id);
                                    let _ = write_frame(&mut wr, &TunnelMessage::ChannelClose { channel_id }).await;
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    debug!(channel_id, "channel relay already ended");
                                    channels.remove(&channel_id);
                                }
                            }
                        } else {
                            debug!(channel_id, "data for unknown channel, dropping");
                        }
                    }
                    TunnelMessage::ChannelClose { channel_id } => {
                        // Dropping the sender ends the relay task.
                        channels.remove(&channel_id);
                    }
                    TunnelMessage::Disconnect => {
                        info!("broker disconnected the session");
                        break;
                    }
                    other => {
                        warn!(message = ?other, "unexpected tunnel message");
                    }
                }
            }
        }
    }
    reader.abort();
    // Dropping the channel map cancels every in-flight relay.
}

/// Decode frames off the carrier and hand them to the mux loop. Owns
/// the read half so no partial read is ever abandoned.
async fn read_loop<R>(mut rd: R, in_tx: mpsc::Sender<TunnelMessage>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame::<_, TunnelMessage>(&mut rd).await {
            Ok(msg) => {
                if in_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "tunnel read failed");
                break;
            }
        }
    }
}

/// Bidirectional relay between one mux channel and one local gateway
/// connection.
async fn channel_relay(
    local: TcpStream,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<TunnelMessage>,
    channel_id: u32,
) {
    let (mut read_half, mut write_half) = local.into_split();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(channel_id, "gateway closed connection");
                        let _ = out_tx.send(TunnelMessage::ChannelClose { channel_id }).await;
                        break;
                    }
                    Ok(n) => {
                        let msg = TunnelMessage::ChannelData {
                            channel_id,
                            data: buf[..n].to_vec(),
                        };
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel_id, error = %e, "gateway read error");
                        let _ = out_tx.send(TunnelMessage::ChannelClose { channel_id }).await;
                        break;
                    }
                }
            }
            data = data_rx.recv() => {
                match data {
                    Some(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            warn!(channel_id, error = %e, "gateway write error");
                            let _ = out_tx.send(TunnelMessage::ChannelClose { channel_id }).await;
                            break;
                        }
                    }
                    // Channel torn down on the broker side.
                    None => break,
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
}
