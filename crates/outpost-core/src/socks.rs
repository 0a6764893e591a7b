//! Per-connection SOCKS5 credential-and-destination gate.
//!
//! Every connection the broker relays back through the tunnel lands
//! here before a single byte is forwarded. The handshake is the
//! RFC1929 username/password subset of SOCKS5 with two twists:
//!
//! - the username field carries free-form JSON audit metadata, used
//!   only for logging and never required for authentication;
//! - the password field is the passkey selecting which rule's
//!   allow-set governs the session.
//!
//! Anything that is not a SOCKS5 handshake gets a silent close with
//! zero bytes written, indistinguishable from a dropped connection.

use crate::error::{OutpostError, OutpostResult};
use crate::keystore::KeyStore;
use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const SOCKS_VERSION: u8 = 5;

/// RFC1929 username/password method id, the only method advertised.
pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

/// RFC1929 sub-negotiation version.
pub const AUTH_VERSION: u8 = 0x01;
pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Audit metadata the relaying side packs into the RFC1929 username.
///
/// Missing or unparsable metadata is logged and never blocks
/// authentication (older relay peers don't send it).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMetadata {
    pub name: String,
    pub resource: String,
    pub user: String,
    #[serde(rename = "appId")]
    pub app_id: String,
}

/// Outcome of a successful credential phase.
#[derive(Debug)]
pub struct AuthenticatedSession {
    /// The validated passkey; selects the allow-set for CONNECT gating.
    pub passkey: String,
    /// Parsed audit metadata, if the peer sent any.
    pub metadata: Option<ClientMetadata>,
}

/// Destination of an authorized CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// One instance per accepted connection.
///
/// Drives `AwaitVersion → AwaitMethodNegotiation → AwaitCredentials →
/// {Authenticated | Rejected}` and then the CONNECT gating. Any
/// rejection or denial is terminal; there is no retry.
pub struct SocksAuthenticator<'a> {
    keystore: &'a dyn KeyStore,
    conn_id: String,
}

impl<'a> SocksAuthenticator<'a> {
    pub fn new(keystore: &'a dyn KeyStore) -> Self {
        Self {
            keystore,
            conn_id: generate_conn_id(),
        }
    }

    /// Correlation id attached to every log line for this connection.
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Run the handshake and credential phases.
    ///
    /// On `Err(NotSocks)` nothing has been written to the stream; the
    /// caller just drops the socket. `Err(AuthFailed)` means the
    /// protocol-mandated failure bytes were already written.
    pub async fn authenticate<S>(&self, stream: &mut S) -> OutpostResult<AuthenticatedSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = read_byte(stream).await?;
        if version != SOCKS_VERSION {
            debug!(conn = %self.conn_id, version, "non-SOCKS5 first byte, closing silently");
            return Err(OutpostError::NotSocks);
        }

        negotiate_method(stream).await?;
        self.check_credentials(stream).await
    }

    /// RFC1929 sub-negotiation plus the key store lookup.
    async fn check_credentials<S>(&self, stream: &mut S) -> OutpostResult<AuthenticatedSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let auth_version = read_byte(stream).await?;
        if auth_version != AUTH_VERSION {
            // Pre-auth garbage gets the same silent close as a bad
            // version byte; there is no agreed failure frame yet.
            debug!(conn = %self.conn_id, auth_version, "bad sub-negotiation version, closing silently");
            return Err(OutpostError::NotSocks);
        }

        let username = read_length_prefixed(stream).await?;
        let passkey_bytes = read_length_prefixed(stream).await?;
        let passkey = String::from_utf8_lossy(&passkey_bytes).to_string();

        let metadata = match serde_json::from_slice::<ClientMetadata>(&username) {
            Ok(meta) => {
                info!(
                    conn = %self.conn_id,
                    rule = %meta.name,
                    resource = %meta.resource,
                    user = %meta.user,
                    app_id = %meta.app_id,
                    "incoming relayed connection"
                );
                Some(meta)
            }
            Err(_) => {
                info!(conn = %self.conn_id, "peer did not report audit metadata");
                None
            }
        };

        if self.keystore.contains(&passkey) {
            stream.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;
            stream.flush().await?;
            debug!(conn = %self.conn_id, "passkey accepted");
            Ok(AuthenticatedSession { passkey, metadata })
        } else {
            warn!(conn = %self.conn_id, "passkey not recognized, rejecting");
            stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            stream.flush().await?;
            Err(OutpostError::AuthFailed("unknown passkey".into()))
        }
    }

    /// Read the CONNECT request and gate it against the passkey's
    /// allow-set. On success the caller dials the target and writes
    /// the success reply; every failure path writes its reply here.
    pub async fn authorize_connect<S>(
        &self,
        stream: &mut S,
        session: &AuthenticatedSession,
    ) -> OutpostResult<ConnectTarget>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let [version, cmd, _reserved, atyp] = header;

        if version != SOCKS_VERSION {
            warn!(conn = %self.conn_id, version, "bad version in request, denying");
            write_reply(stream, REP_GENERAL_FAILURE).await?;
            return Err(OutpostError::InvalidMessage(format!(
                "request version {version}, expected {SOCKS_VERSION}"
            )));
        }

        if cmd != CMD_CONNECT {
            warn!(conn = %self.conn_id, cmd, "unsupported command");
            write_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
            return Err(OutpostError::InvalidMessage(format!("unsupported command {cmd}")));
        }

        let host = read_address(stream, atyp).await?;
        let mut port_bytes = [0u8; 2];
        stream.read_exact(&mut port_bytes).await?;
        let port = u16::from_be_bytes(port_bytes);

        if self.keystore.is_allowed(&session.passkey, &host, port) {
            info!(conn = %self.conn_id, host = %host, port, "destination allowed");
            Ok(ConnectTarget { host, port })
        } else {
            warn!(conn = %self.conn_id, host = %host, port, "destination not in allow-set, denying");
            write_reply(stream, REP_NOT_ALLOWED).await?;
            Err(OutpostError::DestinationDenied(host, port))
        }
    }
}

/// Method negotiation, shared by anything speaking this subset.
///
/// The version byte has already been consumed. Reads the client's
/// method list and selects username/password or fails the handshake.
pub async fn negotiate_method<S>(stream: &mut S) -> OutpostResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = read_byte(stream).await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_USERNAME_PASSWORD) {
        stream.write_all(&[SOCKS_VERSION, METHOD_USERNAME_PASSWORD]).await?;
        stream.flush().await?;
        Ok(())
    } else {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        stream.flush().await?;
        Err(OutpostError::AuthFailed(
            "client cannot do username/password auth".into(),
        ))
    }
}

/// Write a standard SOCKS5 reply with a zero IPv4 bind address.
pub async fn write_reply<S>(stream: &mut S, rep: u8) -> OutpostResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

async fn read_byte<S: AsyncRead + Unpin>(stream: &mut S) -> OutpostResult<u8> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    Ok(buf[0])
}

/// Read a one-byte length (0-255) followed by that many bytes.
async fn read_length_prefixed<S: AsyncRead + Unpin>(stream: &mut S) -> OutpostResult<Vec<u8>> {
    let len = read_byte(stream).await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read the destination address of a CONNECT request.
async fn read_address<S: AsyncRead + Unpin>(stream: &mut S, atyp: u8) -> OutpostResult<String> {
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(std::net::Ipv4Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let name = read_length_prefixed(stream).await?;
            Ok(String::from_utf8_lossy(&name).to_string())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(std::net::Ipv6Addr::from(octets).to_string())
        }
        other => Err(OutpostError::InvalidMessage(format!(
            "unknown address type {other}"
        ))),
    }
}

fn generate_conn_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..4).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Key store double: one passkey, one allowed destination.
    struct FakeKeyStore {
        passkey: &'static str,
        allowed: Option<(&'static str, u16)>,
    }

    impl KeyStore for FakeKeyStore {
        fn contains(&self, passkey: &str) -> bool {
            passkey == self.passkey
        }

        fn is_allowed(&self, passkey: &str, host: &str, port: u16) -> bool {
            passkey == self.passkey
                && self.allowed.map(|(h, p)| h == host && p == port).unwrap_or(false)
        }
    }

    fn handshake_bytes(metadata: &[u8], passkey: &str) -> Vec<u8> {
        let mut bytes = vec![
            SOCKS_VERSION,
            1,
            METHOD_USERNAME_PASSWORD, // offer exactly our method
            AUTH_VERSION,
        ];
        bytes.push(metadata.len() as u8);
        bytes.extend_from_slice(metadata);
        bytes.push(passkey.len() as u8);
        bytes.extend_from_slice(passkey.as_bytes());
        bytes
    }

    fn connect_request(host: [u8; 4], port: u16) -> Vec<u8> {
        let mut bytes = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        bytes.extend_from_slice(&host);
        bytes.extend_from_slice(&port.to_be_bytes());
        bytes
    }

    async fn read_all_written(client: &mut tokio::io::DuplexStream) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    #[tokio::test]
    async fn bad_first_byte_closes_with_zero_bytes_written() {
        let store = FakeKeyStore { passkey: "k", allowed: None };
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[0x04]).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let err = auth.authenticate(&mut server).await.unwrap_err();
        assert!(matches!(err, OutpostError::NotSocks));
        drop(server);

        assert!(read_all_written(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn bad_subnegotiation_version_closes_after_method_select() {
        let store = FakeKeyStore { passkey: "k", allowed: None };
        let (mut client, mut server) = tokio::io::duplex(1024);

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_USERNAME_PASSWORD, 0x05])
            .await
            .unwrap();

        let auth = SocksAuthenticator::new(&store);
        let err = auth.authenticate(&mut server).await.unwrap_err();
        assert!(matches!(err, OutpostError::NotSocks));
        drop(server);

        // Only the method selection was written, nothing after.
        assert_eq!(
            read_all_written(&mut client).await,
            vec![SOCKS_VERSION, METHOD_USERNAME_PASSWORD]
        );
    }

    #[tokio::test]
    async fn client_without_userpass_method_fails_handshake() {
        let store = FakeKeyStore { passkey: "k", allowed: None };
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[SOCKS_VERSION, 1, 0x00]).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        assert!(auth.authenticate(&mut server).await.is_err());
        drop(server);

        assert_eq!(
            read_all_written(&mut client).await,
            vec![SOCKS_VERSION, METHOD_NO_ACCEPTABLE]
        );
    }

    #[tokio::test]
    async fn unknown_passkey_is_rejected_with_failure_status() {
        let store = FakeKeyStore { passkey: "real-key", allowed: None };
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&handshake_bytes(b"", "nope")).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let err = auth.authenticate(&mut server).await.unwrap_err();
        assert!(matches!(err, OutpostError::AuthFailed(_)));
        drop(server);

        assert_eq!(
            read_all_written(&mut client).await,
            vec![
                SOCKS_VERSION,
                METHOD_USERNAME_PASSWORD,
                AUTH_VERSION,
                AUTH_FAILURE
            ]
        );
    }

    #[tokio::test]
    async fn known_passkey_with_disallowed_destination_is_denied() {
        let store = FakeKeyStore {
            passkey: "real-key",
            allowed: Some(("192.168.1.9", 80)),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut bytes = handshake_bytes(b"", "real-key");
        bytes.extend(connect_request([10, 0, 0, 5], 443));
        client.write_all(&bytes).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let session = auth.authenticate(&mut server).await.unwrap();
        let err = auth.authorize_connect(&mut server, &session).await.unwrap_err();
        assert!(matches!(err, OutpostError::DestinationDenied(host, 443) if host == "10.0.0.5"));
        drop(server);

        let written = read_all_written(&mut client).await;
        // Authenticated OK, then the ruleset denial reply.
        assert_eq!(&written[..4], &[
            SOCKS_VERSION,
            METHOD_USERNAME_PASSWORD,
            AUTH_VERSION,
            AUTH_SUCCESS
        ]);
        assert_eq!(written[4], SOCKS_VERSION);
        assert_eq!(written[5], REP_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn known_passkey_with_allowed_destination_proceeds() {
        let store = FakeKeyStore {
            passkey: "real-key",
            allowed: Some(("10.0.0.5", 443)),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);

        let metadata = br#"{"name":"db","resource":"socket://10.0.0.5:443","user":"u@example.com","appId":"app-7"}"#;
        let mut bytes = handshake_bytes(metadata, "real-key");
        bytes.extend(connect_request([10, 0, 0, 5], 443));
        client.write_all(&bytes).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let session = auth.authenticate(&mut server).await.unwrap();
        assert_eq!(session.metadata.as_ref().unwrap().name, "db");

        let target = auth.authorize_connect(&mut server, &session).await.unwrap();
        assert_eq!(target, ConnectTarget { host: "10.0.0.5".into(), port: 443 });
        drop(server);

        assert_eq!(
            read_all_written(&mut client).await,
            vec![
                SOCKS_VERSION,
                METHOD_USERNAME_PASSWORD,
                AUTH_VERSION,
                AUTH_SUCCESS
            ]
        );
    }

    #[tokio::test]
    async fn unparsable_metadata_never_blocks_auth() {
        let store = FakeKeyStore { passkey: "real-key", allowed: None };
        let (mut client, mut server) = tokio::io::duplex(1024);

        client
            .write_all(&handshake_bytes(b"not json at all", "real-key"))
            .await
            .unwrap();

        let auth = SocksAuthenticator::new(&store);
        let session = auth.authenticate(&mut server).await.unwrap();
        assert!(session.metadata.is_none());
        assert_eq!(session.passkey, "real-key");
    }

    #[tokio::test]
    async fn bad_request_version_auto_denies() {
        let store = FakeKeyStore {
            passkey: "real-key",
            allowed: Some(("10.0.0.5", 443)),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut bytes = handshake_bytes(b"", "real-key");
        bytes.extend([0x04, CMD_CONNECT, 0x00, ATYP_IPV4, 10, 0, 0, 5, 1, 187]);
        client.write_all(&bytes).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let session = auth.authenticate(&mut server).await.unwrap();
        assert!(auth.authorize_connect(&mut server, &session).await.is_err());
    }

    #[tokio::test]
    async fn domain_destination_is_gated_by_name() {
        let store = FakeKeyStore {
            passkey: "real-key",
            allowed: Some(("wiki.corp.example", 80)),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut bytes = handshake_bytes(b"", "real-key");
        bytes.extend([SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        let name = b"wiki.corp.example";
        bytes.push(name.len() as u8);
        bytes.extend_from_slice(name);
        bytes.extend(80u16.to_be_bytes());
        client.write_all(&bytes).await.unwrap();

        let auth = SocksAuthenticator::new(&store);
        let session = auth.authenticate(&mut server).await.unwrap();
        let target = auth.authorize_connect(&mut server, &session).await.unwrap();
        assert_eq!(target.host, "wiki.corp.example");
        assert_eq!(target.port, 80);
    }
}
