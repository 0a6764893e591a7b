//! Control messages for the tunnel forwarding session.
//!
//! One CBOR envelope per frame (see [`crate::codec`]). The session
//! runs: hello / challenge / signed auth, then a cipher renegotiation
//! to `none` (the carrying socket is already secured), then a single
//! remote forward installation, then channel mux traffic.

use serde::{Deserialize, Serialize};

/// Protocol version string; also the domain separator of the auth
/// transcript.
pub const PROTOCOL_VERSION: &str = "outpost-v1";

/// Fixed placeholder session username. Real authorization happens at
/// the SOCKS layer, not here.
pub const TUNNEL_USERNAME: &str = "outpost";

/// Cipher negotiated for the handshake phase.
///
/// The protocol mandates a cipher during the handshake; immediately
/// after a successful connection both directions renegotiate to
/// `None` because the carrying socket already provides
/// confidentiality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherChoice {
    Aes128Ctr,
    None,
}

/// One frame of the tunnel control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Client opener: version, placeholder username, handshake cipher.
    ClientHello {
        version: String,
        username: String,
        cipher: CipherChoice,
    },
    /// Broker reply: session id plus a random nonce to sign.
    ServerChallenge {
        session_id: String,
        nonce: Vec<u8>,
    },
    /// Client identity proof: raw Ed25519 public key and signature
    /// over the challenge transcript.
    Authenticate {
        public_key: Vec<u8>,
        signature: Vec<u8>,
    },
    AuthOk,
    AuthFail {
        reason: String,
    },
    /// Renegotiate the session cipher for both directions.
    CipherUpdate {
        cipher: CipherChoice,
    },
    /// Install the remote forward: broker-visible `remote_port` routes
    /// to the client's local `target_port`.
    ForwardRequest {
        remote_port: u16,
        target_port: u16,
    },
    ForwardOk {
        remote_port: u16,
    },
    ForwardFail {
        reason: String,
    },
    /// Broker opens a relayed connection through the forward.
    ChannelOpen {
        channel_id: u32,
    },
    ChannelData {
        channel_id: u32,
        data: Vec<u8>,
    },
    ChannelClose {
        channel_id: u32,
    },
    Disconnect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, frame_encode};

    #[test]
    fn envelope_round_trip() {
        let msg = TunnelMessage::ForwardRequest {
            remote_port: 2000,
            target_port: 1080,
        };
        let frame = frame_encode(&msg).unwrap();
        let decoded: TunnelMessage = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn cipher_choice_wire_names() {
        let hello = TunnelMessage::ClientHello {
            version: PROTOCOL_VERSION.to_string(),
            username: TUNNEL_USERNAME.to_string(),
            cipher: CipherChoice::Aes128Ctr,
        };
        let frame = frame_encode(&hello).unwrap();
        let decoded: TunnelMessage = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, hello);
    }
}
