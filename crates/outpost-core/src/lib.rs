//! outpost-core: Core library for the outpost relay agent.
//!
//! Provides the resource-rule model and enrichment engine, the key
//! store consulted on every relayed session, the SOCKS5
//! credential-and-destination gate, and the tunnel control protocol
//! (CBOR messages, codec, challenge-signature auth).

pub mod auth;
pub mod codec;
pub mod enrich;
pub mod error;
pub mod keystore;
pub mod messages;
pub mod rules;
pub mod socks;

// Re-export commonly used items at crate root.
pub use error::{OutpostError, OutpostResult};
pub use messages::{CipherChoice, TunnelMessage, PROTOCOL_VERSION};
pub use codec::{frame_encode, cbor_decode, read_frame, write_frame};
pub use keystore::{KeyStore, SharedKeyStore};
pub use rules::{ResourceRule, RuleSet};
