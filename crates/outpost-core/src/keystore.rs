//! Key store: the read side of the authorization decision.
//!
//! Populated once from a fully enriched rule set during the
//! registration phase, then consulted concurrently by every SOCKS
//! session. An unpopulated store answers not-found on every lookup.

use crate::error::{OutpostError, OutpostResult};
use crate::rules::RuleSet;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

/// Read-only contract every session consults before relaying a byte.
pub trait KeyStore: Send + Sync {
    /// Whether the passkey belongs to any published rule.
    fn contains(&self, passkey: &str) -> bool;

    /// Whether the passkey's rule allows connecting to `host:port`.
    fn is_allowed(&self, passkey: &str, host: &str, port: u16) -> bool;
}

/// Allowed destinations for one passkey, derived from the owning
/// rule's pattern authority.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowedDestination {
    /// Exact `host:port` pair.
    HostPort(String, u16),
    /// Any port on this host.
    Host(String),
}

impl AllowedDestination {
    fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            AllowedDestination::HostPort(h, p) => h == host && *p == port,
            AllowedDestination::Host(h) => h == host,
        }
    }
}

/// In-memory key store shared between the registration phase and the
/// per-connection sessions.
///
/// Writes happen exactly once, before any session is accepted, so a
/// read-mostly lock is all the synchronization needed.
#[derive(Debug, Default)]
pub struct SharedKeyStore {
    entries: RwLock<Option<HashMap<String, Vec<AllowedDestination>>>>,
}

impl SharedKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an enriched rule set.
    ///
    /// Fails if any rule is missing its secret key or carries an
    /// unparsable pattern; a half-enriched rule set must never be
    /// published.
    pub fn publish(&self, rule_set: &RuleSet) -> OutpostResult<()> {
        let mut entries: HashMap<String, Vec<AllowedDestination>> = HashMap::new();

        for rule in rule_set.iter() {
            let key = rule.secret_key.clone().ok_or_else(|| {
                OutpostError::Enrichment(format!(
                    "rule '{}' has no secret key; refusing to publish",
                    rule.name
                ))
            })?;
            let (host, port) = rule.authority()?;
            let dest = match port {
                Some(port) => AllowedDestination::HostPort(host, port),
                None => AllowedDestination::Host(host),
            };
            entries.entry(key).or_default().push(dest);
        }

        *self.entries.write().expect("key store lock poisoned") = Some(entries);
        Ok(())
    }

    /// Whether a rule set has been published yet.
    pub fn is_populated(&self) -> bool {
        self.entries.read().expect("key store lock poisoned").is_some()
    }
}

impl KeyStore for SharedKeyStore {
    fn contains(&self, passkey: &str) -> bool {
        match &*self.entries.read().expect("key store lock poisoned") {
            Some(entries) => entries.contains_key(passkey),
            None => {
                // Registration never completed for this agent instance.
                warn!("key store not yet populated; treating passkey as unknown");
                false
            }
        }
    }

    fn is_allowed(&self, passkey: &str, host: &str, port: u16) -> bool {
        match &*self.entries.read().expect("key store lock poisoned") {
            Some(entries) => entries
                .get(passkey)
                .map(|dests| dests.iter().any(|d| d.matches(host, port)))
                .unwrap_or(false),
            None => false,
        }
    }
}
