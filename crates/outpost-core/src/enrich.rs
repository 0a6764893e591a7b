//! Rule enrichment: secret-key assignment and HTTP port allocation.
//!
//! Enrichment runs synchronously during the registration phase and
//! must complete before the rule set is published. Any failure here
//! is terminal for the whole set; a half-enriched rule set must
//! never reach the key store.

use crate::error::{OutpostError, OutpostResult};
use crate::rules::RuleSet;
use rand::Rng;
use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use tracing::debug;

/// Secret key length in bytes before hex encoding (128 bits).
const SECRET_KEY_BYTES: usize = 16;

/// Assign a fresh passkey to every rule.
///
/// Keys are 128 bits from a CSPRNG, hex encoded. No rule field
/// influences generation; a colliding draw is discarded so the
/// pairwise-distinct postcondition holds unconditionally.
pub fn assign_secret_keys(rule_set: &mut RuleSet) {
    let mut rng = rand::thread_rng();
    let mut seen: HashSet<String> = HashSet::new();

    for rule in rule_set.rules_mut() {
        let key = loop {
            let mut bytes = [0u8; SECRET_KEY_BYTES];
            rng.fill(&mut bytes);
            let key = hex::encode(bytes);
            if seen.insert(key.clone()) {
                break key;
            }
        };
        rule.secret_key = Some(key);
    }
}

/// Assign logical HTTP proxy ports sequentially.
///
/// Scanning rules in original order, the k-th HTTP-kind rule (0-based)
/// receives `starting_port + k`. Non-HTTP rules are untouched. This
/// assigns numbers only; nothing is bound. Fails when the allocation
/// would run past the end of the port range.
pub fn assign_sequential_http_ports(rule_set: &mut RuleSet, starting_port: u16) -> OutpostResult<()> {
    let mut next = Some(starting_port);
    for rule in rule_set.rules_mut() {
        if rule.is_http() {
            let port = next.ok_or_else(|| {
                OutpostError::Enrichment(format!(
                    "port range exhausted before rule '{}' (starting port {starting_port})",
                    rule.name
                ))
            })?;
            rule.http_proxy_port = Some(port);
            next = port.checked_add(1);
        }
    }
    Ok(())
}

/// A probe socket handed out by a [`ProbeSocketFactory`].
///
/// The expected call sequence per probe is create, bind, local_port,
/// close, exactly once each.
pub trait ProbeSocket {
    fn bind(&mut self, addr: SocketAddr) -> std::io::Result<()>;
    fn local_port(&self) -> std::io::Result<u16>;
    fn close(self: Box<Self>) -> std::io::Result<()>;
}

/// Socket-creation abstraction injected into port discovery so tests
/// can substitute doubles; production uses real OS sockets.
pub trait ProbeSocketFactory {
    fn create(&self) -> std::io::Result<Box<dyn ProbeSocket>>;
}

/// Production probe socket backed by `std::net::TcpListener`.
struct TcpProbeSocket {
    listener: Option<TcpListener>,
}

impl ProbeSocket for TcpProbeSocket {
    fn bind(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        self.listener = Some(TcpListener::bind(addr)?);
        Ok(())
    }

    fn local_port(&self) -> std::io::Result<u16> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?.port()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "probe socket not bound",
            )),
        }
    }

    fn close(self: Box<Self>) -> std::io::Result<()> {
        // Dropping the listener releases the port.
        Ok(())
    }
}

/// Default factory producing real OS probe sockets.
pub struct TcpProbeSocketFactory;

impl ProbeSocketFactory for TcpProbeSocketFactory {
    fn create(&self) -> std::io::Result<Box<dyn ProbeSocket>> {
        Ok(Box::new(TcpProbeSocket { listener: None }))
    }
}

/// Fill in still-missing HTTP proxy ports via probe-bind-release.
///
/// For each HTTP-kind rule whose port is absent: create a probe
/// socket, bind it to `bind_addr` (normally a wildcard address with
/// port 0), read back the OS-assigned local port, record it, close
/// the probe. The discovered number is a best-effort stable port, not
/// a held reservation; a narrow race with other processes is
/// accepted, not eliminated.
///
/// Any I/O failure aborts the pass with the rule set only partially
/// updated in memory; callers must not publish it in that case.
pub fn discover_missing_http_ports(
    rule_set: &mut RuleSet,
    factory: &dyn ProbeSocketFactory,
    bind_addr: SocketAddr,
) -> OutpostResult<()> {
    for rule in rule_set.rules_mut() {
        if !rule.is_http() || rule.http_proxy_port.is_some() {
            continue;
        }

        let port = probe_port(factory, bind_addr)
            .map_err(|e| OutpostError::Enrichment(format!("port discovery for rule '{}': {e}", rule.name)))?;
        debug!(rule = %rule.name, port, "discovered virtual host bind port");
        rule.http_proxy_port = Some(port);
    }
    Ok(())
}

fn probe_port(factory: &dyn ProbeSocketFactory, bind_addr: SocketAddr) -> std::io::Result<u16> {
    let mut socket = factory.create()?;
    socket.bind(bind_addr)?;
    let port = socket.local_port()?;
    socket.close()?;
    Ok(port)
}
