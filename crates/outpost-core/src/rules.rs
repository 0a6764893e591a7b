//! Resource rules: the authorization records binding a destination
//! pattern to a passkey and the ports the relay serves it on.
//!
//! A rule's pattern prefix classifies its transport kind. HTTP-kind
//! rules (`http://...`) get an HTTP proxy port during enrichment;
//! raw-socket rules (`socket://...`) never carry one.

use crate::error::{OutpostError, OutpostResult};
use serde::{Deserialize, Serialize};

/// Pattern prefix marking an HTTP-kind rule.
pub const HTTP_PREFIX: &str = "http://";
/// Pattern prefix marking a raw-socket rule.
pub const SOCKET_PREFIX: &str = "socket://";

/// One authorization unit of the rule exchange format.
///
/// `secret_key` and `http_proxy_port` start out absent and are filled
/// in by enrichment; every other field comes from the administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    /// Identifier, unique within a rule set.
    pub name: String,
    /// Tagged destination pattern, e.g. `socket://db.corp.example:5432`.
    pub pattern: String,
    /// Owning client identifier.
    pub client_id: String,
    /// Ordered ACL entries.
    pub allowed_entities: Vec<String>,
    /// Optional ordered application ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_ids: Option<Vec<String>>,
    /// Assigned passkey; unique across the rule set once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Present iff the rule is HTTP-kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_port: Option<u16>,
    /// Configured SOCKS server port, pass-through for this layer.
    pub socks_server_port: u16,
}

impl ResourceRule {
    /// Whether this rule's pattern marks it as HTTP-kind.
    pub fn is_http(&self) -> bool {
        self.pattern.starts_with(HTTP_PREFIX)
    }

    /// Whether this rule's pattern marks it as a raw-socket rule.
    pub fn is_socket(&self) -> bool {
        self.pattern.starts_with(SOCKET_PREFIX)
    }

    /// Extract the destination authority (host plus optional port)
    /// from the pattern. Used to build the key store allow-set.
    pub fn authority(&self) -> OutpostResult<(String, Option<u16>)> {
        let rest = self
            .pattern
            .strip_prefix(HTTP_PREFIX)
            .or_else(|| self.pattern.strip_prefix(SOCKET_PREFIX))
            .ok_or_else(|| {
                OutpostError::RuleParse(format!(
                    "rule '{}': unknown pattern prefix in '{}'",
                    self.name, self.pattern
                ))
            })?;

        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(OutpostError::RuleParse(format!(
                "rule '{}': empty authority in pattern '{}'",
                self.name, self.pattern
            )));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    OutpostError::RuleParse(format!(
                        "rule '{}': bad port in pattern '{}'",
                        self.name, self.pattern
                    ))
                })?;
                Ok((host.to_string(), Some(port)))
            }
            None => Ok((authority.to_string(), None)),
        }
    }

    /// Serialize one rule to the exchange format.
    pub fn to_json(&self) -> OutpostResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one rule from the exchange format.
    pub fn from_json(data: &str) -> OutpostResult<ResourceRule> {
        Ok(serde_json::from_str(data)?)
    }
}

/// An ordered sequence of resource rules.
///
/// Order is significant: sequential port allocation assigns ports by
/// a rule's position among HTTP-kind rules. Built once from the
/// exchange format, enriched exactly once, then published immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<ResourceRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ResourceRule>) -> Self {
        Self { rules }
    }

    /// Parse a whole rule set. Malformed input fails the entire
    /// parse; no partial rule set is ever returned.
    pub fn from_json(data: &str) -> OutpostResult<RuleSet> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> OutpostResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn rules(&self) -> &[ResourceRule] {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut [ResourceRule] {
        &mut self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceRule> {
        self.rules.iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn http_rule(name: &str) -> ResourceRule {
        ResourceRule {
            name: name.to_string(),
            pattern: format!("http://{name}.corp.example/reports"),
            client_id: "client-1".to_string(),
            allowed_entities: vec!["user@example.com".to_string()],
            app_ids: Some(vec!["app-1".to_string()]),
            secret_key: None,
            http_proxy_port: None,
            socks_server_port: 1080,
        }
    }

    pub(crate) fn socket_rule(name: &str, host: &str, port: u16) -> ResourceRule {
        ResourceRule {
            name: name.to_string(),
            pattern: format!("socket://{host}:{port}"),
            client_id: "client-1".to_string(),
            allowed_entities: vec!["group@example.com".to_string()],
            app_ids: None,
            secret_key: None,
            http_proxy_port: None,
            socks_server_port: 1080,
        }
    }

    #[test]
    fn pattern_kind_classification() {
        assert!(http_rule("wiki").is_http());
        assert!(!http_rule("wiki").is_socket());
        assert!(socket_rule("db", "10.0.0.5", 5432).is_socket());
        assert!(!socket_rule("db", "10.0.0.5", 5432).is_http());
    }

    #[test]
    fn authority_with_port() {
        let rule = socket_rule("db", "10.0.0.5", 5432);
        assert_eq!(rule.authority().unwrap(), ("10.0.0.5".to_string(), Some(5432)));
    }

    #[test]
    fn authority_without_port() {
        let rule = http_rule("wiki");
        assert_eq!(
            rule.authority().unwrap(),
            ("wiki.corp.example".to_string(), None)
        );
    }

    #[test]
    fn authority_rejects_unknown_prefix() {
        let mut rule = http_rule("wiki");
        rule.pattern = "ftp://wiki.corp.example".to_string();
        assert!(rule.authority().is_err());
    }

    #[test]
    fn rule_round_trip_preserves_all_fields() {
        let mut rule = http_rule("wiki");
        rule.secret_key = Some("0011223344556677".to_string());
        rule.http_proxy_port = Some(10000);

        let json = rule.to_json().unwrap();
        let decoded = ResourceRule::from_json(&json).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn rule_round_trip_absent_optionals() {
        let rule = socket_rule("db", "db.corp.example", 5432);
        let json = rule.to_json().unwrap();
        // Absent fields stay absent on the wire, not null.
        assert!(!json.contains("appIds"));
        assert!(!json.contains("secretKey"));
        assert!(!json.contains("httpProxyPort"));
        let decoded = ResourceRule::from_json(&json).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn rule_set_round_trip() {
        let set = RuleSet::new(vec![http_rule("wiki"), socket_rule("db", "10.0.0.5", 5432)]);
        let decoded = RuleSet::from_json(&set.to_json().unwrap()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn malformed_input_fails_whole_parse() {
        let good = http_rule("wiki").to_json().unwrap();
        let data = format!("[{good}, {{\"name\": \"broken\"}}]");
        assert!(RuleSet::from_json(&data).is_err());
    }
}
