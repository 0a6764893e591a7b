//! Agent configuration: TOML file + CLI overrides.

use outpost_core::{OutpostError, OutpostResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_starting_http_port")]
    pub starting_http_port: u16,
    #[serde(default)]
    pub health_port: u16,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
            socks_port: default_socks_port(),
            starting_http_port: default_starting_http_port(),
            health_port: 0,
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default)]
    pub broker_addr: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_remote_forward_port")]
    pub remote_forward_port: u16,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            broker_addr: String::new(),
            key_file: default_key_file(),
            remote_forward_port: default_remote_forward_port(),
        }
    }
}

fn default_rules_file() -> String {
    "~/.outpost/rules.json".to_string()
}
fn default_socks_port() -> u16 {
    1080
}
fn default_starting_http_port() -> u16 {
    10000
}
fn default_key_file() -> String {
    "~/.outpost/id_ed25519".to_string()
}
fn default_remote_forward_port() -> u16 {
    2000
}

/// Resolved agent configuration (paths expanded, CLI overrides
/// applied).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub rules_file: PathBuf,
    pub socks_port: u16,
    pub starting_http_port: u16,
    pub health_port: u16,
    pub broker_addr: String,
    pub key_file: PathBuf,
    pub remote_forward_port: u16,
}

impl AgentConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_socks_port: Option<u16>,
        cli_broker: Option<&str>,
        cli_key: Option<&str>,
        cli_remote_port: Option<u16>,
    ) -> OutpostResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| OutpostError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let socks_port = cli_socks_port.unwrap_or(file_config.agent.socks_port);
        let broker_addr = cli_broker
            .map(|s| s.to_string())
            .unwrap_or(file_config.tunnel.broker_addr);
        let key_str = cli_key
            .map(|s| s.to_string())
            .unwrap_or(file_config.tunnel.key_file);
        let remote_forward_port = cli_remote_port.unwrap_or(file_config.tunnel.remote_forward_port);

        if broker_addr.is_empty() {
            return Err(OutpostError::Other(
                "no broker address configured (set [tunnel].broker_addr or --broker)".into(),
            ));
        }

        Ok(Self {
            rules_file: expand_tilde_str(&file_config.agent.rules_file),
            socks_port,
            starting_http_port: file_config.agent.starting_http_port,
            health_port: file_config.agent.health_port,
            broker_addr,
            key_file: expand_tilde_str(&key_str),
            remote_forward_port,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}
