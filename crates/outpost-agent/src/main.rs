//! outpost-agent: outbound relay agent.
//!
//! Loads resource rules, enriches them with secret keys and HTTP proxy
//! ports, runs a local SOCKS5 gateway gated on those keys, and tunnels
//! a remote port forward back from the broker to the gateway.

mod config;
mod gateway;
mod health;
mod tunnel;

use clap::Parser;
use config::AgentConfig;
use gateway::SocksGateway;
use health::HealthCheckResponder;
use outpost_core::enrich::{
    assign_secret_keys, assign_sequential_http_ports, discover_missing_http_ports,
    TcpProbeSocketFactory,
};
use outpost_core::{RuleSet, SharedKeyStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, info};
use tunnel::{PreconnectedDial, TunnelIdentity, TunnelTransport};

/// outpost-agent — outbound relay agent
#[derive(Parser, Debug)]
#[command(name = "outpost-agent", version, about = "Outbound relay agent")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.outpost/config.toml")]
    config: String,

    /// Local SOCKS5 gateway port
    #[arg(long)]
    socks_port: Option<u16>,

    /// Broker address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Ed25519 private key file (OpenSSH format)
    #[arg(long)]
    key: Option<String>,

    /// Remote port the broker forwards back to the gateway
    #[arg(long)]
    remote_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting outpost-agent");

    // Load agent config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match AgentConfig::load(
        Some(&config_path),
        cli.socks_port,
        cli.broker.as_deref(),
        cli.key.as_deref(),
        cli.remote_port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Load and enrich resource rules
    let mut rule_set = match load_rules(&config.rules_file) {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, path = %config.rules_file.display(), "failed to load rules");
            std::process::exit(1);
        }
    };
    assign_secret_keys(&mut rule_set);
    if let Err(e) = assign_sequential_http_ports(&mut rule_set, config.starting_http_port) {
        error!(error = %e, "failed to allocate HTTP proxy ports");
        std::process::exit(1);
    }
    let probe_factory = TcpProbeSocketFactory;
    let probe_addr = SocketAddr::from(([0, 0, 0, 0], 0));
    if let Err(e) = discover_missing_http_ports(&mut rule_set, &probe_factory, probe_addr) {
        error!(error = %e, "failed to discover free HTTP proxy ports");
        std::process::exit(1);
    }
    info!(rules = rule_set.rules().len(), "resource rules ready");

    // Publish enriched rules to the key store
    let keystore = Arc::new(SharedKeyStore::new());
    if let Err(e) = keystore.publish(&rule_set) {
        error!(error = %e, "failed to publish rules to key store");
        std::process::exit(1);
    }

    // Health responder (port 0 picks an ephemeral port)
    let health = match HealthCheckResponder::start(config.health_port).await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to start health responder");
            std::process::exit(1);
        }
    };
    info!(port = health.port(), "health responder listening");

    // Local SOCKS5 gateway
    let keystore_dyn: Arc<dyn outpost_core::KeyStore> = keystore.clone();
    let socks_gateway = match SocksGateway::start(config.socks_port, keystore_dyn).await {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, port = config.socks_port, "failed to start SOCKS gateway");
            std::process::exit(1);
        }
    };
    info!(port = socks_gateway.port(), "SOCKS gateway listening");

    // Connect out to the broker and bring up the tunnel
    let identity = match TunnelIdentity::from_openssh_file(&config.key_file) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, path = %config.key_file.display(), "failed to load key");
            std::process::exit(1);
        }
    };
    let carrier = match TcpStream::connect(&config.broker_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, broker = %config.broker_addr, "failed to reach broker");
            std::process::exit(1);
        }
    };
    info!(broker = %config.broker_addr, "connected to broker");

    let transport = TunnelTransport::new(
        identity,
        socks_gateway.port(),
        config.remote_forward_port,
    );
    let mut session = match transport.connect(PreconnectedDial::new(carrier)).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "tunnel setup failed");
            std::process::exit(1);
        }
    };
    info!(
        remote_port = session.forward().remote_port,
        local_port = session.forward().local_port,
        "tunnel established"
    );

    // Run until the tunnel ends or a shutdown signal arrives
    tokio::select! {
        _ = session.wait() => {
            info!("tunnel ended");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            session.close().await;
        }
    }

    socks_gateway.shutdown().await;
    health.shutdown().await;
    info!("outpost-agent stopped");
}

/// Read and parse the resource rules file.
fn load_rules(path: &std::path::Path) -> outpost_core::OutpostResult<RuleSet> {
    let content = std::fs::read_to_string(path)?;
    RuleSet::from_json(&content)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
