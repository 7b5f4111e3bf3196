//! portal-server: LAN captive portal.
//!
//! Answers every DNS query from an unauthenticated client with the portal's
//! own address, serves a login page over HTTP, and relays DNS to the real
//! resolver once the client has logged in.

mod auth;
mod config;
mod firewall;
mod gateway;
mod net;
mod server;

use clap::Parser;
use config::{ConfigOverrides, PortalConfig};
use firewall::{Firewall, IptablesFirewall, NoopFirewall};
use portal_core::JsonUserStore;
use server::PortalServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// portal-server — LAN captive portal
#[derive(Parser, Debug)]
#[command(name = "portal-server", version, about = "LAN captive portal")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "portal.toml")]
    config: String,

    /// DNS listen port
    #[arg(long)]
    dns_port: Option<u16>,

    /// HTTP listen port
    #[arg(long)]
    http_port: Option<u16>,

    /// Upstream resolver (ip or ip:port)
    #[arg(long)]
    upstream: Option<String>,

    /// Address handed to blocked clients (default: discovered)
    #[arg(long)]
    address: Option<String>,

    /// Directory holding the page templates and static files
    #[arg(long)]
    web_root: Option<String>,

    /// JSON user database
    #[arg(long)]
    users_file: Option<String>,

    /// Do not touch packet-filter rules
    #[arg(long)]
    no_firewall: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portal-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        dns_port: cli.dns_port,
        http_port: cli.http_port,
        upstream: cli.upstream,
        address: cli.address,
        web_root: cli.web_root,
        users_file: cli.users_file,
        no_firewall: cli.no_firewall,
    };
    let config = match PortalConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let portal_ip = config.address.unwrap_or_else(net::discover_local_ip);
    let credentials = Arc::new(JsonUserStore::new(config.users_file.clone()));
    let firewall: Arc<dyn Firewall> = if config.firewall.enabled {
        Arc::new(IptablesFirewall::new(
            config.firewall.program.clone(),
            config.firewall.chain.clone(),
        ))
    } else {
        Arc::new(NoopFirewall)
    };

    let mut running = match PortalServer::new(config, portal_ip, credentials, firewall)
        .start()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start portal");
            std::process::exit(1);
        }
    };

    let mut failed = false;
    tokio::select! {
        result = running.wait() => {
            if let Err(e) = result {
                error!(error = %e, "listener error");
                failed = true;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!(clients = running.table().len(), "shutting down");

    if let Err(e) = running.stop().await {
        error!(error = %e, "error while stopping");
        failed = true;
    }

    info!("portal-server stopped");
    if failed {
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
