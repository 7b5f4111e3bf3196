//! Portal configuration: TOML file + CLI overrides.

use portal_core::{PortalError, PortalResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub dns: DnsSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub portal: PortalSection,
    #[serde(default)]
    pub firewall: FirewallSection,
}

/// `[dns]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_timeout_ms")]
    pub relay_timeout_ms: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            port: default_dns_port(),
            upstream: default_upstream(),
            relay_timeout_ms: default_timeout_ms(),
        }
    }
}

/// `[http]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            read_timeout_ms: default_timeout_ms(),
        }
    }
}

/// `[portal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Address handed out in redirect answers. Discovered when absent.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_web_root")]
    pub web_root: String,
    #[serde(default = "default_users_file")]
    pub users_file: String,
    /// Seconds a login stays valid; 0 disables expiry.
    #[serde(default)]
    pub session_ttl: u64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,
    #[serde(default = "default_login_window")]
    pub login_window: u64,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            address: None,
            web_root: default_web_root(),
            users_file: default_users_file(),
            session_ttl: 0,
            max_tasks: default_max_tasks(),
            login_attempts: default_login_attempts(),
            login_window: default_login_window(),
        }
    }
}

/// `[firewall]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_chain")]
    pub chain: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_program(),
            chain: default_chain(),
        }
    }
}

fn default_dns_port() -> u16 {
    53
}
fn default_http_port() -> u16 {
    8443
}
fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_web_root() -> String {
    "web".to_string()
}
fn default_users_file() -> String {
    "users.json".to_string()
}
fn default_max_tasks() -> usize {
    256
}
fn default_login_attempts() -> u32 {
    10
}
fn default_login_window() -> u64 {
    60
}
fn default_program() -> String {
    "iptables".to_string()
}
fn default_chain() -> String {
    "FORWARD".to_string()
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub dns_port: Option<u16>,
    pub http_port: Option<u16>,
    pub upstream: Option<String>,
    pub address: Option<String>,
    pub web_root: Option<String>,
    pub users_file: Option<String>,
    pub no_firewall: bool,
}

/// Firewall settings after merging.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub program: String,
    pub chain: String,
}

/// Resolved portal configuration (addresses parsed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub bind: IpAddr,
    pub dns_port: u16,
    pub http_port: u16,
    pub upstream: SocketAddr,
    pub relay_timeout: Duration,
    pub read_timeout: Duration,
    /// `None` means "discover at startup".
    pub address: Option<Ipv4Addr>,
    pub web_root: PathBuf,
    pub users_file: PathBuf,
    pub session_ttl: Option<Duration>,
    pub max_tasks: usize,
    pub login_attempts: u32,
    pub login_window: Duration,
    pub firewall: FirewallConfig,
}

impl PortalConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> PortalResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| PortalError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate every address.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> PortalResult<Self> {
        let bind: IpAddr = file
            .portal
            .bind
            .parse()
            .map_err(|e| PortalError::Config(format!("invalid bind address: {e}")))?;

        let upstream_str = overrides.upstream.unwrap_or(file.dns.upstream);
        let upstream = parse_upstream(&upstream_str)?;

        let address = match overrides.address.or(file.portal.address) {
            Some(a) => Some(
                a.parse::<Ipv4Addr>()
                    .map_err(|e| PortalError::Config(format!("invalid portal address {a}: {e}")))?,
            ),
            None => None,
        };

        let session_ttl = match file.portal.session_ttl {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        if file.portal.max_tasks == 0 {
            return Err(PortalError::Config("max_tasks must be at least 1".into()));
        }

        Ok(Self {
            bind,
            dns_port: overrides.dns_port.unwrap_or(file.dns.port),
            http_port: overrides.http_port.unwrap_or(file.http.port),
            upstream,
            relay_timeout: Duration::from_millis(file.dns.relay_timeout_ms),
            read_timeout: Duration::from_millis(file.http.read_timeout_ms),
            address,
            web_root: expand_tilde_str(&overrides.web_root.unwrap_or(file.portal.web_root)),
            users_file: expand_tilde_str(&overrides.users_file.unwrap_or(file.portal.users_file)),
            session_ttl,
            max_tasks: file.portal.max_tasks,
            login_attempts: file.portal.login_attempts,
            login_window: Duration::from_secs(file.portal.login_window),
            firewall: FirewallConfig {
                enabled: file.firewall.enabled && !overrides.no_firewall,
                program: file.firewall.program,
                chain: file.firewall.chain,
            },
        })
    }

    pub fn dns_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.dns_port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }
}

/// Accept `host:port` or a bare IP (port 53).
fn parse_upstream(s: &str) -> PortalResult<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|e| PortalError::Config(format!("invalid upstream resolver {s}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PortalConfig::resolve(ConfigFile::default(), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.dns_port, 53);
        assert_eq!(cfg.http_port, 8443);
        assert_eq!(cfg.upstream, "8.8.8.8:53".parse().unwrap());
        assert_eq!(cfg.relay_timeout, Duration::from_secs(2));
        assert_eq!(cfg.session_ttl, None);
        assert!(cfg.address.is_none());
        assert!(cfg.firewall.enabled);
    }

    #[test]
    fn test_file_and_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            [dns]
            port = 5353
            upstream = "1.1.1.1"

            [portal]
            address = "192.168.4.1"
            session_ttl = 3600

            [firewall]
            program = "/sbin/iptables"
            "#,
        )
        .unwrap();

        let cfg = PortalConfig::resolve(
            file,
            ConfigOverrides {
                http_port: Some(8080),
                no_firewall: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.dns_port, 5353);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.upstream, "1.1.1.1:53".parse().unwrap());
        assert_eq!(cfg.address, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(cfg.session_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.firewall.program, "/sbin/iptables");
        assert!(!cfg.firewall.enabled);
    }

    #[test]
    fn test_invalid_addresses() {
        let bad_upstream = ConfigOverrides {
            upstream: Some("not-an-ip".into()),
            ..Default::default()
        };
        assert!(PortalConfig::resolve(ConfigFile::default(), bad_upstream).is_err());

        let bad_address = ConfigOverrides {
            address: Some("::1".into()),
            ..Default::default()
        };
        assert!(PortalConfig::resolve(ConfigFile::default(), bad_address).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PortalConfig::load(
            Some(&dir.path().join("absent.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.http_port, 8443);
    }
}
