//! Gateway configuration: TOML file + CLI overrides.

use relaytun_core::{GatewayError, GatewayResult, DEFAULT_MAX_MESSAGE_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub tls: TlsSection,
}

/// `[gateway]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_local_bind")]
    pub local_bind: String,
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            key_path: default_key_path(),
            api_bind: default_api_bind(),
            api_port: default_api_port(),
            local_bind: default_local_bind(),
            min_port: default_min_port(),
            max_port: default_max_port(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// `[tunnel]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,
    #[serde(default = "default_sweep_period")]
    pub sweep_period_secs: u64,
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            inactivity_threshold_secs: default_inactivity_threshold(),
            sweep_period_secs: default_sweep_period(),
            accept_timeout_secs: default_accept_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Which broker binding carries the session queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    #[default]
    Redis,
    /// In-process broker; both legs of a tunnel must live in this gateway.
    Memory,
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub backend: RelayBackend,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_queue_ttl")]
    pub queue_ttl_secs: u64,
    /// Extra root certificate (PEM) trusted for secure relays.
    #[serde(default)]
    pub ca_cert: Option<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            backend: RelayBackend::default(),
            check_interval_secs: default_check_interval(),
            queue_ttl_secs: default_queue_ttl(),
            ca_cert: None,
        }
    }
}

/// `[tls]` section, for the local sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_tls_key_path")]
    pub key: String,
    #[serde(default = "default_ca_path")]
    pub ca: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: default_cert_path(),
            key: default_tls_key_path(),
            ca: default_ca_path(),
        }
    }
}

fn default_common_name() -> String {
    "gateway.local".to_string()
}
fn default_key_path() -> String {
    "~/.relaytun/gateway.key".to_string()
}
fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8453
}
fn default_local_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_min_port() -> u16 {
    8000
}
fn default_max_port() -> u16 {
    8100
}
fn default_buffer_size() -> usize {
    8192
}
fn default_inactivity_threshold() -> u64 {
    60
}
fn default_sweep_period() -> u64 {
    30
}
fn default_accept_timeout() -> u64 {
    30
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_check_interval() -> u64 {
    10
}
fn default_queue_ttl() -> u64 {
    300
}
fn default_cert_path() -> String {
    "~/.relaytun/cert.pem".to_string()
}
fn default_tls_key_path() -> String {
    "~/.relaytun/key.pem".to_string()
}
fn default_ca_path() -> String {
    "~/.relaytun/ca.pem".to_string()
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub common_name: Option<String>,
    pub api_port: Option<u16>,
    pub key_path: Option<String>,
    pub backend: Option<RelayBackend>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca: Option<String>,
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub common_name: String,
    pub key_path: PathBuf,
    pub api_bind: String,
    pub api_port: u16,
    pub local_bind: String,
    pub min_port: u16,
    pub max_port: u16,
    pub buffer_size: usize,
    pub inactivity_threshold: Duration,
    pub sweep_period: Duration,
    pub accept_timeout: Duration,
    pub max_message_size: usize,
    pub backend: RelayBackend,
    pub check_interval: Duration,
    pub queue_ttl: Duration,
    pub relay_ca_cert: Option<PathBuf>,
    pub tls_enabled: bool,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub tls_ca: PathBuf,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> GatewayResult<Self> {
        let ConfigFile {
            gateway,
            tunnel,
            relay,
            tls,
        } = file;
        // Any certificate given on the command line switches local TLS on.
        let tls_from_cli = overrides.tls_cert.is_some() || overrides.tls_key.is_some();

        let config = Self {
            common_name: overrides.common_name.unwrap_or(gateway.common_name),
            key_path: expand_tilde_str(&overrides.key_path.unwrap_or(gateway.key_path)),
            api_bind: gateway.api_bind,
            api_port: overrides.api_port.unwrap_or(gateway.api_port),
            local_bind: gateway.local_bind,
            min_port: gateway.min_port,
            max_port: gateway.max_port,
            buffer_size: gateway.buffer_size,
            inactivity_threshold: Duration::from_secs(tunnel.inactivity_threshold_secs),
            sweep_period: Duration::from_secs(tunnel.sweep_period_secs),
            accept_timeout: Duration::from_secs(tunnel.accept_timeout_secs),
            max_message_size: tunnel.max_message_size,
            backend: overrides.backend.unwrap_or(relay.backend),
            check_interval: Duration::from_secs(relay.check_interval_secs),
            queue_ttl: Duration::from_secs(relay.queue_ttl_secs),
            relay_ca_cert: relay.ca_cert.as_deref().map(expand_tilde_str),
            tls_enabled: tls.enabled || tls_from_cli,
            tls_cert: expand_tilde_str(&overrides.tls_cert.unwrap_or(tls.cert)),
            tls_key: expand_tilde_str(&overrides.tls_key.unwrap_or(tls.key)),
            tls_ca: expand_tilde_str(&overrides.tls_ca.unwrap_or(tls.ca)),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayResult<()> {
        let name = self.common_name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(GatewayError::invalid(
                "gateway.common_name",
                "must be a non-empty name without whitespace",
            ));
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(GatewayError::invalid(
                "gateway.min_port",
                format!("{}..={} is not a usable range", self.min_port, self.max_port),
            ));
        }
        if self.buffer_size == 0 {
            return Err(GatewayError::invalid("gateway.buffer_size", "must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(GatewayError::invalid("tunnel.max_message_size", "must be positive"));
        }
        for (field, secs) in [
            ("tunnel.sweep_period_secs", self.sweep_period),
            ("relay.check_interval_secs", self.check_interval),
        ] {
            if secs.is_zero() {
                return Err(GatewayError::invalid(field, "must be positive"));
            }
        }
        Ok(())
    }
}

fn parse(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Other(format!("config parse error: {e}")))
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
    fn defaults_without_file() {
        let config = GatewayConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(config.api_port, 8453);
        assert_eq!(config.backend, RelayBackend::Redis);
        assert_eq!(config.inactivity_threshold, Duration::from_secs(60));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(!config.tls_enabled);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
common_name = "gw.provider.cloud"
min_port = 9000
max_port = 9010

[tunnel]
inactivity_threshold_secs = 120

[relay]
backend = "memory"
queue_ttl_secs = 30
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(
            Some(path.as_path()),
            Overrides {
                api_port: Some(9999),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.common_name, "gw.provider.cloud");
        assert_eq!((config.min_port, config.max_port), (9000, 9010));
        assert_eq!(config.inactivity_threshold, Duration::from_secs(120));
        assert_eq!(config.backend, RelayBackend::Memory);
        assert_eq!(config.queue_ttl, Duration::from_secs(30));
        assert_eq!(config.api_port, 9999);
    }

    #[test]
    fn cli_certificate_enables_tls() {
        let config = GatewayConfig::load(
            None,
            Overrides {
                tls_cert: Some("/etc/gw/cert.pem".into()),
                tls_key: Some("/etc/gw/key.pem".into()),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert!(config.tls_enabled);
        assert_eq!(config.tls_cert, PathBuf::from("/etc/gw/cert.pem"));
    }

    #[test]
    fn rejects_bad_port_range() {
        let mut file = ConfigFile::default();
        file.gateway.min_port = 9000;
        file.gateway.max_port = 8000;
        let err = GatewayConfig::resolve(file, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("gateway.min_port"));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse("[gateway\ncommon_name = 1").is_err());
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde_str("~/x/y");
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
    }
}
