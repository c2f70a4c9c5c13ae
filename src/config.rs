use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// How CONNECT tunnels are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Terminate TLS with a per-host leaf certificate and inject headers.
    #[default]
    Intercept,
    /// Relay the encrypted bytes untouched.
    Opaque,
}

impl std::str::FromStr for TunnelMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "intercept" => Ok(TunnelMode::Intercept),
            "opaque" => Ok(TunnelMode::Opaque),
            other => Err(ProxyError::Config(format!(
                "Invalid tunnel mode: {}. Use 'intercept' or 'opaque'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelMode::Intercept => write!(f, "intercept"),
            TunnelMode::Opaque => write!(f, "opaque"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: IpAddr,
    pub port: u16,
    /// Number of sequential ports tried when the configured one is taken.
    pub port_retry_max: u16,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Headers written into every forwarded request, replacing existing values.
    pub injected_headers: BTreeMap<String, String>,
    pub tunnel_mode: TunnelMode,
    pub leaf_cache_capacity: usize,
    pub leaf_validity_days: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub upstream_timeout_secs: u64,
    pub max_connection_lifetime_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_connections: usize,
    pub pool_max_idle_per_host: usize,
    /// 0 disables the periodic statistics line.
    pub stats_interval_secs: u64,
    pub log_headers: bool,
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            port_retry_max: 10,
            ca_cert_path: PathBuf::from("certs/ca-cert.pem"),
            ca_key_path: PathBuf::from("certs/ca-key.pem"),
            injected_headers: BTreeMap::new(),
            tunnel_mode: TunnelMode::Intercept,
            leaf_cache_capacity: 1000,
            leaf_validity_days: 365,
            connect_timeout_secs: 10,
            idle_timeout_secs: 90,
            upstream_timeout_secs: 60,
            max_connection_lifetime_secs: 3600,
            shutdown_grace_secs: 5,
            max_connections: 1000,
            pool_max_idle_per_host: 10,
            stats_interval_secs: 60,
            log_headers: false,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ProxyError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("Invalid PORT value: {}", port)))?;
        }
        if let Some(host) = lookup("PROXY_HOST") {
            self.listen_host = host
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("Invalid PROXY_HOST value: {}", host)))?;
        }
        if let Some(path) = lookup("CA_CERT_PATH") {
            self.ca_cert_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("CA_KEY_PATH") {
            self.ca_key_path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Last port of the bind retry range.
    pub fn last_port(&self) -> Option<u16> {
        self.port.checked_add(self.port_retry_max.saturating_sub(1))
    }
}
