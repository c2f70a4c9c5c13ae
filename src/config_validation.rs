//! Pre-start configuration checks.
//!
//! Errors stop the proxy from starting; warnings and suggestions are logged.

use crate::config::Config;
use crate::headers::{is_hop_by_hop, parse_overrides};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_listener(&mut result);
        self.validate_credentials(&mut result);
        self.validate_headers(&mut result);
        self.validate_limits(&mut result);
        self.validate_timeouts(&mut result);

        result
    }

    fn validate_listener(&self, result: &mut ValidationResult) {
        let config = self.config;
        if config.port == 0 {
            result.add_error("Port 0 is reserved".to_string());
        }
        if config.port_retry_max == 0 {
            result.add_error("port_retry_max must be at least 1".to_string());
        }
        if config.port != 0 && config.port_retry_max != 0 && config.last_port().is_none() {
            result.add_error(format!(
                "Port range starting at {} with {} attempts exceeds 65535",
                config.port, config.port_retry_max
            ));
        }

        if config.listen_host.is_unspecified() {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes the proxy to external networks",
                config.listen_host
            ));
            result.add_suggestion(
                "Set listen_host to 127.0.0.1 when only local clients use the proxy".to_string(),
            );
        }
    }

    fn validate_credentials(&self, result: &mut ValidationResult) {
        if self.config.ca_cert_path.as_os_str().is_empty() {
            result.add_error("ca_cert_path cannot be empty".to_string());
        }
        if self.config.ca_key_path.as_os_str().is_empty() {
            result.add_error("ca_key_path cannot be empty".to_string());
        }
        if !self.config.ca_cert_path.as_os_str().is_empty()
            && self.config.ca_cert_path == self.config.ca_key_path
        {
            result.add_error("ca_cert_path and ca_key_path must be different files".to_string());
        }
    }

    fn validate_headers(&self, result: &mut ValidationResult) {
        for (name, value) in &self.config.injected_headers {
            if let Err(e) = parse_overrides([(name.as_str(), value.as_str())]) {
                result.add_error(e.to_string());
                continue;
            }
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                result.add_warning(format!(
                    "Injected header {} is managed by the connection and may be dropped or break requests",
                    name
                ));
            }
        }
    }

    fn validate_limits(&self, result: &mut ValidationResult) {
        let config = self.config;
        if config.leaf_cache_capacity == 0 {
            result.add_error("leaf_cache_capacity must be at least 1".to_string());
        }
        if config.leaf_validity_days == 0 {
            result.add_error("leaf_validity_days must be at least 1".to_string());
        } else if config.leaf_validity_days > 397 {
            result.add_warning(format!(
                "leaf_validity_days {} exceeds 397; some clients reject such certificates",
                config.leaf_validity_days
            ));
        }
        if config.max_connections == 0 {
            result.add_error("max_connections must be at least 1".to_string());
        } else if config.max_connections > 10_000 {
            result.add_warning(format!(
                "High connection limit ({}): ensure the file descriptor limit allows it",
                config.max_connections
            ));
        }
    }

    fn validate_timeouts(&self, result: &mut ValidationResult) {
        let config = self.config;
        for (name, value) in [
            ("connect_timeout_secs", config.connect_timeout_secs),
            ("idle_timeout_secs", config.idle_timeout_secs),
            ("upstream_timeout_secs", config.upstream_timeout_secs),
            ("max_connection_lifetime_secs", config.max_connection_lifetime_secs),
        ] {
            if value == 0 {
                result.add_error(format!("{} must be greater than 0", name));
            }
        }

        if config.idle_timeout_secs > 600 {
            result.add_warning(format!(
                "Long idle timeout ({}s) may lead to resource exhaustion",
                config.idle_timeout_secs
            ));
        }
        if config.max_connection_lifetime_secs < config.upstream_timeout_secs {
            result.add_suggestion(
                "max_connection_lifetime_secs is shorter than upstream_timeout_secs; long responses inside tunnels will be cut".to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn local_config() -> Config {
        Config {
            listen_host: "127.0.0.1".parse().unwrap(),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = ConfigValidator::new(&local_config()).validate();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_unspecified_host_warns() {
        let result = ConfigValidator::new(&Config::default()).validate();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.suggestions.len(), 1);
    }

    #[test]
    fn test_port_range_overflow() {
        let config = Config {
            port: 65530,
            port_retry_max: 10,
            ..local_config()
        };
        let result = ConfigValidator::new(&config).validate();
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("65535"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = Config {
            port: 0,
            leaf_cache_capacity: 0,
            upstream_timeout_secs: 0,
            ca_key_path: PathBuf::new(),
            ..local_config()
        };
        let result = ConfigValidator::new(&config).validate();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 4);
    }

    #[test]
    fn test_header_checks() {
        let mut config = local_config();
        config
            .injected_headers
            .insert("x-client-id".to_string(), "abc".to_string());
        config
            .injected_headers
            .insert("Connection".to_string(), "close".to_string());
        let result = ConfigValidator::new(&config).validate();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);

        config
            .injected_headers
            .insert("bad name".to_string(), "v".to_string());
        let result = ConfigValidator::new(&config).validate();
        assert!(!result.is_valid);
    }
}
