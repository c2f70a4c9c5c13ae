use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Root certificate authority unavailable: {0}")]
    CaUnavailable(String),

    #[error("Certificate issuance failed for {hostname}: {reason}")]
    Issuance { hostname: String, reason: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("All ports {first_port}-{last_port} are in use")]
    BindConflict { first_port: u16, last_port: u16 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hyper error: {0}")]
    Hyper(String),
}

impl ProxyError {
    pub fn issuance(hostname: &str, reason: impl std::fmt::Display) -> Self {
        ProxyError::Issuance {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Startup-class failures that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::CaUnavailable(_) | ProxyError::BindConflict { .. } | ProxyError::Config(_)
        )
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Hyper(e.to_string())
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(e: url::ParseError) -> Self {
        ProxyError::Parse(e.to_string())
    }
}

/// Render an error together with its source chain on one line.
pub fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}
