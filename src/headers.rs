use crate::config::Config;
use crate::error::ProxyError;
use crate::monitoring::ProxyStatistics;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use log::{debug, trace};
use std::sync::Arc;

/// Headers that only concern the client-proxy hop and never reach the origin.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Set every override on `headers`, replacing any existing value of the same
/// name. Headers without an override pass through unchanged.
pub fn inject_headers(mut headers: HeaderMap, overrides: &[(HeaderName, HeaderValue)]) -> HeaderMap {
    for (name, value) in overrides {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

/// Drop hop-by-hop headers, including any listed in `Connection`.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Applies the configured header overrides and counts them.
#[derive(Clone)]
pub struct HeaderInjector {
    overrides: Arc<Vec<(HeaderName, HeaderValue)>>,
    stats: Arc<ProxyStatistics>,
    log_headers: bool,
}

impl HeaderInjector {
    pub fn new(
        overrides: Vec<(HeaderName, HeaderValue)>,
        stats: Arc<ProxyStatistics>,
        log_headers: bool,
    ) -> Self {
        Self {
            overrides: Arc::new(overrides),
            stats,
            log_headers,
        }
    }

    pub fn from_config(config: &Config, stats: Arc<ProxyStatistics>) -> Result<Self, ProxyError> {
        let overrides = parse_overrides(
            config
                .injected_headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        Ok(Self::new(overrides, stats, config.log_headers))
    }

    pub fn overrides(&self) -> &[(HeaderName, HeaderValue)] {
        &self.overrides
    }

    /// Strip hop-by-hop headers, then write the overrides.
    pub fn apply(&self, mut headers: HeaderMap) -> HeaderMap {
        strip_proxy_headers(&mut headers);
        let headers = inject_headers(headers, &self.overrides);
        self.stats.record_headers_injected(self.overrides.len() as u64);

        if self.log_headers {
            for (name, value) in headers.iter() {
                debug!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        } else {
            trace!("Injected {} header(s)", self.overrides.len());
        }
        headers
    }
}

pub fn parse_overrides<'a, I>(pairs: I) -> Result<Vec<(HeaderName, HeaderValue)>, ProxyError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| {
            let header_name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ProxyError::Config(format!("Invalid header name: {}", name)))?;
            let header_value = HeaderValue::from_str(value.trim())
                .map_err(|_| ProxyError::Config(format!("Invalid value for header {}", name)))?;
            Ok((header_name, header_value))
        })
        .collect()
}

/// Parse a `Name: value` pair as given on the command line.
pub fn parse_header_arg(arg: &str) -> Result<(String, String), ProxyError> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| ProxyError::Config(format!("Expected NAME:VALUE, got {}", arg)))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ProxyError::Config(format!("Missing header name in {}", arg)));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
