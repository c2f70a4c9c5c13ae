pub mod ca;
pub mod cert_download;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod forward_proxy;
pub mod headers;
pub mod leaf_cache;
pub mod logging;
pub mod monitoring;
pub mod proxy;
pub mod tunnel;

pub use ca::CertificateAuthority;
pub use config::{Config, TunnelMode};
pub use error::ProxyError;
pub use proxy::{ProxyFactory, ProxyServer};
