use crate::common::{ProxyBody, ResponseBuilder, full};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response};
use log::{info, warn};
use std::path::PathBuf;

pub const CERT_PATHS: &[&str] = &["/cert", "/certificate"];
const ATTACHMENT: &str = "attachment; filename=\"splice-proxy-ca.pem\"";

/// Serves the root certificate to clients that want to trust it.
#[derive(Debug, Clone)]
pub struct CertDownload {
    cert_path: PathBuf,
}

impl CertDownload {
    pub fn new(cert_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
        }
    }

    /// True for an origin-form `/cert` or `/certificate`, whatever the
    /// method. Absolute proxy requests for some origin's `/cert` are never
    /// matched.
    pub fn matches<B>(req: &Request<B>) -> bool {
        req.uri().authority().is_none() && CERT_PATHS.contains(&req.uri().path())
    }

    /// Read the certificate from disk on every call so a replaced root is
    /// served without a restart.
    pub async fn respond(&self) -> Response<ProxyBody> {
        match tokio::fs::read(&self.cert_path).await {
            Ok(bytes) => {
                info!("Serving root certificate ({} bytes)", bytes.len());
                let mut response = Response::new(full(bytes));
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-pem-file"));
                headers.insert(CONTENT_DISPOSITION, HeaderValue::from_static(ATTACHMENT));
                response
            }
            Err(e) => {
                warn!("Root certificate {} unavailable: {}", self.cert_path.display(), e);
                ResponseBuilder::not_found("Certificate not found")
            }
        }
    }
}
