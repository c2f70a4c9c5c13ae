use crate::ca::LeafCredential;
use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Instant;

/// Body type used for every response the proxy produces or relays.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Response builder utilities shared by the request handlers
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn bad_gateway(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, &format!("Bad Gateway: {}", message))
    }

    pub fn not_found(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, message)
    }

    /// Plain-text response with the given status
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }

    pub fn json(body: String) -> Response<ProxyBody> {
        let mut response = Response::new(full(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// `200 Connection Established` with an empty body.
    pub fn connection_established() -> Response<ProxyBody> {
        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
        response
    }
}

/// TLS configuration utilities
pub struct TlsConfig;

impl TlsConfig {
    /// Server config presenting `leaf` followed by the root, HTTP/1.1 only.
    pub fn for_leaf(leaf: &LeafCredential) -> Result<ServerConfig, ProxyError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("Unsupported protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(leaf.cert_chain(), leaf.private_key())
            .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Request timing utility for debug logging
pub struct RequestTimer {
    start_time: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertificateAuthority, generate_root};

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ResponseBuilder::not_found("Certificate not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Certificate not found");
    }

    #[test]
    fn test_connection_established_reason() {
        let response = ResponseBuilder::connection_established();
        assert_eq!(response.status(), StatusCode::OK);
        let reason = response.extensions().get::<hyper::ext::ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection Established");
    }

    #[test]
    fn test_leaf_server_config() {
        let root = generate_root("Tls Test Root").unwrap();
        let ca = CertificateAuthority::from_pem(&root.cert_pem, &root.key_pem).unwrap();
        let leaf = ca.issue_leaf("example.test").unwrap();
        let config = TlsConfig::for_leaf(&leaf).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
