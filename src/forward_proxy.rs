use crate::common::{ProxyBody, RequestTimer, ResponseBuilder};
use crate::error::{ProxyError, describe_error};
use crate::headers::HeaderInjector;
use crate::monitoring::ProxyStatistics;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use url::Host;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Connection settings for the outbound client.
#[derive(Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// 0 opens a fresh connection for every request.
    pub pool_max_idle_per_host: usize,
    /// Replaces the system trust store when set.
    pub tls: Option<native_tls::TlsConnector>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            tls: None,
        }
    }
}

pub fn build_client(settings: &UpstreamSettings) -> Result<UpstreamClient, ProxyError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(settings.connect_timeout));
    http.set_nodelay(true);

    let tls = match &settings.tls {
        Some(connector) => connector.clone(),
        None => native_tls::TlsConnector::new()
            .map_err(|e| ProxyError::Tls(format!("Failed to create TLS connector: {}", e)))?,
    };
    let connector = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_max_idle_per_host(settings.pool_max_idle_per_host);
    if settings.pool_max_idle_per_host > 0 {
        builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(settings.idle_timeout);
    }
    Ok(builder.build(connector))
}

/// Relays requests to their origin after header injection.
pub struct ForwardProxy {
    client: UpstreamClient,
    injector: HeaderInjector,
    stats: Arc<ProxyStatistics>,
    upstream_timeout: Duration,
    listener: Option<SocketAddr>,
}

impl ForwardProxy {
    pub fn new(
        client: UpstreamClient,
        injector: HeaderInjector,
        stats: Arc<ProxyStatistics>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            client,
            injector,
            stats,
            upstream_timeout,
            listener: None,
        }
    }

    /// Refuse requests that would be delivered back to this listener.
    pub fn with_listener(mut self, addr: SocketAddr) -> Self {
        self.listener = Some(addr);
        self
    }

    pub fn stats(&self) -> &Arc<ProxyStatistics> {
        &self.stats
    }

    /// Handle a plain-HTTP proxy request.
    ///
    /// An unresolvable or self-addressed target is returned as an error so the
    /// caller drops the connection. Upstream failures become a 502 response.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = match self.resolve_target(&req) {
            Ok(uri) => uri,
            Err(e) => {
                self.stats.record_error();
                warn!("Dropping request: {}", e);
                return Err(e);
            }
        };

        let timer = RequestTimer::new();
        let method = req.method().clone();
        info!("→ HTTP {} {}", method, target_uri);

        match self.relay(req, target_uri.clone()).await {
            Ok(response) => {
                self.stats.record_http_request();
                info!(
                    "← {} HTTP {} {} ({}ms)",
                    response.status().as_u16(),
                    method,
                    target_uri.host().unwrap_or("unknown"),
                    timer.elapsed_ms()
                );
                Ok(response)
            }
            Err(e) => {
                self.stats.record_error();
                warn!(
                    "Forwarding to {} failed after {}ms: {}",
                    target_uri,
                    timer.elapsed_ms(),
                    describe_error(&e)
                );
                Ok(ResponseBuilder::bad_gateway(&e.to_string()))
            }
        }
    }

    fn resolve_target<B>(&self, req: &Request<B>) -> Result<Uri, ProxyError> {
        let uri = extract_target_uri(req)?;
        if self.listener.is_some_and(|addr| targets_listener(&uri, addr)) {
            return Err(ProxyError::Parse(format!(
                "Request for {} loops back to the proxy",
                uri
            )));
        }
        Ok(uri)
    }

    /// Rewrite `req` to `target`, inject headers and send it upstream.
    pub async fn relay(
        &self,
        mut req: Request<Incoming>,
        target: Uri,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        *req.uri_mut() = target;
        let headers = std::mem::take(req.headers_mut());
        *req.headers_mut() = self.injector.apply(headers);

        debug!("Relaying {} {}", req.method(), req.uri());

        let response = timeout(self.upstream_timeout, self.client.request(req))
            .await
            .map_err(|_| ProxyError::Upstream("Request timeout".to_string()))?
            .map_err(|e| ProxyError::Upstream(describe_error(&e)))?;

        debug!("Upstream responded {}", response.status());
        Ok(response.map(|body| body.boxed()))
    }
}

/// Resolve the origin of a plain proxy request. Only absolute-form
/// `http`/`https` URIs are proxied; an origin-form request is addressed to
/// the proxy itself and has no origin.
pub fn extract_target_uri<B>(req: &Request<B>) -> Result<Uri, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyError::Parse(format!(
            "Not a proxy request: {} {}",
            req.method(),
            uri
        )));
    }

    let url = url::Url::parse(&uri.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(uri.clone()),
        other => Err(ProxyError::Parse(format!("Unsupported scheme: {}", other))),
    }
}

/// True when `uri` would be delivered back to the proxy listening on
/// `listener`.
pub fn targets_listener(uri: &Uri, listener: SocketAddr) -> bool {
    let Ok(url) = url::Url::parse(&uri.to_string()) else {
        return false;
    };
    if url.port_or_known_default() != Some(listener.port()) {
        return false;
    }
    let ip = match url.host() {
        Some(Host::Domain(domain)) => return domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
        None => return false,
    };
    let bound = listener.ip();
    ip == bound
        || ip.is_unspecified()
        || (ip.is_loopback() && (bound.is_loopback() || bound.is_unspecified()))
}
