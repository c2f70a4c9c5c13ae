use crate::ca::CertificateAuthority;
use crate::cert_download::CertDownload;
use crate::common::{ProxyBody, ResponseBuilder};
use crate::config::{Config, TunnelMode};
use crate::error::{ProxyError, describe_error};
use crate::forward_proxy::{ForwardProxy, UpstreamSettings, build_client};
use crate::headers::HeaderInjector;
use crate::leaf_cache::LeafCertificateCache;
use crate::monitoring::{ProxyStatistics, proxy_snapshot};
use crate::tunnel::{ConnectStrategy, InterceptingTunnel, OpaqueTunnel, TunnelContext, handle_connect};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bind `host:port`, moving to the next port while the current one is taken.
///
/// Only `AddrInUse` triggers a retry; any other bind error is returned as is.
pub async fn bind_with_retry(host: IpAddr, port: u16, attempts: u16) -> Result<TcpListener, ProxyError> {
    let attempts = attempts.max(1);
    let mut last_port = port;

    for offset in 0..attempts {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        last_port = candidate;

        match TcpListener::bind(SocketAddr::new(host, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!("Port {} is in use, listening on {} instead", port, candidate);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {} is in use", candidate);
            }
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }

    Err(ProxyError::BindConflict {
        first_port: port,
        last_port,
    })
}

/// Picks the CONNECT strategy for the configured tunnel mode.
pub struct ProxyFactory;

impl ProxyFactory {
    pub fn create_strategy(
        config: &Config,
        cache: Arc<LeafCertificateCache>,
        intercept_forwarder: Arc<ForwardProxy>,
    ) -> Arc<dyn ConnectStrategy> {
        info!("Creating CONNECT strategy for mode: {}", config.tunnel_mode);
        match config.tunnel_mode {
            TunnelMode::Intercept => Arc::new(InterceptingTunnel::new(
                cache,
                intercept_forwarder,
                Duration::from_secs(config.idle_timeout_secs),
            )),
            TunnelMode::Opaque => Arc::new(OpaqueTunnel::new(Duration::from_secs(
                config.connect_timeout_secs,
            ))),
        }
    }
}

pub struct ProxyServerBuilder {
    config: Config,
    ca: Arc<CertificateAuthority>,
    upstream_tls: Option<native_tls::TlsConnector>,
    stats: Option<Arc<ProxyStatistics>>,
}

impl ProxyServerBuilder {
    /// Trust roots for outbound TLS; the system store is used otherwise.
    pub fn upstream_tls(mut self, connector: native_tls::TlsConnector) -> Self {
        self.upstream_tls = Some(connector);
        self
    }

    pub fn stats(mut self, stats: Arc<ProxyStatistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub async fn bind(self) -> Result<ProxyServer, ProxyError> {
        let config = self.config;
        let stats = self.stats.unwrap_or_default();

        let injector = HeaderInjector::from_config(&config, Arc::clone(&stats))?;
        let upstream_timeout = Duration::from_secs(config.upstream_timeout_secs);
        let settings = UpstreamSettings {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            tls: self.upstream_tls,
        };

        let listener =
            bind_with_retry(config.listen_host, config.port, config.port_retry_max).await?;
        let local_addr = listener.local_addr()?;

        let plain = Arc::new(
            ForwardProxy::new(
                build_client(&settings)?,
                injector.clone(),
                Arc::clone(&stats),
                upstream_timeout,
            )
            .with_listener(local_addr),
        );
        // every intercepted request gets its own outbound connection
        let intercept_settings = UpstreamSettings {
            pool_max_idle_per_host: 0,
            ..settings
        };
        let intercept = Arc::new(ForwardProxy::new(
            build_client(&intercept_settings)?,
            injector,
            Arc::clone(&stats),
            upstream_timeout,
        ));

        let cache = Arc::new(LeafCertificateCache::new(
            self.ca,
            config.leaf_cache_capacity,
        ));
        let strategy = ProxyFactory::create_strategy(&config, Arc::clone(&cache), intercept);

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handler = Arc::new(RequestHandler {
            cert: CertDownload::new(config.ca_cert_path.clone()),
            forwarder: plain,
            tunnel: TunnelContext {
                strategy,
                stats: Arc::clone(&stats),
                tracker: tracker.clone(),
                shutdown: shutdown.clone(),
                max_lifetime: Duration::from_secs(config.max_connection_lifetime_secs),
            },
            stats: Arc::clone(&stats),
            cache: Arc::clone(&cache),
        });

        Ok(ProxyServer {
            listener,
            local_addr,
            handler,
            stats,
            cache,
            tracker,
            shutdown,
            limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
            header_read_timeout: Duration::from_secs(config.idle_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            tunnel_mode: config.tunnel_mode,
        })
    }
}

/// Listening proxy ready to accept connections.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<RequestHandler>,
    stats: Arc<ProxyStatistics>,
    cache: Arc<LeafCertificateCache>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    limiter: Arc<Semaphore>,
    header_read_timeout: Duration,
    shutdown_grace: Duration,
    tunnel_mode: TunnelMode,
}

impl ProxyServer {
    pub fn builder(config: Config, ca: Arc<CertificateAuthority>) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            ca,
            upstream_tls: None,
            stats: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ProxyStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn leaf_cache(&self) -> Arc<LeafCertificateCache> {
        Arc::clone(&self.cache)
    }

    /// Token that stops the accept loop and drains open connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires, then wait up to
    /// the grace period for in-flight connections and tunnels.
    pub async fn run(self) -> Result<(), ProxyError> {
        info!(
            "Proxy listening on http://{} (tunnel mode: {})",
            self.local_addr, self.tunnel_mode
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
                warn!("Connection limit reached, rejecting connection from: {}", remote_addr);
                drop(stream);
                continue;
            };

            let handler = Arc::clone(&self.handler);
            let shutdown = self.shutdown.child_token();
            let header_read_timeout = self.header_read_timeout;
            self.tracker.spawn(async move {
                serve_connection(stream, remote_addr, handler, header_read_timeout, shutdown).await;
                drop(permit);
            });
        }

        info!("Shutting down, waiting for open connections");
        drop(self.listener);
        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connection(s) still open after {:?}, closing",
                self.tracker.len(),
                self.shutdown_grace
            );
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    handler: Arc<RequestHandler>,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    debug!("Connection established from: {}", remote_addr);

    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { handler.dispatch(req).await }
    });

    let conn = ServerBuilder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} closed: {}", remote_addr, describe_error(&e));
    }
}

struct RequestHandler {
    cert: CertDownload,
    forwarder: Arc<ForwardProxy>,
    tunnel: TunnelContext,
    stats: Arc<ProxyStatistics>,
    cache: Arc<LeafCertificateCache>,
}

impl RequestHandler {
    async fn dispatch(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        if req.method() == Method::CONNECT {
            return handle_connect(req, &self.tunnel).await;
        }
        if CertDownload::matches(&req) {
            return Ok(self.cert.respond().await);
        }
        if is_stats_request(&req) {
            return Ok(ResponseBuilder::json(proxy_snapshot(&self.stats, &self.cache).to_json()));
        }
        self.forwarder.forward(req).await
    }
}

fn is_stats_request<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET && req.uri().authority().is_none() && req.uri().path() == "/stats"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_bind_retries_next_port() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }

        match bind_with_retry(LOCALHOST, port, 5).await {
            Ok(listener) => {
                let bound = listener.local_addr().unwrap().port();
                assert!(bound > port && bound < port + 5);
            }
            // the neighbouring ports happened to be busy too
            Err(e) => assert!(matches!(e, ProxyError::BindConflict { .. })),
        }
    }

    #[tokio::test]
    async fn test_bind_exhaustion_reports_range() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_with_retry(LOCALHOST, port, 1).await.unwrap_err();
        match err {
            ProxyError::BindConflict { first_port, last_port } => {
                assert_eq!(first_port, port);
                assert_eq!(last_port, port);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_factory_follows_tunnel_mode() {
        let root = crate::ca::generate_root("Factory Test Root").unwrap();
        let ca = Arc::new(CertificateAuthority::from_pem(&root.cert_pem, &root.key_pem).unwrap());
        let cache = Arc::new(LeafCertificateCache::new(ca, 4));
        let stats = Arc::new(ProxyStatistics::new());
        let forwarder = Arc::new(ForwardProxy::new(
            build_client(&UpstreamSettings::default()).unwrap(),
            HeaderInjector::new(Vec::new(), Arc::clone(&stats), false),
            stats,
            Duration::from_secs(5),
        ));

        for mode in [TunnelMode::Intercept, TunnelMode::Opaque] {
            let config = Config {
                tunnel_mode: mode,
                ..Config::default()
            };
            let strategy =
                ProxyFactory::create_strategy(&config, Arc::clone(&cache), Arc::clone(&forwarder));
            assert_eq!(strategy.mode(), mode);
        }
    }

    #[test]
    fn test_stats_request_matching() {
        let local = Request::get("/stats").body(()).unwrap();
        assert!(is_stats_request(&local));
        let proxied = Request::get("http://example.com/stats").body(()).unwrap();
        assert!(!is_stats_request(&proxied));
    }
}
