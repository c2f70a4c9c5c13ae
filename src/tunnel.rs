//! CONNECT handling.
//!
//! A CONNECT request moves through [`TunnelState`]: the target is parsed,
//! the strategy prepares whatever it needs before the `200` is written, and
//! the upgraded socket is then either terminated as a TLS server
//! ([`InterceptingTunnel`]) or relayed byte for byte ([`OpaqueTunnel`]).

use crate::common::{ProxyBody, RequestTimer, ResponseBuilder, TlsConfig};
use crate::config::TunnelMode;
use crate::error::{ProxyError, describe_error};
use crate::forward_proxy::ForwardProxy;
use crate::leaf_cache::LeafCertificateCache;
use crate::monitoring::ProxyStatistics;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, info, warn};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Destination named by a CONNECT request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub hostname: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::Parse(format!("Invalid CONNECT target: {}", uri)))?;
        Self::parse(authority.as_str())
    }

    /// Parse `host[:port]`, accepting bracketed IPv6 literals.
    pub fn parse(authority: &str) -> Result<Self, ProxyError> {
        let authority = authority.trim();
        let invalid = || ProxyError::Parse(format!("Invalid CONNECT target: {}", authority));

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                // a bare IPv6 literal has several colons and no port
                Some((host, _)) if host.contains(':') => (authority, None),
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid)?,
            None => DEFAULT_CONNECT_PORT,
        };

        Ok(Self {
            hostname: host.to_ascii_lowercase(),
            port,
        })
    }

    /// `host:port` suitable for a socket connect or a URI authority.
    pub fn authority(&self) -> String {
        if self.hostname.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// Absolute `https` URI for a request path received inside the tunnel.
    pub fn request_uri(&self, inner: &Uri) -> Result<Uri, ProxyError> {
        let path = inner
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = if self.port == DEFAULT_CONNECT_PORT {
            self.authority()
                .trim_end_matches(":443")
                .to_string()
        } else {
            self.authority()
        };
        Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path)
            .build()
            .map_err(|e| ProxyError::Parse(e.to_string()))
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingConnect,
    TunnelEstablished,
    TerminatingTls,
    Active,
    Closed,
    Failed,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }

    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (AwaitingConnect, TunnelEstablished)
            | (TunnelEstablished, TerminatingTls)
            | (TunnelEstablished, Active)
            | (TerminatingTls, Active)
            | (Active, Closed) => true,
            _ => false,
        }
    }
}

/// Tracks one tunnel's state and logs each transition.
pub struct TunnelLifecycle {
    target: String,
    state: TunnelState,
}

impl TunnelLifecycle {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: TunnelState::AwaitingConnect,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn advance(&mut self, next: TunnelState) {
        if self.state.can_transition_to(next) {
            debug!("Tunnel {}: {:?} -> {:?}", self.target, self.state, next);
            self.state = next;
        } else {
            warn!(
                "Tunnel {}: ignoring transition {:?} -> {:?}",
                self.target, self.state, next
            );
        }
    }
}

/// Work a tunnel needs before and after the `200 Connection Established`.
#[async_trait]
pub trait ConnectStrategy: Send + Sync {
    fn mode(&self) -> TunnelMode;

    /// Runs before the 200 is written; an error here means no tunnel.
    async fn prepare(&self, target: &ConnectTarget) -> Result<Box<dyn EstablishedTunnel>, ProxyError>;
}

#[async_trait]
pub trait EstablishedTunnel: Send {
    async fn serve(
        self: Box<Self>,
        io: TokioIo<Upgraded>,
        lifecycle: &mut TunnelLifecycle,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError>;
}

/// Terminates TLS with a per-host leaf and relays each decrypted request.
pub struct InterceptingTunnel {
    cache: Arc<LeafCertificateCache>,
    forwarder: Arc<ForwardProxy>,
    header_read_timeout: Duration,
}

impl InterceptingTunnel {
    pub fn new(
        cache: Arc<LeafCertificateCache>,
        forwarder: Arc<ForwardProxy>,
        header_read_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            forwarder,
            header_read_timeout,
        }
    }
}

#[async_trait]
impl ConnectStrategy for InterceptingTunnel {
    fn mode(&self) -> TunnelMode {
        TunnelMode::Intercept
    }

    async fn prepare(&self, target: &ConnectTarget) -> Result<Box<dyn EstablishedTunnel>, ProxyError> {
        let leaf = self.cache.get_or_issue(&target.hostname).await?;
        let config = TlsConfig::for_leaf(&leaf)?;
        Ok(Box::new(InterceptedSession {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            target: target.clone(),
            forwarder: Arc::clone(&self.forwarder),
            header_read_timeout: self.header_read_timeout,
        }))
    }
}

struct InterceptedSession {
    acceptor: TlsAcceptor,
    target: ConnectTarget,
    forwarder: Arc<ForwardProxy>,
    header_read_timeout: Duration,
}

#[async_trait]
impl EstablishedTunnel for InterceptedSession {
    async fn serve(
        self: Box<Self>,
        io: TokioIo<Upgraded>,
        lifecycle: &mut TunnelLifecycle,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let InterceptedSession {
            acceptor,
            target,
            forwarder,
            header_read_timeout,
        } = *self;
        lifecycle.advance(TunnelState::TerminatingTls);

        let tls_stream = match acceptor.accept(io).await {
            Ok(stream) => stream,
            Err(e) => {
                forwarder.stats().record_error();
                return Err(ProxyError::Tls(format!(
                    "Client handshake for {} failed: {}",
                    target, e
                )));
            }
        };
        lifecycle.advance(TunnelState::Active);

        let target = Arc::new(target);
        let service = service_fn(move |req: Request<Incoming>| {
            let target = Arc::clone(&target);
            let forwarder = Arc::clone(&forwarder);
            async move { relay_intercepted(req, &target, &forwarder).await }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout)
            .keep_alive(true)
            .serve_connection(TokioIo::new(tls_stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => result.map_err(ProxyError::from),
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await.map_err(ProxyError::from)
            }
        }
    }
}

async fn relay_intercepted(
    req: Request<Incoming>,
    target: &ConnectTarget,
    forwarder: &ForwardProxy,
) -> Result<Response<ProxyBody>, ProxyError> {
    let timer = RequestTimer::new();
    let uri = target.request_uri(req.uri())?;
    let method = req.method().clone();
    info!("→ HTTPS {} {}", method, uri);

    let stats = forwarder.stats();
    match forwarder.relay(req, uri.clone()).await {
        Ok(response) => {
            stats.record_intercepted_request();
            info!(
                "← {} HTTPS {} {} ({}ms)",
                response.status().as_u16(),
                method,
                target.hostname,
                timer.elapsed_ms()
            );
            Ok(response)
        }
        Err(e) => {
            stats.record_error();
            warn!(
                "Intercepted request to {} failed after {}ms: {}",
                uri,
                timer.elapsed_ms(),
                describe_error(&e)
            );
            Ok(ResponseBuilder::bad_gateway(&e.to_string()))
        }
    }
}

/// Relays the encrypted stream without looking inside it.
pub struct OpaqueTunnel {
    connect_timeout: Duration,
}

impl OpaqueTunnel {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ConnectStrategy for OpaqueTunnel {
    fn mode(&self) -> TunnelMode {
        TunnelMode::Opaque
    }

    async fn prepare(&self, target: &ConnectTarget) -> Result<Box<dyn EstablishedTunnel>, ProxyError> {
        let addr = target.authority();
        let upstream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Upstream(format!("Connect to {} timed out", addr)))?
            .map_err(|e| ProxyError::Upstream(format!("Connect to {} failed: {}", addr, e)))?;
        let _ = upstream.set_nodelay(true);
        Ok(Box::new(OpaqueSession {
            upstream,
            target: target.clone(),
        }))
    }
}

struct OpaqueSession {
    upstream: TcpStream,
    target: ConnectTarget,
}

#[async_trait]
impl EstablishedTunnel for OpaqueSession {
    async fn serve(
        self: Box<Self>,
        io: TokioIo<Upgraded>,
        lifecycle: &mut TunnelLifecycle,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let OpaqueSession { mut upstream, target } = *self;
        let mut io = io;
        lifecycle.advance(TunnelState::Active);
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut io, &mut upstream) => {
                let (up, down) = result?;
                debug!("Tunnel {} relayed {} bytes up, {} bytes down", target, up, down);
            }
            _ = shutdown.cancelled() => {
                debug!("Tunnel {} closed by shutdown", target);
            }
        }
        Ok(())
    }
}

/// Shared pieces every CONNECT handler needs.
#[derive(Clone)]
pub struct TunnelContext {
    pub strategy: Arc<dyn ConnectStrategy>,
    pub stats: Arc<ProxyStatistics>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub max_lifetime: Duration,
}

/// Answer a CONNECT request and spawn the tunnel on the upgraded socket.
///
/// A malformed target or a failed leaf issuance returns an error so the
/// connection is dropped without a response. An unreachable destination in
/// opaque mode is answered with 502.
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: &TunnelContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    let target = match ConnectTarget::from_uri(req.uri()) {
        Ok(target) => target,
        Err(e) => {
            ctx.stats.record_error();
            return Err(e);
        }
    };
    info!("→ HTTPS CONNECT {}", target);

    let mut lifecycle = TunnelLifecycle::new(target.to_string());
    let session = match ctx.strategy.prepare(&target).await {
        Ok(session) => session,
        Err(e @ ProxyError::Upstream(_)) => {
            ctx.stats.record_error();
            lifecycle.advance(TunnelState::Failed);
            warn!("CONNECT {} failed: {}", target, e);
            return Ok(ResponseBuilder::bad_gateway(&e.to_string()));
        }
        Err(e) => {
            ctx.stats.record_error();
            lifecycle.advance(TunnelState::Failed);
            warn!("CONNECT {} dropped: {}", target, e);
            return Err(e);
        }
    };

    ctx.stats.record_https_request();
    lifecycle.advance(TunnelState::TunnelEstablished);

    let stats = Arc::clone(&ctx.stats);
    let shutdown = ctx.shutdown.child_token();
    let max_lifetime = ctx.max_lifetime;
    ctx.tracker.spawn(async move {
        let io = match hyper::upgrade::on(req).await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                stats.record_error();
                lifecycle.advance(TunnelState::Failed);
                warn!("Upgrade failed for {}: {}", target, e);
                return;
            }
        };

        stats.tunnel_opened();
        let outcome = tokio::time::timeout(
            max_lifetime,
            session.serve(io, &mut lifecycle, shutdown),
        )
        .await;
        stats.tunnel_closed();

        match outcome {
            Ok(Ok(())) => lifecycle.advance(TunnelState::Closed),
            Ok(Err(e)) => {
                debug!("Tunnel {} ended: {}", target, describe_error(&e));
                finish(&mut lifecycle);
            }
            Err(_) => {
                info!("Tunnel {} reached its maximum lifetime", target);
                finish(&mut lifecycle);
            }
        }
    });

    Ok(ResponseBuilder::connection_established())
}

/// Close a tunnel that stopped early: clean if it was serving, failed otherwise.
fn finish(lifecycle: &mut TunnelLifecycle) {
    if lifecycle.state() == TunnelState::Active {
        lifecycle.advance(TunnelState::Closed);
    } else {
        lifecycle.advance(TunnelState::Failed);
    }
}
