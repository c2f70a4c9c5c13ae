//! Shared fixtures for the proxy integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use splice_proxy::ca::{CertificateAuthority, generate_root};
use splice_proxy::common::TlsConfig;
use splice_proxy::config::Config;
use splice_proxy::error::ProxyError;
use splice_proxy::monitoring::ProxyStatistics;
use splice_proxy::proxy::ProxyServer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Root credential written to a temporary directory.
pub struct TestCa {
    pub dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
    pub authority: Arc<CertificateAuthority>,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = generate_root(common_name).unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");
        std::fs::write(&cert_path, &root.cert_pem).unwrap();
        std::fs::write(&key_path, &root.key_pem).unwrap();
        let authority = Arc::new(CertificateAuthority::load(&key_path, &cert_path).unwrap());

        Self {
            dir,
            cert_path,
            key_path,
            cert_pem: root.cert_pem,
            authority,
        }
    }

    /// Loopback config on an ephemeral port with no periodic reporting.
    pub fn config(&self) -> Config {
        Config {
            listen_host: "127.0.0.1".parse().unwrap(),
            port: 0,
            port_retry_max: 1,
            ca_cert_path: self.cert_path.clone(),
            ca_key_path: self.key_path.clone(),
            stats_interval_secs: 0,
            shutdown_grace_secs: 2,
            ..Config::default()
        }
    }

    /// Outbound connector that trusts only this root.
    pub fn native_connector(&self) -> native_tls::TlsConnector {
        let root = native_tls::Certificate::from_pem(self.cert_pem.as_bytes()).unwrap();
        native_tls::TlsConnector::builder()
            .add_root_certificate(root)
            .build()
            .unwrap()
    }
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub stats: Arc<ProxyStatistics>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("proxy did not stop in time")
            .unwrap()
            .unwrap();
    }
}

pub async fn start_proxy(
    config: Config,
    ca: &TestCa,
    upstream_tls: Option<native_tls::TlsConnector>,
) -> RunningProxy {
    let mut builder = ProxyServer::builder(config, Arc::clone(&ca.authority));
    if let Some(connector) = upstream_tls {
        builder = builder.upstream_tls(connector);
    }
    let server = builder.bind().await.unwrap();

    RunningProxy {
        addr: server.local_addr(),
        stats: server.stats(),
        shutdown: server.shutdown_token(),
        handle: tokio::spawn(server.run()),
    }
}

/// Answers with the request path followed by one `name: value` line per header.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut lines = vec![format!("path: {}", req.uri().path())];
    for (name, value) in req.headers() {
        lines.push(format!("{}: {}", name, value.to_str().unwrap_or("<binary>")));
    }
    Ok(Response::new(Full::new(Bytes::from(lines.join("\n")))))
}

pub async fn start_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// HTTPS echo origin for `localhost`, certified by `ca`.
pub async fn start_tls_origin(ca: &TestCa) -> SocketAddr {
    let leaf = ca.authority.issue_leaf("localhost").unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(TlsConfig::for_leaf(&leaf).unwrap()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

pub fn empty_request(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::new(Bytes::new())).unwrap()
}

pub async fn send_request<S>(io: S, req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

/// Client connection for several sequential requests.
pub async fn open_session<S>(io: S) -> SendRequest<Full<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender
}

pub async fn send_on(sender: &mut SendRequest<Full<Bytes>>, req: Request<Full<Bytes>>) -> (StatusCode, Bytes) {
    sender.ready().await.unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

/// Poll until `errors` reaches `expected` or a second has passed.
pub async fn wait_for_errors(stats: &ProxyStatistics, expected: u64) -> u64 {
    let mut errors = 0;
    for _ in 0..50 {
        errors = stats.snapshot().errors;
        if errors >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    errors
}

/// Send `CONNECT authority` and return the stream positioned after the
/// response head, together with the head itself.
pub async fn open_tunnel(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        response.push(byte[0]);
    }
    (stream, String::from_utf8_lossy(&response).into_owned())
}

/// Client-side TLS over an established tunnel, trusting only `ca`.
pub async fn client_tls(
    stream: TcpStream,
    ca: &TestCa,
    server_name: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, std::io::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.authority.root().cert_der().clone()).unwrap();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = rustls::pki_types::ServerName::try_from(server_name.to_string()).unwrap();
    tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
}
