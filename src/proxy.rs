//! Proxy server implementation
//! Terminates TLS, tags requests with forwarding headers and hands them to
//! the router and upstream transport

use crate::access_log::{AccessLogSink, TracingAccessLog};
use crate::certificate::CertificateManager;
use crate::error::{Result, UpstreamError};
use crate::mapping::MappingTable;
use crate::router::{request_host, route};
use crate::transport::{BoxError, ProxyBody, RequestContext, UpstreamTransport};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Bound on reading request headers and on completing the TLS handshake
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on obtaining the backend response
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request head accepted from a client
pub const MAX_HEADER_BYTES: usize = 1 << 20;

pub const DEFAULT_TLS_PORT: u16 = 4443;

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Mapping specification, e.g. `*:3000,api:4000`
    pub mappings: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub tls_port: u16,
    /// Plain HTTP listener, disabled when `None` or zero
    pub http_port: Option<u16>,
}

impl ProxyConfig {
    pub fn new(mappings: impl Into<String>, certificates: &CertificateManager) -> Self {
        Self {
            mappings: mappings.into(),
            cert_path: certificates.cert_path().to_path_buf(),
            key_path: certificates.key_path().to_path_buf(),
            tls_port: DEFAULT_TLS_PORT,
            http_port: None,
        }
    }

    fn plain_port(&self) -> Option<u16> {
        self.http_port.filter(|port| *port > 0)
    }
}

/// Shared request pipeline: forwarding headers, routing, upstream round trip
pub struct ProxyHandler {
    table: MappingTable,
    transport: UpstreamTransport,
}

impl ProxyHandler {
    pub fn new(table: MappingTable, transport: UpstreamTransport) -> Self {
        Self { table, transport }
    }

    /// Serve one request. Always yields a response; routing and backend
    /// failures come back as 502.
    pub async fn handle(
        &self,
        mut req: Request<ProxyBody>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        if is_tls {
            req.headers_mut()
                .append(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        }
        if let Ok(value) = HeaderValue::from_str(&remote_addr.to_string()) {
            req.headers_mut().append(X_FORWARDED_FOR, value);
        }

        let host = request_host(&req);
        let ctx = RequestContext::from_request(&req, remote_addr, &host);
        let decision = route(&self.table, &host);

        let upstream_uri = match decision.upstream_uri(req.uri()) {
            Some(uri) => uri,
            None => {
                return self
                    .transport
                    .reject(UpstreamError::Unrouted { host }, &ctx)
                    .into_response()
            }
        };

        debug!("{}{} -> {}", host, ctx.request_uri, upstream_uri);

        *req.uri_mut() = upstream_uri;
        *req.version_mut() = Version::HTTP_11;

        self.transport.round_trip(req, &ctx).await.into_response()
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    handler: Arc<ProxyHandler>,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Build the server, logging requests through `tracing`.
    ///
    /// Any failure here is fatal: no listener is opened.
    pub fn initialize(config: ProxyConfig) -> Result<Self> {
        Self::with_access_log(config, Arc::new(TracingAccessLog))
    }

    pub fn with_access_log(config: ProxyConfig, access_log: Arc<dyn AccessLogSink>) -> Result<Self> {
        let table = MappingTable::parse(&config.mappings)?;

        let material = CertificateManager::new(&config.cert_path, &config.key_path).load()?;
        let tls_acceptor = TlsAcceptor::from(material.server_config()?);

        let transport = UpstreamTransport::new(access_log).with_timeout(WRITE_TIMEOUT);

        Ok(Self {
            config,
            handler: Arc::new(ProxyHandler::new(table, transport)),
            tls_acceptor,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the listeners and serve until the process is stopped
    pub async fn run(self) -> Result<()> {
        let tls_addr = SocketAddr::from(([0, 0, 0, 0], self.config.tls_port));
        let tls_listener = TcpListener::bind(tls_addr).await?;

        let plain_listener = match self.config.plain_port() {
            Some(port) => {
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                Some((TcpListener::bind(addr).await?, addr))
            }
            None => None,
        };

        if let Some((listener, addr)) = plain_listener {
            info!("Listening for HTTP on {}", addr);
            tokio::spawn(Self::serve_plain(listener, self.handler.clone()));
        }

        info!("Listening for TLS on {}", tls_addr);
        Self::serve_tls(tls_listener, self.tls_acceptor, self.handler).await;

        Ok(())
    }

    async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, handler: Arc<ProxyHandler>) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept TLS connection: {}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let handler = handler.clone();

            tokio::spawn(async move {
                let tls_stream = match tokio::time::timeout(READ_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {} timed out", remote_addr);
                        return;
                    }
                };

                if let Err(e) = Self::handle_connection(tls_stream, remote_addr, handler, true).await {
                    debug!("TLS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn serve_plain(listener: TcpListener, handler: Arc<ProxyHandler>) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            };

            let handler = handler.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, remote_addr, handler, false).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve HTTP/1.1 requests on one accepted connection
    async fn handle_connection<S>(
        stream: S,
        remote_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        is_tls: bool,
    ) -> std::result::Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_TIMEOUT)
            .max_buf_size(MAX_HEADER_BYTES)
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let req = req.map(|body| body.map_err(BoxError::from).boxed());
                        Ok::<_, Infallible>(handler.handle(req, remote_addr, is_tls).await)
                    }
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::AccessLogEntry;
    use bytes::Bytes;
    use http_body_util::Empty;
    use hyper::header::HOST;
    use hyper::StatusCode;
    use parking_lot::Mutex;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingLog {
        entries: Mutex<Vec<AccessLogEntry>>,
    }

    impl AccessLogSink for RecordingLog {
        fn record(&self, entry: &AccessLogEntry) {
            self.entries.lock().push(entry.clone());
        }
    }

    fn request(host: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri("/status")
            .header(HOST, host)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    fn make_handler(spec: &str, log: Arc<RecordingLog>) -> ProxyHandler {
        ProxyHandler::new(MappingTable::parse(spec).unwrap(), UpstreamTransport::new(log))
    }

    #[tokio::test]
    async fn test_tls_request_gets_forwarding_headers() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-forwarded-proto", "https"))
            .and(header("x-forwarded-for", "10.0.0.7:5555"))
            .and(header("host", "app.local.dev"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&backend)
            .await;

        let port = backend.address().port();
        let log = Arc::new(RecordingLog::default());
        let handler = make_handler(&format!("app:{}", port), log.clone());

        let res = handler
            .handle(request("app.local.dev"), "10.0.0.7:5555".parse().unwrap(), true)
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        let entries = log.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].host, "app.local.dev");
        assert_eq!(entries[0].uri, "/status");
        assert_eq!(entries[0].status, 200);
    }

    #[tokio::test]
    async fn test_plain_request_uses_wildcard() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("x-forwarded-for"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&backend)
            .await;

        let port = backend.address().port();
        let handler = make_handler(&format!("*:{}", port), Arc::new(RecordingLog::default()));

        let res = handler
            .handle(request("anything.local.dev"), "10.0.0.7:5555".parse().unwrap(), false)
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unrouted_host_is_502() {
        let log = Arc::new(RecordingLog::default());
        let handler = make_handler("app:5000", log.clone());

        let res = handler
            .handle(request("other.local.dev"), "10.0.0.7:5555".parse().unwrap(), true)
            .await;

        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("no route for host"));
        assert_eq!(log.entries.lock().len(), 1);
    }

    #[test]
    fn test_zero_http_port_disables_listener() {
        let certificates = CertificateManager::in_dir("/tmp/tlsmux-test");
        let mut config = ProxyConfig::new("*:3000", &certificates);
        assert_eq!(config.tls_port, DEFAULT_TLS_PORT);
        assert_eq!(config.plain_port(), None);

        config.http_port = Some(0);
        assert_eq!(config.plain_port(), None);

        config.http_port = Some(8080);
        assert_eq!(config.plain_port(), Some(8080));
    }

    #[test]
    fn test_initialize_without_certificate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::new("*:3000", &CertificateManager::in_dir(dir.path()));

        let err = ProxyServer::initialize(config).err().unwrap();
        assert!(err.to_string().contains("run setup first"));
    }

    #[test]
    fn test_initialize_with_bad_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::new("a:x", &CertificateManager::in_dir(dir.path()));

        let err = ProxyServer::initialize(config).err().unwrap();
        assert!(matches!(err, crate::Error::Config { .. }));
    }
}
