//! Upstream transport
//! Performs the HTTP round trip to a local backend and records one access log
//! line per request. Backend failures become a synthesized 502 instead of an
//! error so the client always gets a well-formed response.

use crate::access_log::{basic_auth_user, AccessLogEntry, AccessLogSink, PLACEHOLDER};
use crate::error::UpstreamError;
use bytes::Bytes;
use chrono::Local;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

/// Error carried by proxied bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the proxy in both directions
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Default bound on a backend round trip, from sending the request to the
/// last byte of the response body
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Facts about the inbound request captured before it is rewritten
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote_addr: SocketAddr,
    pub host: String,
    pub method: Method,
    pub request_uri: String,
    pub version: Version,
    pub user: String,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>, remote_addr: SocketAddr, host: &str) -> Self {
        Self {
            remote_addr,
            host: host.to_string(),
            method: req.method().clone(),
            request_uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.uri().to_string()),
            version: req.version(),
            user: basic_auth_user(req.headers()).unwrap_or_else(|| PLACEHOLDER.to_string()),
        }
    }
}

/// Result of one round trip
#[derive(Debug)]
pub enum UpstreamOutcome {
    /// The backend answered, whatever its status
    Forwarded(Response<DeadlineBody<Incoming>>),
    /// No response could be obtained
    Unreachable(UpstreamError),
}

impl UpstreamOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamOutcome::Forwarded(res) => res.status(),
            UpstreamOutcome::Unreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Convert into the response sent back to the client
    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            UpstreamOutcome::Forwarded(res) => {
                let mut res = res.map(|body| body.boxed());
                strip_hop_by_hop(res.headers_mut());
                res
            }
            UpstreamOutcome::Unreachable(err) => bad_gateway(&err),
        }
    }
}

/// Response body that fails once the round-trip deadline passes.
///
/// A backend that sends its head in time but then stalls is cut off, and
/// the client connection is aborted rather than left hanging.
#[derive(Debug)]
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
    port: u16,
    secs: u64,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant, port: u16, secs: u64) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            port,
            secs,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|f| f.map_err(Into::into)));
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                warn!("Backend on port {} stalled while sending its body", this.port);
                let err = UpstreamError::Stalled {
                    port: this.port,
                    secs: this.secs,
                };
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Text of the synthesized 502 body
pub fn error_message(err: &UpstreamError) -> String {
    format!("tlsmux proxy error: {}", err)
}

/// Build the 502 response for an upstream failure
pub fn bad_gateway(err: &UpstreamError) -> Response<ProxyBody> {
    let body = Bytes::from(error_message(err));
    let len = body.len();
    let mut res = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    res.headers_mut().insert(CONTENT_LENGTH, len.into());
    res
}

/// Remove connection-scoped headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// HTTP transport to local backends
pub struct UpstreamTransport {
    client: Client<HttpConnector, ProxyBody>,
    timeout: Duration,
    access_log: Arc<dyn AccessLogSink>,
}

impl UpstreamTransport {
    pub fn new(access_log: Arc<dyn AccessLogSink>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout: UPSTREAM_TIMEOUT,
            access_log,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `req`, whose URI already targets the backend.
    ///
    /// Never fails: transport errors and timeouts come back as
    /// [`UpstreamOutcome::Unreachable`]. Exactly one access log line is
    /// written per call.
    pub async fn round_trip(&self, mut req: Request<ProxyBody>, ctx: &RequestContext) -> UpstreamOutcome {
        strip_hop_by_hop(req.headers_mut());
        let port = req.uri().port_u16().unwrap_or(80);
        let secs = self.timeout.as_secs();
        let deadline = Instant::now() + self.timeout;

        let outcome = match tokio::time::timeout_at(deadline, self.client.request(req)).await {
            Ok(Ok(res)) => UpstreamOutcome::Forwarded(
                res.map(|body| DeadlineBody::new(body, deadline, port, secs)),
            ),
            Ok(Err(e)) => {
                warn!("Backend on port {} unreachable: {}", port, e);
                UpstreamOutcome::Unreachable(UpstreamError::Connect(e))
            }
            Err(_) => {
                warn!("Backend on port {} timed out", port);
                UpstreamOutcome::Unreachable(UpstreamError::Timeout { port, secs })
            }
        };

        self.record(ctx, &outcome);
        outcome
    }

    /// Account for a request that never reached a backend
    pub fn reject(&self, err: UpstreamError, ctx: &RequestContext) -> UpstreamOutcome {
        debug!("Rejecting request for {}: {}", ctx.host, err);
        let outcome = UpstreamOutcome::Unreachable(err);
        self.record(ctx, &outcome);
        outcome
    }

    fn record(&self, ctx: &RequestContext, outcome: &UpstreamOutcome) {
        let content_length = match outcome {
            UpstreamOutcome::Forwarded(res) => response_length(res),
            UpstreamOutcome::Unreachable(err) => error_message(err).len() as i64,
        };

        self.access_log.record(&AccessLogEntry {
            remote_addr: ctx.remote_addr,
            host: ctx.host.clone(),
            user: ctx.user.clone(),
            timestamp: Local::now(),
            method: ctx.method.clone(),
            uri: ctx.request_uri.clone(),
            version: ctx.version,
            status: outcome.status().as_u16(),
            content_length,
        });
    }
}

fn response_length<B: Body>(res: &Response<B>) -> i64 {
    res.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .or_else(|| res.body().size_hint().exact().map(|n| n as i64))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use hyper::header::HOST;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingLog {
        lines: Mutex<Vec<String>>,
    }

    impl AccessLogSink for RecordingLog {
        fn record(&self, entry: &AccessLogEntry) {
            self.lines.lock().push(entry.to_string());
        }
    }

    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }

    fn context(host: &str, uri: &str) -> RequestContext {
        let req = Request::builder().uri(uri).header(HOST, host).body(()).unwrap();
        RequestContext::from_request(&req, "127.0.0.1:40000".parse().unwrap(), host)
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_unreachable_backend_yields_502() {
        let log = Arc::new(RecordingLog::default());
        let transport = UpstreamTransport::new(log.clone());
        let port = free_port();

        let req = Request::builder()
            .uri(format!("http://localhost:{}/", port))
            .header(HOST, "app1.local.dev")
            .body(empty_body())
            .unwrap();

        let outcome = transport.round_trip(req, &context("app1.local.dev", "/")).await;
        assert!(matches!(outcome, UpstreamOutcome::Unreachable(_)));

        let res = outcome.into_response();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert!(!body.is_empty());
        assert!(String::from_utf8_lossy(&body).starts_with("tlsmux proxy error:"));

        let lines = log.lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" 502 "));
    }

    #[tokio::test]
    async fn test_forwarded_response_is_logged() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .and(header("host", "app1.local.dev"))
            .respond_with(ResponseTemplate::new(201).set_body_string("hi there"))
            .mount(&backend)
            .await;

        let log = Arc::new(RecordingLog::default());
        let transport = UpstreamTransport::new(log.clone());

        // alice:secret
        let req = Request::builder()
            .uri(format!("{}/hello", backend.uri()))
            .header(HOST, "app1.local.dev")
            .header("authorization", "Basic YWxpY2U6c2VjcmV0")
            .body(empty_body())
            .unwrap();
        let ctx = RequestContext::from_request(&req, "127.0.0.1:40000".parse().unwrap(), "app1.local.dev");

        let outcome = transport.round_trip(req, &ctx).await;
        assert_eq!(outcome.status(), StatusCode::CREATED);

        let body = outcome.into_response().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hi there");

        let lines = log.lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("127.0.0.1:40000 app1.local.dev alice ["));
        assert!(lines[0].ends_with("\"GET /hello HTTP/1.1\" 201 8"));
    }

    #[tokio::test]
    async fn test_stalled_body_is_cut_off() {
        // Head and half the body arrive promptly, then the backend goes quiet
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let log = Arc::new(RecordingLog::default());
        let transport = UpstreamTransport::new(log.clone()).with_timeout(Duration::from_millis(300));

        let req = Request::builder()
            .uri(format!("http://localhost:{}/slow", port))
            .header(HOST, "slow.local.dev")
            .body(empty_body())
            .unwrap();

        let outcome = transport.round_trip(req, &context("slow.local.dev", "/slow")).await;
        assert_eq!(outcome.status(), StatusCode::OK);

        let collected = tokio::time::timeout(
            Duration::from_secs(5),
            outcome.into_response().into_body().collect(),
        )
        .await
        .expect("body deadline never fired");

        let err = collected.err().unwrap();
        assert!(err.to_string().contains("did not finish its response"));
        assert_eq!(log.lines.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_logs_once() {
        let log = Arc::new(RecordingLog::default());
        let transport = UpstreamTransport::new(log.clone());

        let outcome = transport.reject(
            UpstreamError::Unrouted {
                host: "nowhere.local.dev".to_string(),
            },
            &context("nowhere.local.dev", "/x"),
        );

        assert_eq!(outcome.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(log.lines.lock().len(), 1);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, x-custom-hop".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("x-forwarded-for", "127.0.0.1:1234".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("x-forwarded-for").is_some());
    }
}
