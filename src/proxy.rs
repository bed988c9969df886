//! HTTP reverse proxy layer for forwarding requests through SSH sessions.
//! Upstream connections are dialed over SSH and pooled by hyper's client.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tower_service::Service;

use crate::cache::ResponseCache;
use crate::error::TunnelError;
use crate::ssh::Dialer;
use crate::tunnel::Tunneler;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy sends back.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Idle upstream connections kept in the pool.
const MAX_IDLE_CONNS: usize = 100;
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
/// Upper bound on SSH handshake plus channel open for one upstream connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only make sense for a single hop.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}

/// A dialed connection, adapted to hyper's IO traits.
pub struct TunnelStream<C> {
    io: TokioIo<C>,
}

impl<C> hyper::rt::Read for TunnelStream<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<C> hyper::rt::Write for TunnelStream<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl<C> Connection for TunnelStream<C> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector handing hyper's client connections dialed through `D`.
pub struct SshConnector<D> {
    dialer: Arc<D>,
}

impl<D> Clone for SshConnector<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
        }
    }
}

impl<D: Dialer> Service<Uri> for SshConnector<D> {
    type Response = TunnelStream<D::Conn>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let address = format!(
                "{}:{}",
                uri.host().unwrap_or("localhost"),
                uri.port_u16().unwrap_or(80)
            );

            let conn = tokio::time::timeout(DIAL_TIMEOUT, dialer.dial("tcp", &address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dialing {} timed out", address),
                    )
                })?
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

            debug!("Upstream connection to {} established", address);
            Ok(TunnelStream {
                io: TokioIo::new(conn),
            })
        })
    }
}

/// Forwards requests to the single upstream, optionally through the cache.
struct ReverseProxy<D: Dialer> {
    client: Client<SshConnector<D>, Incoming>,
    remote_port: u16,
    cache: Option<Arc<ResponseCache>>,
}

impl<D: Dialer> ReverseProxy<D> {
    async fn handle(&self, req: Request<Incoming>, peer_addr: SocketAddr) -> Response<ProxyBody> {
        match &self.cache {
            Some(cache) => cache.handle(req, |req| self.forward(req, peer_addr)).await,
            None => self.forward(req, peer_addr).await,
        }
    }

    async fn forward(&self, mut req: Request<Incoming>, peer_addr: SocketAddr) -> Response<ProxyBody> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = match format!("http://localhost:{}{}", self.remote_port, path).parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                debug!("Rejecting request for {}: {}", path, e);
                return error_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        strip_hop_headers(headers);
        append_forwarded_for(headers, peer_addr);

        match self.client.request(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_headers(&mut parts.headers);
                Response::from_parts(parts, body.map_err(Into::into).boxed_unsync())
            }
            Err(e) => {
                error!("Upstream request failed: {:?}", e);
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer_addr: SocketAddr) {
    let client_ip = peer_addr.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// HTTP relay: a reverse proxy to `http://localhost:<remote_port>` on the
/// far side of the SSH connection.
pub struct HttpRelay<D: Dialer> {
    local_port: u16,
    proxy: Arc<ReverseProxy<D>>,
}

impl<D: Dialer> HttpRelay<D> {
    pub fn new(dialer: Arc<D>, local_port: u16, remote_port: u16) -> Self {
        Self::build(dialer, local_port, remote_port, None)
    }

    /// Same as `new`, answering GET requests from `cache` where possible.
    pub fn with_cache(
        dialer: Arc<D>,
        local_port: u16,
        remote_port: u16,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self::build(dialer, local_port, remote_port, Some(cache))
    }

    fn build(
        dialer: Arc<D>,
        local_port: u16,
        remote_port: u16,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_timer(TokioTimer::new())
            .build(SshConnector { dialer });

        Self {
            local_port,
            proxy: Arc::new(ReverseProxy {
                client,
                remote_port,
                cache,
            }),
        }
    }

    /// Serve connections from `listener` until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TunnelError> {
        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(|e| {
                error!("Couldn't accept connection: {}", e);
                TunnelError::Accept(e)
            })?;
            let proxy = self.proxy.clone();

            tokio::spawn(async move {
                debug!("HTTP connection from {}", peer_addr);
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(proxy.handle(req, peer_addr).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Error serving connection from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

#[async_trait]
impl<D: Dialer> Tunneler for HttpRelay<D> {
    async fn tunnel(&self) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(("0.0.0.0", self.local_port))
            .await
            .map_err(|e| {
                error!("Could not start listener: {}", e);
                TunnelError::Listen {
                    port: self.local_port,
                    source: e,
                }
            })?;
        info!(
            "HTTP proxy listening on port {} -> http://localhost:{}",
            self.local_port, self.proxy.remote_port
        );

        self.serve(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::cache::{CACHE_HEADER, DEFAULT_TTL};

    struct LoopbackDialer {
        target: SocketAddr,
        dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dialer for LoopbackDialer {
        type Conn = TcpStream;

        async fn dial(&self, _network: &str, address: &str) -> Result<TcpStream, TunnelError> {
            self.dialed.lock().unwrap().push(address.to_string());
            Ok(TcpStream::connect(self.target).await?)
        }
    }

    struct FailingDialer;

    #[async_trait]
    impl Dialer for FailingDialer {
        type Conn = TcpStream;

        async fn dial(&self, _network: &str, address: &str) -> Result<TcpStream, TunnelError> {
            Err(TunnelError::InvalidAddress(address.to_string()))
        }
    }

    /// What the upstream service saw.
    #[derive(Default)]
    struct Upstream {
        hits: AtomicUsize,
        requests: Mutex<Vec<(String, HeaderMap)>>,
    }

    async fn start_upstream(seen: Arc<Upstream>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        seen.hits.fetch_add(1, Ordering::SeqCst);
                        seen.requests
                            .lock()
                            .unwrap()
                            .push((req.uri().to_string(), req.headers().clone()));
                        async move {
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from_static(b"hello from upstream")))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    async fn start_relay<D: Dialer>(relay: HttpRelay<D>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { relay.serve(listener).await });
        addr
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: relay.local\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(response).unwrap()
    }

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "text/html");
    }

    #[test]
    fn test_append_forwarded_for() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3");

        append_forwarded_for(&mut headers, "10.9.9.9:1".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3, 10.9.9.9");
    }

    #[tokio::test]
    async fn test_proxies_through_dialer() {
        let seen = Arc::new(Upstream::default());
        let upstream_addr = start_upstream(seen.clone()).await;
        let dialer = Arc::new(LoopbackDialer {
            target: upstream_addr,
            dialed: Mutex::new(Vec::new()),
        });
        let relay_addr = start_relay(HttpRelay::new(dialer.clone(), 0, 8080)).await;

        let response = get(relay_addr, "/greet?name=ops").await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with("hello from upstream"));
        assert!(!response.contains(CACHE_HEADER));
        assert_eq!(*dialer.dialed.lock().unwrap(), vec!["localhost:8080".to_string()]);

        let requests = seen.requests.lock().unwrap();
        let (uri, headers) = &requests[0];
        assert_eq!(uri, "/greet?name=ops");
        assert_eq!(headers["host"], "relay.local");
        assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    }

    #[tokio::test]
    async fn test_cache_answers_repeat_gets() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            ResponseCache::load(dir.path().join("httpcache.json"), DEFAULT_TTL, false).unwrap(),
        );
        let seen = Arc::new(Upstream::default());
        let upstream_addr = start_upstream(seen.clone()).await;
        let dialer = Arc::new(LoopbackDialer {
            target: upstream_addr,
            dialed: Mutex::new(Vec::new()),
        });
        let relay_addr =
            start_relay(HttpRelay::with_cache(dialer, 0, 8080, cache.clone())).await;

        let first = get(relay_addr, "/report").await;
        assert!(first.contains("x-sshrelay-cache: miss"), "{}", first);

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get("/report").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let second = get(relay_addr, "/report").await;
        assert!(second.starts_with("HTTP/1.1 200 OK"), "{}", second);
        assert!(second.contains("x-sshrelay-cache: hit"), "{}", second);
        assert!(second.ends_with("hello from upstream"));
        assert_eq!(seen.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_is_bad_gateway() {
        let relay_addr = start_relay(HttpRelay::new(Arc::new(FailingDialer), 0, 8080)).await;

        let response = get(relay_addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{}", response);
    }

    #[tokio::test]
    async fn test_tunnel_fails_when_port_is_taken() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let relay = HttpRelay::new(Arc::new(FailingDialer), port, 8080);
        let result = relay.tunnel().await;
        assert!(matches!(result, Err(TunnelError::Listen { .. })));
    }
}
