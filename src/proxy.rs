//! Reverse proxy in front of the hosted applications
//!
//! One listener per protocol (plaintext and TLS) sharing a request path:
//! resolve the Host header against the live route table, then relay to the
//! app's loopback port. Unknown hostnames are answered late and with a
//! made-up status so domain scanners learn nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{bad_gateway, no_response, service_unavailable, AgentBody, AgentError, AgentResult};
use crate::routes::{RouteTarget, RoutingTables};

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Upper bound on a backend's upgrade response head.
const MAX_UPGRADE_RESPONSE: usize = 16 * 1024;

/// Pooled loopback client shared by every proxied request.
#[derive(Clone)]
pub struct ForwardClient {
    client: Client<HttpConnector, Incoming>,
}

impl ForwardClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(60))
            .build(connector);

        Self { client }
    }

    /// Re-target the request at the app's loopback port and relay it,
    /// streaming the body both ways.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> AgentResult<Response<AgentBody>> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{port}{path}");

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let forwarded = builder
            .body(body)
            .map_err(|e| AgentError::Internal(format!("could not rebuild request: {e}")))?;

        let response = self
            .client
            .request(forwarded)
            .await
            .map_err(|e| AgentError::Internal(format!("upstream request failed: {e}")))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for ForwardClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a single proxied request needs, shared by both listeners.
pub struct ProxyState {
    pub tables: RoutingTables,
    pub client: ForwardClient,
    pub no_response_delay: Duration,
}

/// One proxy listener. TLS is a wrapper around the same request path; the
/// acceptor's cert resolver reads the live cert table per handshake.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<ProxyState>,
        tls: Option<TlsAcceptor>,
        shutdown: watch::Receiver<bool>,
    ) -> AgentResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            tls,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> AgentResult<()> {
        let protocol = if self.tls.is_some() { "https" } else { "http" };
        info!(addr = %self.listener.local_addr()?, protocol, "proxy listening");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls = self.tls.clone();
                            tokio::spawn(async move {
                                if let Some(acceptor) = tls {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(err) = serve_stream(tls_stream, addr, state, true).await {
                                                debug!(%addr, %err, "tls connection error");
                                            }
                                        }
                                        Err(err) => {
                                            debug!(%addr, %err, "tls handshake failed");
                                        }
                                    }
                                } else if let Err(err) = serve_stream(stream, addr, state, false).await {
                                    debug!(%addr, %err, "connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(protocol, "proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_stream<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
) -> AgentResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    // auto::Builder serves HTTP/1.1 and h2 on the same port; HTTP/1.1
    // connections keep their upgrade path.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| AgentError::Internal(format!("connection error: {e}")))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<AgentBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // A missing or mangled Host header takes the same path as an unknown
    // hostname; the client learns nothing either way.
    let hostname = match extract_hostname(&req) {
        Some(hostname) => hostname,
        None => {
            debug!(%client_addr, "request without a usable host header");
            tokio::time::sleep(state.no_response_delay).await;
            return Ok(no_response());
        }
    };

    let target = state.tables.load().route(&hostname);
    let target = match target {
        Some(target) => target,
        None => {
            debug!(hostname, "no route for hostname");
            tokio::time::sleep(state.no_response_delay).await;
            return Ok(no_response());
        }
    };

    // These overwrite whatever the client sent; this proxy is the first
    // trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "incoming request");

    let port = match target {
        RouteTarget::Forward(port) => port,
        RouteTarget::Unavailable => {
            return Ok(service_unavailable());
        }
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, hostname, port, request_id).await;
    }

    match state.client.forward(req, port).await {
        Ok(response) => Ok(response),
        Err(err) => {
            error!(hostname, port, %err, "failed to forward request");
            Ok(bad_gateway())
        }
    }
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            // Validate length (DNS max is 253 characters)
            if hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only
            // This prevents log injection and other attacks
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            if hostname.is_empty() {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Check if a request asks to switch protocols
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP/1.1 request relayed to the app for an upgrade. The
/// Host header is rewritten to the loopback target.
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the `\r\n\r\n` header terminator, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the status line and headers of the app's upgrade response.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Relay an upgrade handshake to the app over a raw TCP connection, then
/// splice the two streams at the byte level.
async fn handle_upgrade(
    req: Request<Incoming>,
    hostname: String,
    port: u16,
    request_id: String,
) -> Result<Response<AgentBody>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, "handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);

    let mut backend = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(hostname, port, %err, "failed to connect for upgrade");
            return Ok(bad_gateway());
        }
    };

    if let Err(err) = backend.write_all(&raw_request).await {
        error!(hostname, %err, "failed to send upgrade request");
        return Ok(bad_gateway());
    }

    // Read the whole response head. Bytes past the blank line belong to the
    // upgraded protocol and must reach the client after the splice starts.
    let mut buf = Vec::with_capacity(4096);
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_UPGRADE_RESPONSE {
            error!(hostname, "upgrade response head too large");
            return Ok(bad_gateway());
        }
        let mut chunk = [0u8; 4096];
        match backend.read(&mut chunk).await {
            Ok(0) => {
                error!(hostname, "app closed connection during upgrade handshake");
                return Ok(bad_gateway());
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) => {
                error!(hostname, %err, "failed to read upgrade response");
                return Ok(bad_gateway());
            }
        }
    };
    let remainder = buf.split_off(header_end);

    let (status, response_headers) = match parse_upgrade_response(&buf) {
        Some(parsed) => parsed,
        None => {
            error!(hostname, "unparseable upgrade response from app");
            return Ok(bad_gateway());
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, %status, "app rejected upgrade request");
        // Relay the refusal as-is.
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(hostname, request_id, upgrade_type, "upgrade accepted");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // hyper regenerates framing headers
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                splice(upgraded, backend, remainder, &hostname, &request_id).await;
            }
            Err(err) => {
                error!(hostname, %err, "client upgrade failed");
            }
        }
    });

    Ok(response)
}

/// Byte-level forwarding between the upgraded client and the app socket.
async fn splice(
    client: Upgraded,
    backend: TcpStream,
    pending_to_client: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    if !pending_to_client.is_empty() {
        if let Err(err) = client_io.write_all(&pending_to_client).await {
            debug!(hostname, request_id, %err, "failed to flush buffered upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_backend,
                backend_to_client,
                "upgraded connection closed"
            );
        }
        Err(err) => {
            debug!(hostname, request_id, %err, "upgraded connection closed with error");
        }
    }
}
