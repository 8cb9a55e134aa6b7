use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::location::{is_local_addr, GpsSubmission};
use crate::stream::{StartOutcome, StreamController};
use crate::MonitorContext;

const MAX_REQUEST_BYTES: usize = 8192;

/// Client address headers, most specific first.
const CLIENT_IP_HEADERS: [&str; 6] = [
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded",
    "x-cluster-client-ip",
    "forwarded-for",
    "forwarded",
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: MonitorContext,
    streams: Arc<StreamController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: MonitorContext, streams: Arc<StreamController>) -> Self {
        Self { cfg, ctx, streams }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("overflow-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, self.ctx, self.streams, shutdown_thread) {
                    log::error!("overflow api stopped: {}", err);
                }
            })?;
        log::info!("overflow api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// Accept loop; each connection is served on its own thread.
fn run_api(
    listener: TcpListener,
    ctx: MonitorContext,
    streams: Arc<StreamController>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) || ctx.is_shutdown() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let streams = Arc::clone(&streams);
                let spawned = std::thread::Builder::new()
                    .name("overflow-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx, &streams) {
                            log::warn!("overflow api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    ctx: &MonitorContext,
    streams: &StreamController,
) -> Result<()> {
    // Accepted sockets can inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(ReadOutcome::Request(request)) => request,
        Ok(ReadOutcome::TooLarge) => {
            write_json_response(&mut stream, 413, r#"{"error":"request_too_large"}"#)?;
            return Ok(());
        }
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    let client = client_ip(&request.headers, Some(peer.ip()));
    log::debug!("{} {} from {}", request.method, request.path, peer);

    let (status, body) = route(&request, client, ctx, streams);
    write_response(&mut stream, status, "application/json", body.as_bytes())
}

/// Dispatch one request to `(status, json body)`.
fn route(
    request: &HttpRequest,
    client: Option<IpAddr>,
    ctx: &MonitorContext,
    streams: &StreamController,
) -> (u16, String) {
    let allowed = match request.path.as_str() {
        "/health" | "/report" | "/detections" | "/location" | "/gps/status" => "GET",
        "/gps" | "/stream/start" | "/stream/stop" => "POST",
        _ => return (404, r#"{"error":"not_found"}"#.to_string()),
    };
    if request.method != allowed {
        return (405, r#"{"error":"method_not_allowed"}"#.to_string());
    }

    match request.path.as_str() {
        "/health" => json_ok(&json!({
            "status": "ok",
            "streaming": ctx.stream_state.is_streaming(),
        })),
        "/report" => to_json(200, &ctx.report_now()),
        "/detections" => {
            let detections = ctx.event_log.snapshot();
            json_ok(&json!({
                "count": detections.len(),
                "capacity": ctx.event_log.capacity(),
                "detections": detections,
            }))
        }
        "/location" => match ctx.resolver.resolve_current(client) {
            Some(location) => to_json(200, &location),
            None => (404, r#"{"error":"location_not_found"}"#.to_string()),
        },
        "/gps/status" => {
            let fix = ctx.gps().current();
            json_ok(&json!({
                "has_gps": fix.is_some(),
                "location": fix,
            }))
        }
        "/gps" => submit_gps(request, ctx),
        "/stream/start" => start_stream(request, client, streams),
        "/stream/stop" => {
            if streams.request_stop() {
                (202, r#"{"status":"stopping"}"#.to_string())
            } else {
                (200, r#"{"status":"idle"}"#.to_string())
            }
        }
        _ => (404, r#"{"error":"not_found"}"#.to_string()),
    }
}

fn submit_gps(request: &HttpRequest, ctx: &MonitorContext) -> (u16, String) {
    let submission: GpsSubmission = match serde_json::from_slice(&request.body) {
        Ok(submission) => submission,
        Err(err) => {
            return (
                400,
                json!({"error": "invalid_json", "message": err.to_string()}).to_string(),
            )
        }
    };
    match ctx.resolver.submit_gps(submission) {
        Ok(_) => (
            200,
            r#"{"status":"success","message":"GPS location saved"}"#.to_string(),
        ),
        Err(err) => (
            400,
            json!({"error": "invalid_gps", "message": err.to_string()}).to_string(),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    source: Option<String>,
}

fn start_stream(
    request: &HttpRequest,
    client: Option<IpAddr>,
    streams: &StreamController,
) -> (u16, String) {
    let start: StartRequest = if request.body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice(&request.body) {
            Ok(start) => start,
            Err(err) => {
                return (
                    400,
                    json!({"error": "invalid_json", "message": err.to_string()}).to_string(),
                )
            }
        }
    };
    match streams.start(start.source, client) {
        Ok(StartOutcome::Started { source }) => {
            json_ok(&json!({"status": "started", "source": source}))
        }
        Ok(StartOutcome::AlreadyActive) => {
            (409, r#"{"error":"stream_already_active"}"#.to_string())
        }
        Err(err) => {
            log::error!("stream start failed: {:#}", err);
            (500, r#"{"error":"stream_start_failed"}"#.to_string())
        }
    }
}

fn json_ok(value: &serde_json::Value) -> (u16, String) {
    (200, value.to_string())
}

fn to_json<T: serde::Serialize>(status: u16, value: &T) -> (u16, String) {
    match serde_json::to_string(value) {
        Ok(body) => (status, body),
        Err(err) => {
            log::error!("response serialization failed: {}", err);
            (500, r#"{"error":"internal"}"#.to_string())
        }
    }
}

/// Best client address for IP geolocation.
///
/// Proxy headers are checked first; loopback and unspecified addresses are
/// skipped so a local client falls through to the public-IP lookup.
pub fn client_ip(headers: &HashMap<String, String>, peer: Option<IpAddr>) -> Option<IpAddr> {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| {
            let first = value.split(',').next()?.trim();
            parse_header_ip(first)
        })
        .chain(peer)
        .find(|ip| !is_local_addr(ip))
}

fn parse_header_ip(value: &str) -> Option<IpAddr> {
    // RFC 7239 form: for=192.0.2.60;proto=http
    let value = value
        .split(';')
        .find_map(|part| {
            let (key, v) = part.trim().split_once('=')?;
            key.trim().eq_ignore_ascii_case("for").then_some(v)
        })
        .unwrap_or(value)
        .trim()
        .trim_matches('"');
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    value
        .strip_prefix('[')
        .and_then(|rest| rest.split(']').next())
        .and_then(|inner| inner.parse().ok())
}

enum ReadOutcome {
    Request(HttpRequest),
    TooLarge,
}

fn read_request(stream: &mut TcpStream) -> Result<ReadOutcome> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break find_header_end(&data);
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = find_header_end(&data) {
            break Some(end);
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Ok(ReadOutcome::TooLarge);
        }
    };
    let header_end = header_end.ok_or_else(|| anyhow!("incomplete request headers"))?;

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end
        .checked_add(content_length)
        .map_or(true, |total| total > MAX_REQUEST_BYTES)
    {
        return Ok(ReadOutcome::TooLarge);
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(ReadOutcome::Request(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    }))
}

/// Offset just past the blank line ending the headers.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}
