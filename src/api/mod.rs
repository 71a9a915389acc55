//! Minimal HTTP/1.1 control and streaming surface over `std::net`.
//!
//! Plain requests are served on the accept thread. `GET /video/{id}` (MJPEG)
//! and `GET /stream/{id}` (server-sent events) hold the connection open and
//! get a thread each.

use crate::camera::CameraOrchestrator;
use crate::config::CameraSettings;
use crate::error::{classify, VisionError};
use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 256 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Frame rate of the MJPEG endpoint.
    pub video_fps: u32,
    pub jpeg_quality: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            video_fps: 24,
            jpeg_quality: 80,
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
    orchestrator: Arc<CameraOrchestrator>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, orchestrator: Arc<CameraOrchestrator>) -> Self {
        Self { cfg, orchestrator }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = ApiContext {
            cfg: self.cfg,
            orchestrator: self.orchestrator,
            shutdown: shutdown.clone(),
        };
        let join = std::thread::Builder::new()
            .name("traffic-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("traffic api stopped: {}", err);
                }
            })?;
        log::info!("traffic api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Clone)]
struct ApiContext {
    cfg: ApiConfig,
    orchestrator: Arc<CameraOrchestrator>,
    shutdown: Arc<AtomicBool>,
}

fn run_api(listener: TcpListener, ctx: ApiContext, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &ctx) {
                    log::warn!("traffic api request failed: {}", err);
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

#[derive(Deserialize)]
struct ZoneUpdate {
    polygon: Vec<[f32; 2]>,
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let orchestrator = &ctx.orchestrator;

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", ["cameras", "status"]) => write_json(&mut stream, 200, &orchestrator.get_status()),
        ("GET", ["metrics"]) => write_json(&mut stream, 200, &orchestrator.metrics()),
        ("GET", ["cameras"]) => write_json(
            &mut stream,
            200,
            &json!({
                "cameras": orchestrator.camera_ids(),
                "latest_states": orchestrator.broadcaster().latest_states(),
            }),
        ),
        ("GET", ["snapshot", camera_id]) => match orchestrator.broadcaster().latest(camera_id) {
            Some(message) => write_json(&mut stream, 200, &message),
            None => write_json_response(&mut stream, 404, r#"{"error":"no_snapshot"}"#),
        },
        ("POST", ["cameras", camera_id]) => {
            let settings: CameraSettings = match serde_json::from_slice(&request.body) {
                Ok(settings) => settings,
                Err(err) => return write_error(&mut stream, 400, &format!("invalid body: {}", err)),
            };
            respond(
                &mut stream,
                orchestrator.add_camera(camera_id, settings),
                "added",
            )
        }
        ("POST", ["cameras", camera_id, "start"]) => {
            respond(&mut stream, orchestrator.start_camera(camera_id), "started")
        }
        ("POST", ["cameras", camera_id, "stop"]) => {
            respond(&mut stream, orchestrator.stop_camera(camera_id), "stopped")
        }
        ("POST", ["cameras", camera_id, "zones", zone_id]) => {
            let update: ZoneUpdate = match serde_json::from_slice(&request.body) {
                Ok(update) => update,
                Err(err) => return write_error(&mut stream, 400, &format!("invalid body: {}", err)),
            };
            respond(
                &mut stream,
                orchestrator.update_zone(camera_id, zone_id, update.polygon),
                "updated",
            )
        }
        ("GET", ["video", camera_id]) => {
            if let Err(err) = orchestrator.is_running(camera_id) {
                return respond(&mut stream, Err(err), "");
            }
            let processed = request.query("type") != Some("raw");
            let camera_id = camera_id.to_string();
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name(format!("video:{}", camera_id))
                .spawn(move || {
                    if let Err(err) = stream_video(stream, &ctx, &camera_id, processed) {
                        log::debug!("video stream for {} ended: {}", camera_id, err);
                    }
                })?;
            Ok(())
        }
        ("GET", ["stream", camera_id]) => {
            if let Err(err) = orchestrator.is_running(camera_id) {
                return respond(&mut stream, Err(err), "");
            }
            let camera_id = camera_id.to_string();
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name(format!("sse:{}", camera_id))
                .spawn(move || {
                    if let Err(err) = stream_events(stream, &ctx, &camera_id) {
                        log::debug!("event stream for {} ended: {}", camera_id, err);
                    }
                })?;
            Ok(())
        }
        (_, ["health"]) | (_, ["metrics"]) | (_, ["cameras", ..]) | (_, ["snapshot", _])
        | (_, ["video", _]) | (_, ["stream", _]) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn status_for(err: &anyhow::Error) -> u16 {
    match classify(err) {
        Some(VisionError::Configuration(_)) => 400,
        Some(VisionError::UnknownCamera(_)) => 404,
        Some(VisionError::DuplicateCamera(_)) => 409,
        _ => 500,
    }
}

fn respond(stream: &mut TcpStream, result: Result<()>, status: &str) -> Result<()> {
    match result {
        Ok(()) => write_json(stream, 200, &json!({ "status": status })),
        Err(err) => {
            let code = status_for(&err);
            if code == 500 {
                log::error!("traffic api: {:#}", err);
            }
            write_error(stream, code, &format!("{:#}", err))
        }
    }
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &json!({ "error": message }))
}

fn write_json<T: serde::Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn stream_video(mut stream: TcpStream, ctx: &ApiContext, camera_id: &str, processed: bool) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
    )?;
    let interval = Duration::from_secs_f64(1.0 / f64::from(ctx.cfg.video_fps.max(1)));
    let mut last: Option<Arc<RgbImage>> = None;
    let mut jpeg = Vec::new();
    while !ctx.shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        let frame = ctx.orchestrator.latest_frame(camera_id, processed)?;
        if let Some(frame) = frame {
            if !last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame)) {
                jpeg.clear();
                JpegEncoder::new_with_quality(&mut jpeg, ctx.cfg.jpeg_quality).encode_image(&*frame)?;
                last = Some(frame);
            }
            let header = format!(
                "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            stream.write_all(header.as_bytes())?;
            stream.write_all(&jpeg)?;
            stream.write_all(b"\r\n")?;
        }
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    Ok(())
}

fn stream_events(mut stream: TcpStream, ctx: &ApiContext, camera_id: &str) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n",
    )?;
    let broadcaster = ctx.orchestrator.broadcaster();
    let subscription = broadcaster.subscribe(camera_id);
    let mut quiet_since = Instant::now();
    let result = (|| -> Result<()> {
        while !ctx.shutdown.load(Ordering::SeqCst) {
            match subscription.recv_timeout(Duration::from_millis(500))? {
                Some(message) => {
                    let data = serde_json::to_string(&message)?;
                    stream.write_all(format!("event: analysis\ndata: {}\n\n", data).as_bytes())?;
                    stream.flush()?;
                    quiet_since = Instant::now();
                }
                None if quiet_since.elapsed() >= SSE_KEEPALIVE => {
                    stream.write_all(b": keep-alive\n\n")?;
                    quiet_since = Instant::now();
                }
                None => {}
            }
        }
        Ok(())
    })();
    broadcaster.unsubscribe(&subscription);
    result
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
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

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (raw_path.to_string(), String::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        body,
    })
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
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
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
    query: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_lookup() {
        let request = HttpRequest {
            method: "GET".to_string(),
            path: "/video/cam1".to_string(),
            query: "type=raw&x=1".to_string(),
            body: Vec::new(),
        };
        assert_eq!(request.query("type"), Some("raw"));
        assert_eq!(request.query("missing"), None);
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(status_for(&VisionError::config("bad").into()), 400);
        assert_eq!(status_for(&VisionError::UnknownCamera("x".into()).into()), 404);
        assert_eq!(status_for(&VisionError::DuplicateCamera("x".into()).into()), 409);
        assert_eq!(status_for(&anyhow!("boom")), 500);
    }
}
