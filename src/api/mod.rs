//! Viewer HTTP server.
//!
//! - `GET /health`
//! - `GET /cameras`: ids with a frame or a stats snapshot
//! - `GET /cameras/<id>/stream`: `multipart/x-mixed-replace` JPEG push
//! - `GET /cameras/<id>/stats`: latest `StatsSnapshot`
//!
//! Each stream connection gets its own thread that reads only its own
//! subscription, so a slow client can only fall behind by dropping frames.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::fanout::{FanOut, Subscription};
use crate::stats::StatsBoard;

const MAX_REQUEST_BYTES: usize = 8192;
const BOUNDARY: &str = "watchpost-frame";
const STREAM_POLL: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_VIEWER_ADDR: &str = "127.0.0.1:8780";
pub const DEFAULT_MAX_VIEWERS: usize = 64;

#[derive(Clone, Debug)]
pub struct ViewerConfig {
    pub addr: String,
    pub max_viewers: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_VIEWER_ADDR.to_string(),
            max_viewers: DEFAULT_MAX_VIEWERS,
        }
    }
}

#[derive(Debug)]
pub struct ViewerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ViewerHandle {
    pub fn active_viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Open streams end at their next poll.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("viewer server thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Shared {
    fanout: Arc<FanOut>,
    board: Arc<StatsBoard>,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    max_viewers: usize,
}

pub struct ViewerServer {
    cfg: ViewerConfig,
    fanout: Arc<FanOut>,
    board: Arc<StatsBoard>,
}

impl ViewerServer {
    pub fn new(cfg: ViewerConfig, fanout: Arc<FanOut>, board: Arc<StatsBoard>) -> Self {
        Self { cfg, fanout, board }
    }

    pub fn spawn(self) -> Result<ViewerHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let viewers = Arc::new(AtomicUsize::new(0));
        let shared = Shared {
            fanout: self.fanout,
            board: self.board,
            shutdown: shutdown.clone(),
            viewers: viewers.clone(),
            max_viewers: self.cfg.max_viewers,
        };
        let join = std::thread::Builder::new()
            .name("viewer-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, shared) {
                    log::error!("viewer server stopped: {}", err);
                }
            })?;

        Ok(ViewerHandle {
            addr,
            shutdown,
            viewers,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, shared: Shared) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("viewer-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared) {
                            log::debug!("viewer {}: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("viewer {}: could not start connection thread: {}", peer, err);
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

#[derive(Serialize)]
struct CameraList {
    cameras: Vec<String>,
}

enum Route<'a> {
    Health,
    Cameras,
    Stream(&'a str),
    Stats(&'a str),
    NotFound,
}

fn route(path: &str) -> Route<'_> {
    match path {
        "/health" => return Route::Health,
        "/cameras" => return Route::Cameras,
        _ => {}
    }
    let Some(rest) = path.strip_prefix("/cameras/") else {
        return Route::NotFound;
    };
    match rest.split_once('/') {
        Some((id, "stream")) if crate::validate_camera_id(id).is_ok() => Route::Stream(id),
        Some((id, "stats")) if crate::validate_camera_id(id).is_ok() => Route::Stats(id),
        _ => Route::NotFound,
    }
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match route(&request.path) {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Cameras => {
            let mut ids: BTreeSet<String> = shared.fanout.cameras().into_iter().collect();
            ids.extend(shared.board.cameras());
            let body = serde_json::to_vec(&CameraList {
                cameras: ids.into_iter().collect(),
            })?;
            write_response(&mut stream, 200, "application/json", &body)
        }
        Route::Stats(id) => match shared.board.get(id) {
            Some(snapshot) => {
                let body = serde_json::to_vec(&snapshot)?;
                write_response(&mut stream, 200, "application/json", &body)
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"no_stats"}"#),
        },
        Route::Stream(id) => {
            let active = shared.viewers.fetch_add(1, Ordering::SeqCst);
            let result = if active >= shared.max_viewers {
                write_json_response(&mut stream, 503, r#"{"error":"too_many_viewers"}"#)
            } else {
                let subscription = shared.fanout.subscribe(id);
                stream_frames(&mut stream, subscription, &shared.shutdown)
            };
            shared.viewers.fetch_sub(1, Ordering::SeqCst);
            result
        }
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn stream_frames(
    stream: &mut TcpStream,
    mut subscription: Subscription,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    log::info!("viewer joined camera {}", subscription.camera_id());

    let mut sent = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = subscription.recv_timeout(STREAM_POLL) else {
            if subscription.is_closed() {
                break;
            }
            continue;
        };
        let part = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\nX-Overlay: {}\r\n\r\n",
            BOUNDARY,
            frame.payload.len(),
            frame.sequence,
            if frame.has_overlay { 1 } else { 0 }
        );
        if let Err(err) = stream
            .write_all(part.as_bytes())
            .and_then(|_| stream.write_all(&frame.payload))
            .and_then(|_| stream.write_all(b"\r\n"))
            .and_then(|_| stream.flush())
        {
            log::info!(
                "viewer left camera {} after {} frames ({} dropped): {}",
                subscription.camera_id(),
                sent,
                subscription.dropped(),
                err
            );
            return Ok(());
        }
        sent += 1;
    }
    let _ = stream.write_all(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
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
}
