//! Local JSON API.
//!
//! Serves the front-end: source CRUD, file registration, the inference
//! cursor, and the fire-and-forget run trigger. Creating or updating a video
//! source, or posting its infer task, each schedule a fresh pipeline run;
//! the response never waits on one.
//!
//! The server is a plain `TcpListener` loop on a background thread, bound to
//! loopback by default. Requests are handled sequentially; this API fronts a
//! single local front-end, not the public internet.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::objectstore::{ObjectStore, PUT_URL_EXPIRY_SECS};
use crate::pipeline::Pipeline;
use crate::sources::{
    CameraSource, NewCameraSource, NewVideoSource, SourceRegistry, SourceUpdate, StoredFile,
    VideoSource,
};
use crate::store::{Inference, InferenceStore, SqliteInferenceStore};
use crate::SourceKind;

const MAX_REQUEST_BYTES: usize = 65536;
const DEFAULT_QUERY_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8711".to_string(),
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
    db_path: String,
    bucket: String,
    object_store: Arc<dyn ObjectStore>,
    pipeline: Pipeline,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        db_path: &str,
        bucket: &str,
        object_store: Arc<dyn ObjectStore>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            cfg,
            db_path: db_path.to_string(),
            bucket: bucket.to_string(),
            object_store,
            pipeline,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, self, shutdown_thread) {
                log::error!("api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ApiContext {
    registry: SourceRegistry,
    store: SqliteInferenceStore,
    bucket: String,
    object_store: Arc<dyn ObjectStore>,
    pipeline: Pipeline,
}

fn run_api(listener: TcpListener, server: ApiServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut ctx = ApiContext {
        registry: SourceRegistry::open(&server.db_path)?,
        store: SqliteInferenceStore::open(&server.db_path)?,
        bucket: server.bucket,
        object_store: server.object_store,
        pipeline: server.pipeline,
    };

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if let Err(e) = handle_conn(stream, &mut ctx) {
                    log::debug!("api connection error: {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn handle_conn(mut stream: TcpStream, ctx: &mut ApiContext) -> Result<()> {
    // The listener is nonblocking; the accepted socket must not be.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(e) => {
            respond(&mut stream, 400, &error_body(&format!("bad request: {}", e)))?;
            return Ok(());
        }
    };

    let (status, body) = match dispatch(&request, ctx) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("api {} {} failed: {}", request.method, request.path, e);
            (500, error_body("internal error"))
        }
    };
    respond(&mut stream, status, &body)
}

struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = std::str::from_utf8(&buf[..header_end])?;
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("missing method"))?
        .to_string();
    let target = parts.next().ok_or_else(|| anyhow!("missing target"))?;

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse()?;
            }
        }
    }
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    };

    Ok(HttpRequest {
        method,
        path,
        query,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

// -------------------- wire DTOs --------------------

#[derive(Serialize)]
struct VideoSourceDto {
    id: i64,
    name: String,
    is_active: bool,
    deleted_at: Option<i64>,
    t_start: f64,
    file: StoredFile,
}

#[derive(Serialize)]
struct OkDto {
    ok: bool,
}

#[derive(Deserialize)]
struct FileCreateDto {
    name: String,
    content_type: String,
}

#[derive(Serialize)]
struct FileCreateResponseDto {
    file: StoredFile,
    upload_url: String,
}

fn video_source_dto(ctx: &ApiContext, source: VideoSource) -> Result<VideoSourceDto> {
    let file = ctx
        .registry
        .get_file(source.file_id)?
        .ok_or_else(|| anyhow!("video source {} references missing file", source.id))?;
    Ok(VideoSourceDto {
        id: source.id,
        name: source.name,
        is_active: source.is_active,
        deleted_at: source.deleted_at,
        t_start: source.t_start,
        file,
    })
}

// -------------------- routing --------------------

fn dispatch(request: &HttpRequest, ctx: &mut ApiContext) -> Result<(u16, String)> {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("POST", ["v1", "files"]) => create_file(request, ctx),

        ("GET", ["v1", "video-sources"]) => list_video_sources(ctx),
        ("POST", ["v1", "video-sources"]) => create_video_source(request, ctx),
        ("PATCH", ["v1", "video-sources", id]) => match parse_id(id) {
            Some(id) => update_video_source(request, ctx, id),
            None => bad_id(),
        },
        ("DELETE", ["v1", "video-sources", id]) => match parse_id(id) {
            Some(id) => destroy_video_source(ctx, id),
            None => bad_id(),
        },
        ("POST", ["v1", "video-sources", id, "tasks", "infer"]) => match parse_id(id) {
            Some(id) => trigger_video_inference(ctx, id),
            None => bad_id(),
        },
        ("GET", ["v1", "video-sources", id, "inferences"]) => match parse_id(id) {
            Some(id) => list_inferences(request, ctx, SourceKind::Video, id),
            None => bad_id(),
        },

        ("GET", ["v1", "camera-sources"]) => list_camera_sources(ctx),
        ("POST", ["v1", "camera-sources"]) => create_camera_source(request, ctx),
        ("PATCH", ["v1", "camera-sources", id]) => match parse_id(id) {
            Some(id) => update_camera_source(request, ctx, id),
            None => bad_id(),
        },
        ("DELETE", ["v1", "camera-sources", id]) => match parse_id(id) {
            Some(id) => destroy_camera_source(ctx, id),
            None => bad_id(),
        },
        ("GET", ["v1", "camera-sources", id, "inferences"]) => match parse_id(id) {
            Some(id) => list_inferences(request, ctx, SourceKind::Camera, id),
            None => bad_id(),
        },

        (_, ["v1", ..]) => Ok((405, error_body("method not allowed"))),
        _ => Ok((404, error_body("not found"))),
    }
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn bad_id() -> Result<(u16, String)> {
    Ok((400, error_body("invalid id")))
}

fn parse_body<T: serde::de::DeserializeOwned>(request: &HttpRequest) -> Result<T> {
    serde_json::from_slice(&request.body).map_err(|e| anyhow!("invalid body: {}", e))
}

fn create_file(request: &HttpRequest, ctx: &mut ApiContext) -> Result<(u16, String)> {
    let dto: FileCreateDto = match parse_body(request) {
        Ok(dto) => dto,
        Err(e) => return Ok((400, error_body(&e.to_string()))),
    };
    let file = ctx
        .registry
        .create_file(&dto.name, &dto.content_type, &ctx.bucket)?;
    let upload_url =
        ctx.object_store
            .presigned_put_url(&file.bucket, &file.object_key, PUT_URL_EXPIRY_SECS)?;
    let body = serde_json::to_string(&FileCreateResponseDto { file, upload_url })?;
    Ok((200, body))
}

fn list_video_sources(ctx: &mut ApiContext) -> Result<(u16, String)> {
    let mut out = Vec::new();
    for source in ctx.registry.list_video_sources()? {
        out.push(video_source_dto(ctx, source)?);
    }
    Ok((200, serde_json::to_string(&out)?))
}

fn create_video_source(request: &HttpRequest, ctx: &mut ApiContext) -> Result<(u16, String)> {
    let new: NewVideoSource = match parse_body(request) {
        Ok(new) => new,
        Err(e) => return Ok((400, error_body(&e.to_string()))),
    };
    let source = ctx.registry.create_video_source(&new)?;
    ctx.pipeline.schedule(SourceKind::Video, source.id);
    let body = serde_json::to_string(&video_source_dto(ctx, source)?)?;
    Ok((200, body))
}

fn update_video_source(
    request: &HttpRequest,
    ctx: &mut ApiContext,
    id: i64,
) -> Result<(u16, String)> {
    let update: SourceUpdate = match parse_body(request) {
        Ok(update) => update,
        Err(e) => return Ok((400, error_body(&e.to_string()))),
    };
    let Some(source) = ctx.registry.update_video_source(id, &update)? else {
        return Ok((404, error_body("source not found")));
    };
    ctx.pipeline.schedule(SourceKind::Video, source.id);
    let body = serde_json::to_string(&video_source_dto(ctx, source)?)?;
    Ok((200, body))
}

fn destroy_video_source(ctx: &mut ApiContext, id: i64) -> Result<(u16, String)> {
    if !ctx.registry.destroy_video_source(id)? {
        return Ok((404, error_body("source not found")));
    }
    Ok((200, serde_json::to_string(&OkDto { ok: true })?))
}

fn trigger_video_inference(ctx: &mut ApiContext, id: i64) -> Result<(u16, String)> {
    let Some(source) = ctx.registry.get_video_source(id)? else {
        return Ok((404, error_body("source not found")));
    };
    ctx.pipeline.schedule(SourceKind::Video, source.id);
    let body = serde_json::to_string(&video_source_dto(ctx, source)?)?;
    Ok((200, body))
}

fn list_camera_sources(ctx: &mut ApiContext) -> Result<(u16, String)> {
    let sources: Vec<CameraSource> = ctx.registry.list_camera_sources()?;
    Ok((200, serde_json::to_string(&sources)?))
}

fn create_camera_source(request: &HttpRequest, ctx: &mut ApiContext) -> Result<(u16, String)> {
    let new: NewCameraSource = match parse_body(request) {
        Ok(new) => new,
        Err(e) => return Ok((400, error_body(&e.to_string()))),
    };
    let source = ctx.registry.create_camera_source(&new)?;
    Ok((200, serde_json::to_string(&source)?))
}

fn update_camera_source(
    request: &HttpRequest,
    ctx: &mut ApiContext,
    id: i64,
) -> Result<(u16, String)> {
    let update: SourceUpdate = match parse_body(request) {
        Ok(update) => update,
        Err(e) => return Ok((400, error_body(&e.to_string()))),
    };
    let Some(source) = ctx.registry.update_camera_source(id, &update)? else {
        return Ok((404, error_body("source not found")));
    };
    Ok((200, serde_json::to_string(&source)?))
}

fn destroy_camera_source(ctx: &mut ApiContext, id: i64) -> Result<(u16, String)> {
    if !ctx.registry.destroy_camera_source(id)? {
        return Ok((404, error_body("source not found")));
    }
    Ok((200, serde_json::to_string(&OkDto { ok: true })?))
}

fn list_inferences(
    request: &HttpRequest,
    ctx: &mut ApiContext,
    kind: SourceKind,
    id: i64,
) -> Result<(u16, String)> {
    let since_t: f64 = match request.query.get("since_t") {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => return Ok((400, error_body("since_t must be a number"))),
        },
        None => 0.0,
    };
    let limit: usize = match request.query.get("limit") {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => return Ok((400, error_body("limit must be an integer"))),
        },
        None => DEFAULT_QUERY_LIMIT,
    };
    let inferences: Vec<Inference> = ctx.store.query(kind, id, since_t, limit)?;
    Ok((200, serde_json::to_string(&inferences)?))
}
