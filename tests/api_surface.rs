use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tempfile::NamedTempFile;

use spotter::api::{ApiConfig, ApiHandle, ApiServer};
use spotter::config::ObjectStoreSettings;
use spotter::objectstore::ObjectStore;
use spotter::pipeline::{Pipeline, RunLimits};
use spotter::S3Presigner;

struct TestApi {
    handle: Option<ApiHandle>,
    addr: SocketAddr,
    _db_file: NamedTempFile,
}

impl TestApi {
    fn spawn() -> Self {
        let db_file = NamedTempFile::new().expect("temp db");
        let db_path = db_file.path().to_str().expect("db path").to_string();
        let object_store: Arc<dyn ObjectStore> = Arc::new(
            S3Presigner::new(&ObjectStoreSettings {
                endpoint: "http://127.0.0.1:9000".to_string(),
                region: "us-east-1".to_string(),
                bucket: "test-bucket".to_string(),
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
            })
            .expect("presigner"),
        );
        let pipeline = Pipeline::new(&db_path, object_store.clone(), RunLimits::default());
        let handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            &db_path,
            "test-bucket",
            object_store,
            pipeline,
        )
        .spawn()
        .expect("spawn api");
        let addr = handle.addr;
        Self {
            handle: Some(handle),
            addr,
            _db_file: db_file,
        }
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> (u16, serde_json::Value) {
        let mut stream = TcpStream::connect(self.addr).expect("connect");
        let body = body.unwrap_or("");
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read response");

        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .expect("status code")
            .parse()
            .expect("numeric status");
        let body_start = response.find("\r\n\r\n").expect("header end") + 4;
        let payload = &response[body_start..];
        let value = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(payload).expect("json body")
        };
        (status, value)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("stop api");
        }
    }
}

#[test]
fn file_upload_flow_returns_a_presigned_put_url() {
    let api = TestApi::spawn();
    let (status, body) = api.request(
        "POST",
        "/v1/files",
        Some(r#"{"name":"clip.mp4","content_type":"video/mp4"}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(body["file"]["name"], "clip.mp4");
    assert_eq!(body["file"]["bucket"], "test-bucket");
    let upload_url = body["upload_url"].as_str().expect("upload url");
    assert!(upload_url.contains("X-Amz-Signature="));
    assert!(upload_url.contains("X-Amz-Expires=600"));
}

#[test]
fn video_source_crud_and_cursor() {
    let api = TestApi::spawn();
    let (_, file) = api.request(
        "POST",
        "/v1/files",
        Some(r#"{"name":"clip.mp4","content_type":"video/mp4"}"#),
    );
    let file_id = file["file"]["id"].as_i64().expect("file id");

    let (status, created) = api.request(
        "POST",
        "/v1/video-sources",
        Some(&format!(
            r#"{{"name":"clip","is_active":false,"file_id":{},"t_start":1700000000.0}}"#,
            file_id
        )),
    );
    assert_eq!(status, 200);
    let source_id = created["id"].as_i64().expect("source id");
    assert_eq!(created["name"], "clip");
    assert_eq!(created["t_start"], 1700000000.0);
    assert_eq!(created["file"]["id"], file_id);

    let (status, listed) = api.request("GET", "/v1/video-sources", None);
    assert_eq!(status, 200);
    assert_eq!(listed.as_array().expect("array").len(), 1);

    let (status, updated) = api.request(
        "PATCH",
        &format!("/v1/video-sources/{}", source_id),
        Some(r#"{"name":"renamed"}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(updated["name"], "renamed");
    assert_eq!(updated["is_active"], false);

    let (status, rows) = api.request(
        "GET",
        &format!("/v1/video-sources/{}/inferences?since_t=0&limit=50", source_id),
        None,
    );
    assert_eq!(status, 200);
    assert!(rows.as_array().expect("array").is_empty());

    let (status, deleted) = api.request(
        "DELETE",
        &format!("/v1/video-sources/{}", source_id),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(deleted["ok"], true);

    let (_, listed) = api.request("GET", "/v1/video-sources", None);
    assert!(listed.as_array().expect("array").is_empty());
}

#[test]
fn camera_source_crud() {
    let api = TestApi::spawn();
    let (status, created) = api.request(
        "POST",
        "/v1/camera-sources",
        Some(r#"{"name":"gate","is_active":true,"url":"rtsp://10.0.0.4/stream"}"#),
    );
    assert_eq!(status, 200);
    let source_id = created["id"].as_i64().expect("source id");
    assert!(!created["stream_name"].as_str().expect("stream name").is_empty());

    let (status, updated) = api.request(
        "PATCH",
        &format!("/v1/camera-sources/{}", source_id),
        Some(r#"{"is_active":false}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(updated["is_active"], false);
    assert_eq!(updated["name"], "gate");

    let (status, deleted) = api.request(
        "DELETE",
        &format!("/v1/camera-sources/{}", source_id),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(deleted["ok"], true);
}

#[test]
fn missing_sources_yield_404() {
    let api = TestApi::spawn();
    let (status, _) = api.request("PATCH", "/v1/video-sources/99", Some(r#"{"name":"x"}"#));
    assert_eq!(status, 404);
    let (status, _) = api.request("DELETE", "/v1/video-sources/99", None);
    assert_eq!(status, 404);
    let (status, _) = api.request("POST", "/v1/video-sources/99/tasks/infer", None);
    assert_eq!(status, 404);
}

#[test]
fn malformed_requests_yield_400() {
    let api = TestApi::spawn();
    let (status, _) = api.request("POST", "/v1/video-sources", Some("{not json"));
    assert_eq!(status, 400);
    let (status, _) = api.request("GET", "/v1/video-sources/abc/inferences", None);
    assert_eq!(status, 400);
}

#[test]
fn unknown_routes_and_methods() {
    let api = TestApi::spawn();
    let (status, _) = api.request("GET", "/nope", None);
    assert_eq!(status, 404);
    let (status, _) = api.request("PUT", "/v1/video-sources", None);
    assert_eq!(status, 405);
}
