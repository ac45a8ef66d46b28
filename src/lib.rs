//! spotter - object detection timelines for video
//!
//! This crate ingests video from stored files or live camera endpoints, runs
//! object-detection inference frame by frame, and persists per-frame hits for
//! timeline retrieval by a polling front-end.
//!
//! # Architecture
//!
//! - `sources`: registered detection targets (video files, live cameras) with
//!   soft deletion and the active flag runs poll for cancellation
//! - `decode`: frame sources that open a URL and yield decodable frames with
//!   a presentation offset
//! - `detect`: the detector contract plus a deterministic stub backend
//! - `store`: per-frame detection batches and the time-ordered read cursor
//! - `pipeline`: the run loop wiring decode, pacing, detection, and
//!   persistence together under a live cancellation signal
//! - `objectstore`: presigned URL issuance for stored video blobs
//! - `api`: the local JSON API consumed by the front-end
//!
//! A run is triggered on source creation, update, or explicit request, and is
//! advisory: the caller receives no completion signal. Results are observable
//! only through the inference cursor.

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod decode;
pub mod detect;
pub mod objectstore;
pub mod pipeline;
pub mod sources;
pub mod store;

pub use decode::{Frame, VideoStream};
pub use detect::{Detector, HitBox, StubDetector};
pub use objectstore::{ObjectStore, S3Presigner};
pub use pipeline::{Pacer, Pipeline, RunCoordinator, RunLimits, RunOutcome};
pub use sources::{
    CameraSource, NewCameraSource, NewVideoSource, ResolvedSource, SourceRegistry, SourceUpdate,
    StoredFile, VideoSource,
};
pub use store::{
    InMemoryInferenceStore, Inference, InferenceHit, InferenceRecord, InferenceStore,
    SqliteInferenceStore,
};

/// Discriminator for the source a detection batch belongs to.
///
/// `(kind, id)` together reference exactly one row in either `video_sources`
/// or `camera_sources`. The pair is deliberately not a SQL foreign key; the
/// registry resolves the referenced source when a run starts, nowhere else.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Video,
    Camera,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Video => "Video",
            SourceKind::Camera => "Camera",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Video" => Ok(SourceKind::Video),
            "Camera" => Ok(SourceKind::Camera),
            other => Err(anyhow!("unknown source kind '{}'", other)),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique shared-cache URI for an in-memory database, so multiple
/// connections in one test observe the same tables.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:spotter_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub(crate) fn now_secs_f64() -> Result<f64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}

/// Random lowercase hex identifier, used for object keys and stream names.
pub(crate) fn random_hex_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
