//! Source registry.
//!
//! A source is a registered origin of video frames: either a stored file
//! (`VideoSource`, decoded via a presigned object-store URL) or a live
//! endpoint (`CameraSource`). Sources are soft-deleted: `destroy` stamps
//! `deleted_at` and clears the active flag, but the row stays resolvable by
//! direct id lookup so an in-flight run can observe the deletion through its
//! liveness poll and wind down cleanly.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::objectstore::{ObjectStore, GET_URL_EXPIRY_SECS};
use crate::{now_s, now_secs_f64, open_db_connection, random_hex_id, SourceKind};

/// An uploaded video blob reference. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredFile {
    pub id: i64,
    pub name: String,
    pub content_type: String,
    pub bucket: String,
    pub object_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VideoSource {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    /// Unix seconds of the soft deletion, `None` while the source is live.
    pub deleted_at: Option<i64>,
    /// Wall-clock epoch (unix seconds) anchoring stream-relative offsets.
    pub t_start: f64,
    pub file_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraSource {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub deleted_at: Option<i64>,
    pub url: String,
    /// Generated media-gateway stream identifier.
    pub stream_name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewVideoSource {
    pub name: String,
    pub is_active: bool,
    pub file_id: i64,
    /// Defaults to the creation time when omitted.
    #[serde(default)]
    pub t_start: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewCameraSource {
    pub name: String,
    pub is_active: bool,
    pub url: String,
}

/// Partial update for either source kind. Unset fields keep their value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

/// A source resolved for one pipeline run: a decodable URL plus the epoch
/// that converts presentation offsets into absolute timestamps.
#[derive(Clone, Debug)]
pub struct ResolvedSource {
    pub kind: SourceKind,
    pub id: i64,
    pub url: String,
    pub t_start: f64,
}

pub struct SourceRegistry {
    conn: Connection,
}

impl SourceRegistry {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let registry = Self { conn };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS files (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              content_type TEXT NOT NULL,
              bucket TEXT NOT NULL,
              object_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_sources (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              is_active INTEGER NOT NULL,
              deleted_at INTEGER,
              t_start REAL NOT NULL,
              file_id INTEGER NOT NULL REFERENCES files(id)
            );

            CREATE TABLE IF NOT EXISTS camera_sources (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              is_active INTEGER NOT NULL,
              deleted_at INTEGER,
              url TEXT NOT NULL,
              stream_name TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // -------------------- files --------------------

    /// Register an uploaded blob under a fresh object key.
    pub fn create_file(&self, name: &str, content_type: &str, bucket: &str) -> Result<StoredFile> {
        let object_key = random_hex_id();
        self.conn.execute(
            "INSERT INTO files(name, content_type, bucket, object_key) VALUES (?1, ?2, ?3, ?4)",
            params![name, content_type, bucket, object_key],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(StoredFile {
            id,
            name: name.to_string(),
            content_type: content_type.to_string(),
            bucket: bucket.to_string(),
            object_key,
        })
    }

    pub fn get_file(&self, id: i64) -> Result<Option<StoredFile>> {
        let file = self
            .conn
            .query_row(
                "SELECT id, name, content_type, bucket, object_key FROM files WHERE id = ?1",
                params![id],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    // -------------------- video sources --------------------

    pub fn create_video_source(&self, new: &NewVideoSource) -> Result<VideoSource> {
        if self.get_file(new.file_id)?.is_none() {
            return Err(anyhow!("file {} does not exist", new.file_id));
        }
        let t_start = match new.t_start {
            Some(t_start) => t_start,
            None => now_secs_f64()?,
        };
        self.conn.execute(
            "INSERT INTO video_sources(name, is_active, deleted_at, t_start, file_id)
             VALUES (?1, ?2, NULL, ?3, ?4)",
            params![new.name, new.is_active, t_start, new.file_id],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_video_source(id)?
            .ok_or_else(|| anyhow!("video source {} vanished after insert", id))
    }

    pub fn list_video_sources(&self) -> Result<Vec<VideoSource>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, is_active, deleted_at, t_start, file_id
             FROM video_sources WHERE deleted_at IS NULL ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], video_source_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Direct lookup. Resolves soft-deleted rows too.
    pub fn get_video_source(&self, id: i64) -> Result<Option<VideoSource>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, name, is_active, deleted_at, t_start, file_id
                 FROM video_sources WHERE id = ?1",
                params![id],
                video_source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn update_video_source(
        &self,
        id: i64,
        update: &SourceUpdate,
    ) -> Result<Option<VideoSource>> {
        let Some(mut source) = self.get_video_source(id)? else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            source.name = name.clone();
        }
        if let Some(is_active) = update.is_active {
            source.is_active = is_active;
        }
        self.conn.execute(
            "UPDATE video_sources SET name = ?1, is_active = ?2 WHERE id = ?3",
            params![source.name, source.is_active, id],
        )?;
        Ok(Some(source))
    }

    /// Soft-delete: stamps `deleted_at` and forces the source inactive.
    pub fn destroy_video_source(&self, id: i64) -> Result<bool> {
        if self.get_video_source(id)?.is_none() {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE video_sources SET deleted_at = ?1, is_active = 0
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now_s()? as i64, id],
        )?;
        Ok(true)
    }

    // -------------------- camera sources --------------------

    pub fn create_camera_source(&self, new: &NewCameraSource) -> Result<CameraSource> {
        let stream_name = random_hex_id();
        self.conn.execute(
            "INSERT INTO camera_sources(name, is_active, deleted_at, url, stream_name)
             VALUES (?1, ?2, NULL, ?3, ?4)",
            params![new.name, new.is_active, new.url, stream_name],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_camera_source(id)?
            .ok_or_else(|| anyhow!("camera source {} vanished after insert", id))
    }

    pub fn list_camera_sources(&self) -> Result<Vec<CameraSource>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, is_active, deleted_at, url, stream_name
             FROM camera_sources WHERE deleted_at IS NULL ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], camera_source_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_camera_source(&self, id: i64) -> Result<Option<CameraSource>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, name, is_active, deleted_at, url, stream_name
                 FROM camera_sources WHERE id = ?1",
                params![id],
                camera_source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn update_camera_source(
        &self,
        id: i64,
        update: &SourceUpdate,
    ) -> Result<Option<CameraSource>> {
        let Some(mut source) = self.get_camera_source(id)? else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            source.name = name.clone();
        }
        if let Some(is_active) = update.is_active {
            source.is_active = is_active;
        }
        self.conn.execute(
            "UPDATE camera_sources SET name = ?1, is_active = ?2 WHERE id = ?3",
            params![source.name, source.is_active, id],
        )?;
        Ok(Some(source))
    }

    pub fn destroy_camera_source(&self, id: i64) -> Result<bool> {
        if self.get_camera_source(id)?.is_none() {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE camera_sources SET deleted_at = ?1, is_active = 0
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now_s()? as i64, id],
        )?;
        Ok(true)
    }

    // -------------------- run support --------------------

    /// Liveness poll for a run in progress. Re-reads the row every call;
    /// absent, deleted, and deactivated sources all read as not live.
    pub fn is_live(&self, kind: SourceKind, id: i64) -> Result<bool> {
        let live = match kind {
            SourceKind::Video => self
                .get_video_source(id)?
                .map(|source| source.is_active && source.deleted_at.is_none()),
            SourceKind::Camera => self
                .get_camera_source(id)?
                .map(|source| source.is_active && source.deleted_at.is_none()),
        };
        Ok(live.unwrap_or(false))
    }

    /// Resolve a source into a decodable URL for one run.
    ///
    /// Returns `None` when the source is absent, deleted, or inactive; the
    /// caller treats that as a silent no-op run. Video sources decode through
    /// a presigned GET URL long enough to cover a full run; camera sources
    /// decode their stored endpoint with `t_start` anchored at run start.
    pub fn resolve(
        &self,
        kind: SourceKind,
        id: i64,
        object_store: &dyn ObjectStore,
    ) -> Result<Option<ResolvedSource>> {
        match kind {
            SourceKind::Video => {
                let Some(source) = self.get_video_source(id)? else {
                    return Ok(None);
                };
                if !source.is_active || source.deleted_at.is_some() {
                    return Ok(None);
                }
                let file = self
                    .get_file(source.file_id)?
                    .ok_or_else(|| anyhow!("video source {} references missing file", id))?;
                let url = object_store.presigned_get_url(
                    &file.bucket,
                    &file.object_key,
                    GET_URL_EXPIRY_SECS,
                )?;
                Ok(Some(ResolvedSource {
                    kind,
                    id,
                    url,
                    t_start: source.t_start,
                }))
            }
            SourceKind::Camera => {
                let Some(source) = self.get_camera_source(id)? else {
                    return Ok(None);
                };
                if !source.is_active || source.deleted_at.is_some() {
                    return Ok(None);
                }
                Ok(Some(ResolvedSource {
                    kind,
                    id,
                    url: source.url,
                    t_start: now_secs_f64()?,
                }))
            }
        }
    }
}

fn file_from_row(row: &Row) -> rusqlite::Result<StoredFile> {
    Ok(StoredFile {
        id: row.get(0)?,
        name: row.get(1)?,
        content_type: row.get(2)?,
        bucket: row.get(3)?,
        object_key: row.get(4)?,
    })
}

fn video_source_from_row(row: &Row) -> rusqlite::Result<VideoSource> {
    Ok(VideoSource {
        id: row.get(0)?,
        name: row.get(1)?,
        is_active: row.get(2)?,
        deleted_at: row.get(3)?,
        t_start: row.get(4)?,
        file_id: row.get(5)?,
    })
}

fn camera_source_from_row(row: &Row) -> rusqlite::Result<CameraSource> {
    Ok(CameraSource {
        id: row.get(0)?,
        name: row.get(1)?,
        is_active: row.get(2)?,
        deleted_at: row.get(3)?,
        url: row.get(4)?,
        stream_name: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;

    fn registry() -> SourceRegistry {
        SourceRegistry::open(&shared_memory_uri()).expect("open registry")
    }

    fn seed_video(registry: &SourceRegistry) -> VideoSource {
        let file = registry
            .create_file("clip.mp4", "video/mp4", "test-bucket")
            .expect("create file");
        registry
            .create_video_source(&NewVideoSource {
                name: "clip".to_string(),
                is_active: true,
                file_id: file.id,
                t_start: Some(1_700_000_000.0),
            })
            .expect("create source")
    }

    #[test]
    fn create_rejects_missing_file() {
        let registry = registry();
        let err = registry
            .create_video_source(&NewVideoSource {
                name: "clip".to_string(),
                is_active: true,
                file_id: 42,
                t_start: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn update_keeps_unset_fields() {
        let registry = registry();
        let source = seed_video(&registry);

        let updated = registry
            .update_video_source(
                source.id,
                &SourceUpdate {
                    name: None,
                    is_active: Some(false),
                },
            )
            .expect("update")
            .expect("source exists");

        assert_eq!(updated.name, "clip");
        assert!(!updated.is_active);
    }

    #[test]
    fn soft_delete_hides_from_listing_but_not_lookup() {
        let registry = registry();
        let source = seed_video(&registry);

        assert!(registry.destroy_video_source(source.id).expect("destroy"));
        assert!(registry.list_video_sources().expect("list").is_empty());

        let fetched = registry
            .get_video_source(source.id)
            .expect("get")
            .expect("still resolvable");
        assert!(fetched.deleted_at.is_some());
        assert!(!fetched.is_active);
        assert!(!registry.is_live(SourceKind::Video, source.id).expect("live"));
    }

    #[test]
    fn destroy_missing_source_reports_false() {
        let registry = registry();
        assert!(!registry.destroy_camera_source(9).expect("destroy"));
    }
}
