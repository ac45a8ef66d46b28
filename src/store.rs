//! Inference store.
//!
//! One `Inference` row is written per processed frame, owning its hits as a
//! single atomic unit. Reads go through a monotonic cursor: callers poll with
//! the `t` of the last record they saw and receive only newer rows, ascending
//! by `t`. A run starts by calling `reset`, which destructively replaces any
//! prior results for the same source, so re-running inference never appends
//! duplicates.

use anyhow::Result;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::detect::HitBox;
use crate::{open_db_connection, SourceKind};

/// One detected object instance within a persisted frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InferenceHit {
    pub id: i64,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub c: f64,
    pub track_id: Option<i64>,
}

/// One processed frame: absolute timestamp plus its ordered hits.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Inference {
    pub id: i64,
    pub t: f64,
    pub source_kind: SourceKind,
    pub source_id: i64,
    pub hits: Vec<InferenceHit>,
}

/// Write-side record for one processed frame.
#[derive(Clone, Debug)]
pub struct InferenceRecord {
    pub t: f64,
    pub source_kind: SourceKind,
    pub source_id: i64,
    pub hits: Vec<HitBox>,
}

pub trait InferenceStore: Send {
    /// Delete every inference (and transitively its hits) for a source.
    ///
    /// Called exactly once, before the first frame of a run. All-or-nothing:
    /// on failure nothing is removed and the run must not proceed.
    fn reset(&mut self, kind: SourceKind, source_id: i64) -> Result<()>;

    /// Persist one inference and its hits atomically. Returns the row id.
    fn append(&mut self, record: &InferenceRecord) -> Result<i64>;

    /// Cursor read: rows with `t > since_t`, ascending by `t`, truncated to
    /// `limit`, hits eagerly attached in insertion order.
    fn query(
        &self,
        kind: SourceKind,
        source_id: i64,
        since_t: f64,
        limit: usize,
    ) -> Result<Vec<Inference>>;
}

pub struct SqliteInferenceStore {
    conn: Connection,
}

impl SqliteInferenceStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS inferences (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              t REAL NOT NULL,
              source_kind TEXT NOT NULL,
              source_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inference_hits (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              inference_id INTEGER NOT NULL REFERENCES inferences(id),
              x REAL NOT NULL,
              y REAL NOT NULL,
              w REAL NOT NULL,
              h REAL NOT NULL,
              c REAL NOT NULL,
              track_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_inferences_source_t
              ON inferences(source_kind, source_id, t);
            CREATE INDEX IF NOT EXISTS idx_hits_inference
              ON inference_hits(inference_id);
            "#,
        )?;
        Ok(())
    }

    fn hits_for(&self, inference_id: i64) -> Result<Vec<InferenceHit>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, x, y, w, h, c, track_id FROM inference_hits
             WHERE inference_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![inference_id], hit_from_row)?;
        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(hits)
    }
}

impl InferenceStore for SqliteInferenceStore {
    fn reset(&mut self, kind: SourceKind, source_id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM inference_hits WHERE inference_id IN
               (SELECT id FROM inferences WHERE source_kind = ?1 AND source_id = ?2)",
            params![kind.as_str(), source_id],
        )?;
        tx.execute(
            "DELETE FROM inferences WHERE source_kind = ?1 AND source_id = ?2",
            params![kind.as_str(), source_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append(&mut self, record: &InferenceRecord) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO inferences(t, source_kind, source_id) VALUES (?1, ?2, ?3)",
            params![record.t, record.source_kind.as_str(), record.source_id],
        )?;
        let inference_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO inference_hits(inference_id, x, y, w, h, c, track_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for hit in &record.hits {
                stmt.execute(params![
                    inference_id,
                    hit.x,
                    hit.y,
                    hit.w,
                    hit.h,
                    hit.c,
                    hit.track_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(inference_id)
    }

    fn query(
        &self,
        kind: SourceKind,
        source_id: i64,
        since_t: f64,
        limit: usize,
    ) -> Result<Vec<Inference>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, t, source_kind, source_id FROM inferences
             WHERE source_kind = ?1 AND source_id = ?2 AND t > ?3
             ORDER BY t ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![kind.as_str(), source_id, since_t, limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut heads = Vec::new();
        for row in rows {
            heads.push(row?);
        }

        let mut out = Vec::with_capacity(heads.len());
        for (id, t, kind_str, source_id) in heads {
            out.push(Inference {
                id,
                t,
                source_kind: SourceKind::parse(&kind_str)?,
                source_id,
                hits: self.hits_for(id)?,
            });
        }
        Ok(out)
    }
}

fn hit_from_row(row: &Row) -> rusqlite::Result<InferenceHit> {
    Ok(InferenceHit {
        id: row.get(0)?,
        x: row.get(1)?,
        y: row.get(2)?,
        w: row.get(3)?,
        h: row.get(4)?,
        c: row.get(5)?,
        track_id: row.get(6)?,
    })
}

/// In-memory store for pipeline tests that do not need sqlite.
#[derive(Debug, Default)]
pub struct InMemoryInferenceStore {
    rows: Vec<Inference>,
    next_id: i64,
    next_hit_id: i64,
}

impl InMemoryInferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl InferenceStore for InMemoryInferenceStore {
    fn reset(&mut self, kind: SourceKind, source_id: i64) -> Result<()> {
        self.rows
            .retain(|row| !(row.source_kind == kind && row.source_id == source_id));
        Ok(())
    }

    fn append(&mut self, record: &InferenceRecord) -> Result<i64> {
        self.next_id += 1;
        let id = self.next_id;
        let hits = record
            .hits
            .iter()
            .map(|hit| {
                self.next_hit_id += 1;
                InferenceHit {
                    id: self.next_hit_id,
                    x: hit.x,
                    y: hit.y,
                    w: hit.w,
                    h: hit.h,
                    c: hit.c,
                    track_id: hit.track_id,
                }
            })
            .collect();
        self.rows.push(Inference {
            id,
            t: record.t,
            source_kind: record.source_kind,
            source_id: record.source_id,
            hits,
        });
        Ok(id)
    }

    fn query(
        &self,
        kind: SourceKind,
        source_id: i64,
        since_t: f64,
        limit: usize,
    ) -> Result<Vec<Inference>> {
        let mut matched: Vec<Inference> = self
            .rows
            .iter()
            .filter(|row| row.source_kind == kind && row.source_id == source_id && row.t > since_t)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.t.total_cmp(&b.t));
        matched.truncate(limit);
        Ok(matched)
    }
}
