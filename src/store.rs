//! Candidate persistence and historical lookup.
//!
//! The pipeline saves candidates through [`CandidateStore`] and reads back
//! previously accepted texts for the same input to feed historical-fit.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::candidate::Candidate;

/// Stable key for "the same input": blake3 over the lowercased,
/// whitespace-collapsed text.
pub fn input_fingerprint(input: &str) -> String {
    let normalized = input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// A previously accepted candidate for some input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEntry {
    pub candidate_id: Uuid,
    pub correlation_id: Uuid,
    pub text: String,
    pub stage: String,
    pub backend: String,
    pub model: String,
    pub composite_score: Option<f64>,
    pub accepted_at: i64,
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn save(&self, fingerprint: &str, candidate: &Candidate) -> Result<(), StoreError>;
    /// Returns false when no candidate with that id was stored.
    async fn mark_accepted(&self, candidate_id: Uuid) -> Result<bool, StoreError>;
    /// Accepted candidates for `fingerprint`, most recently accepted first.
    async fn historical_lookup(
        &self,
        fingerprint: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalEntry>, StoreError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCandidateStore;

#[async_trait]
impl CandidateStore for NoopCandidateStore {
    async fn save(&self, _fingerprint: &str, _candidate: &Candidate) -> Result<(), StoreError> {
        Ok(())
    }

    async fn mark_accepted(&self, _candidate_id: Uuid) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn historical_lookup(
        &self,
        _fingerprint: &str,
        _limit: usize,
    ) -> Result<Vec<HistoricalEntry>, StoreError> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct SqliteCandidateStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteCandidateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCandidateStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteCandidateStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS candidates (\
               id TEXT PRIMARY KEY,\
               correlation_id TEXT NOT NULL,\
               fingerprint TEXT NOT NULL,\
               stage TEXT NOT NULL,\
               stage_index INTEGER NOT NULL,\
               variant INTEGER NOT NULL,\
               backend TEXT NOT NULL,\
               model TEXT NOT NULL,\
               temperature REAL NOT NULL,\
               max_tokens INTEGER NOT NULL,\
               actual_tokens INTEGER NOT NULL,\
               text TEXT NOT NULL,\
               tags TEXT NOT NULL,\
               composite_score REAL,\
               judge_reasoning TEXT,\
               parent_id TEXT,\
               created_at TEXT NOT NULL,\
               accepted_at INTEGER,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS candidates_fingerprint \
               ON candidates (fingerprint, accepted_at);",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ALEMBIC_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".alembic_candidates.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored candidates.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM candidates", [], |row| row.get(0))?;
                Ok(n as usize)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl CandidateStore for SqliteCandidateStore {
    async fn save(&self, fingerprint: &str, candidate: &Candidate) -> Result<(), StoreError> {
        let fingerprint = fingerprint.to_string();
        let c = candidate.clone();
        let tags = serde_json::to_string(&c.tags).map_err(|e| StoreError::Serde(e.to_string()))?;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO candidates (\
                        id, correlation_id, fingerprint, stage, stage_index, variant,\
                        backend, model, temperature, max_tokens, actual_tokens,\
                        text, tags, composite_score, judge_reasoning, parent_id,\
                        created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
                     ON CONFLICT(id) DO UPDATE SET \
                        text = excluded.text,\
                        composite_score = excluded.composite_score,\
                        judge_reasoning = excluded.judge_reasoning,\
                        updated_at = excluded.updated_at",
                    params![
                        c.id.to_string(),
                        c.correlation_id.to_string(),
                        fingerprint,
                        c.stage.as_str(),
                        c.stage_index as i64,
                        c.variant as i64,
                        c.backend,
                        c.model,
                        f64::from(c.temperature),
                        i64::from(c.max_tokens),
                        i64::from(c.actual_tokens),
                        c.text,
                        tags,
                        c.composite_score,
                        c.judge_reasoning,
                        c.parent_id.map(|p| p.to_string()),
                        c.created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                        now_epoch(),
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn mark_accepted(&self, candidate_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                let updated = conn.execute(
                    "UPDATE candidates SET accepted_at = ?1, updated_at = ?1 WHERE id = ?2",
                    params![now, candidate_id.to_string()],
                )?;
                Ok(updated > 0)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn historical_lookup(
        &self,
        fingerprint: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalEntry>, StoreError> {
        let fingerprint = fingerprint.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, correlation_id, text, stage, backend, model, composite_score, accepted_at \
                     FROM candidates \
                     WHERE fingerprint = ?1 AND accepted_at IS NOT NULL \
                     ORDER BY accepted_at DESC, created_at DESC \
                     LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![fingerprint, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(HistoricalEntry {
                        candidate_id: parse_uuid(&row.get::<_, String>(0)?)?,
                        correlation_id: parse_uuid(&row.get::<_, String>(1)?)?,
                        text: row.get(2)?,
                        stage: row.get(3)?,
                        backend: row.get(4)?,
                        model: row.get(5)?,
                        composite_score: row.get(6)?,
                        accepted_at: row.get(7)?,
                    });
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serde(format!("bad uuid {s:?}: {e}")))
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        assert_eq!(
            input_fingerprint("Write a  function\n"),
            input_fingerprint("write a function")
        );
        assert_ne!(input_fingerprint("write a function"), input_fingerprint("write a poem"));
    }
}
