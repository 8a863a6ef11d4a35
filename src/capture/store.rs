//! Query an editor's local SQLite state store for response text.

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inbox::dedup::signature;
use crate::util::blocking_with_timeout;
use crate::worker::WorkerId;
use crate::{wlog_debug, Error, Result};

use super::{CaptureKind, CaptureStrategy, RawCandidate};

/// Runs a configured query read-only; column 0 of each row is candidate text.
///
/// The store is owned by another process, so it is opened read-only with a
/// busy timeout and a locked database simply yields nothing this poll.
pub struct StoreQuery {
    db: PathBuf,
    query: String,
    timeout: Duration,
    /// Row values returned by the previous poll; stores keep old rows around.
    seen: Vec<String>,
    available: bool,
}

impl StoreQuery {
    pub fn new(db: PathBuf, query: String, timeout: Duration) -> Self {
        Self {
            db,
            query,
            timeout,
            seen: Vec::new(),
            available: true,
        }
    }
}

#[async_trait]
impl CaptureStrategy for StoreQuery {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Store
    }

    async fn poll(&mut self, worker: &WorkerId) -> Vec<RawCandidate> {
        let db = self.db.clone();
        let query = self.query.clone();
        let id = worker.to_string();
        let busy = self.timeout;
        let rows =
            match blocking_with_timeout(self.timeout, move || query_rows(&db, &query, &id, busy))
                .await
            {
                Ok(rows) => {
                    self.available = true;
                    rows
                }
                Err(e) => {
                    wlog_debug!("StoreQuery: {} unavailable: {}", self.db.display(), e);
                    self.available = false;
                    return Vec::new();
                }
            };

        let signatures: Vec<String> = rows.iter().map(|r| signature(r)).collect();
        let fresh = rows
            .into_iter()
            .zip(signatures.iter())
            .filter(|(_, sig)| !self.seen.contains(sig))
            .map(|(text, _)| RawCandidate::new(worker, CaptureKind::Store, text))
            .collect();
        self.seen = signatures;
        fresh
    }

    fn available(&self) -> bool {
        self.available
    }
}

fn query_rows(db: &Path, query: &str, worker: &str, busy: Duration) -> Result<Vec<String>> {
    if !db.exists() {
        return Err(Error::Validation(format!("no store at {}", db.display())));
    }
    let conn = Connection::open_with_flags(
        db,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy)?;

    let mut stmt = conn.prepare(query)?;
    let to_text = |row: &rusqlite::Row<'_>| row.get::<_, Value>(0);
    let values: Vec<Value> = match stmt.parameter_count() {
        0 => stmt
            .query_map(params![], to_text)?
            .collect::<rusqlite::Result<_>>()?,
        1 => stmt
            .query_map(params![worker], to_text)?
            .collect::<rusqlite::Result<_>>()?,
        n => {
            return Err(Error::Config(format!(
                "store query takes {} parameters; only ?1 (worker id) is bound",
                n
            )))
        }
    };

    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            Value::Text(s) => Some(s),
            Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Null => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect())
}
