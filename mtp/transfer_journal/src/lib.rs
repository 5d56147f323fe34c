//! The transfer journal: a durable record of every in-flight read and
//! write, so interrupted transfers resume instead of restarting.
//!
//! The [`JournalStore`] trait is the collaborator interface the streaming
//! pipeline consumes; [`SqliteJournal`] implements it on a single-writer
//! SQLite database. Progress updates are single-row atomic UPDATEs and are
//! committed before the pipeline requests the next chunk, which is what
//! makes crash recovery at chunk granularity sound.
//!
//! Resume eligibility: a record in state `active`, with
//! `committed_bytes < total_bytes` and `supports_partial`, belongs to
//! [`JournalStore::load_resumables`] output for its device. Whether a
//! resume actually continues at the committed offset is decided above,
//! by comparing the stored [`Etag`] against fresh object info.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

#[cfg(test)]
mod test;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no journal entry with id {0}")]
    NotFound(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Read,
    Write,
}

impl TransferKind {
    fn as_str(self) -> &'static str {
        match self {
            TransferKind::Read => "read",
            TransferKind::Write => "write",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "write" => TransferKind::Write,
            _ => TransferKind::Read,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Paused,
    Failed,
    Done,
}

impl TransferState {
    fn as_str(self) -> &'static str {
        match self {
            TransferState::Active => "active",
            TransferState::Paused => "paused",
            TransferState::Failed => "failed",
            TransferState::Done => "done",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "paused" => TransferState::Paused,
            "failed" => TransferState::Failed,
            "done" => TransferState::Done,
            _ => TransferState::Active,
        }
    }
}

/// The precondition captured when a transfer is journalled: resuming is
/// only sound while the device-side object still has this size and mtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Etag {
    pub size: u64,
    /// The raw PTP modification-date string; compared verbatim.
    pub mtime: String,
}

/// A new journal entry, before it has an id.
#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub device_id: String,
    pub handle: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub total_bytes: u64,
    pub supports_partial: bool,
    pub temp_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub etag: Option<Etag>,
}

/// One journalled transfer.
#[derive(Clone, Debug)]
pub struct TransferRecord {
    pub id: i64,
    pub device_id: String,
    pub kind: TransferKind,
    pub handle: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub total_bytes: u64,
    pub committed_bytes: u64,
    pub supports_partial: bool,
    pub temp_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub state: TransferState,
    pub updated_at: i64,
    pub last_error: Option<String>,
    pub etag: Option<Etag>,
}

impl TransferRecord {
    /// Whether this record may continue from its committed offset on the
    /// next open of the same device (ETag check still pending).
    pub fn resumable(&self) -> bool {
        self.state == TransferState::Active
            && self.supports_partial
            && self.committed_bytes < self.total_bytes
    }
}

/// The journal interface the streaming pipeline consumes.
pub trait JournalStore: Send + Sync {
    fn begin_read(&self, new: &NewTransfer) -> Result<i64, JournalError>;
    fn begin_write(&self, new: &NewTransfer) -> Result<i64, JournalError>;
    /// Records progress through `committed` bytes; atomic per row.
    fn update_progress(&self, id: i64, committed: u64) -> Result<(), JournalError>;
    fn fail(&self, id: i64, error: &str) -> Result<(), JournalError>;
    fn complete(&self, id: i64) -> Result<(), JournalError>;
    fn get(&self, id: i64) -> Result<Option<TransferRecord>, JournalError>;
    /// The resumable reads/writes for one device, oldest first.
    fn load_resumables(&self, device_id: &str) -> Result<Vec<TransferRecord>, JournalError>;
    /// The newest active read of `handle` on `device_id`, if any; the
    /// candidate for an ETag-checked resume.
    fn find_active_read(
        &self,
        device_id: &str,
        handle: u32,
    ) -> Result<Option<TransferRecord>, JournalError>;
    /// Forgets temp files attached to terminal entries, returning the
    /// paths so the caller can unlink them.
    fn clear_stale_temps(&self) -> Result<Vec<PathBuf>, JournalError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transfers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id       TEXT    NOT NULL,
    kind            TEXT    NOT NULL CHECK (kind IN ('read', 'write')),
    handle          INTEGER NOT NULL,
    parent          INTEGER,
    name            TEXT    NOT NULL,
    total_bytes     INTEGER NOT NULL,
    committed_bytes INTEGER NOT NULL DEFAULT 0,
    supports_partial INTEGER NOT NULL,
    temp_path       TEXT,
    final_path      TEXT,
    state           TEXT    NOT NULL CHECK (state IN ('active', 'paused', 'failed', 'done')),
    updated_at      INTEGER NOT NULL,
    last_error      TEXT,
    etag_size       INTEGER,
    etag_mtime      TEXT
);
CREATE INDEX IF NOT EXISTS transfers_by_device ON transfers (device_id, state);
";

/// The SQLite-backed journal. One writer at a time; readers share the same
/// connection lock.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An ephemeral journal, mainly for tests.
    pub fn open_in_memory() -> Result<Self, JournalError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, JournalError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteJournal {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, kind: TransferKind, new: &NewTransfer) -> Result<i64, JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.execute(
            "INSERT INTO transfers (device_id, kind, handle, parent, name, total_bytes, \
             committed_bytes, supports_partial, temp_path, final_path, state, updated_at, \
             etag_size, etag_mtime) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, 'active', ?10, ?11, ?12)",
            params![
                new.device_id,
                kind.as_str(),
                new.handle,
                new.parent,
                new.name,
                new.total_bytes as i64,
                new.supports_partial,
                new.temp_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                new.final_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                Utc::now().timestamp(),
                new.etag.as_ref().map(|e| e.size as i64),
                new.etag.as_ref().map(|e| e.mtime.clone()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "journal {}: {} {:?} ({} bytes)",
            id,
            kind.as_str(),
            new.name,
            new.total_bytes
        );
        Ok(id)
    }

    fn set_state(
        &self,
        id: i64,
        state: TransferState,
        error: Option<&str>,
    ) -> Result<(), JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let n = conn.execute(
            "UPDATE transfers SET state = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, state.as_str(), error, Utc::now().timestamp()],
        )?;
        if n == 0 {
            return Err(JournalError::NotFound(id));
        }
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let etag = match (
        row.get::<_, Option<i64>>("etag_size")?,
        row.get::<_, Option<String>>("etag_mtime")?,
    ) {
        (Some(size), Some(mtime)) => Some(Etag {
            size: size as u64,
            mtime,
        }),
        _ => None,
    };
    Ok(TransferRecord {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        kind: TransferKind::parse(&row.get::<_, String>("kind")?),
        handle: row.get::<_, i64>("handle")? as u32,
        parent: row.get::<_, Option<i64>>("parent")?.map(|p| p as u32),
        name: row.get("name")?,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        committed_bytes: row.get::<_, i64>("committed_bytes")? as u64,
        supports_partial: row.get("supports_partial")?,
        temp_path: row.get::<_, Option<String>>("temp_path")?.map(PathBuf::from),
        final_path: row
            .get::<_, Option<String>>("final_path")?
            .map(PathBuf::from),
        state: TransferState::parse(&row.get::<_, String>("state")?),
        updated_at: row.get("updated_at")?,
        last_error: row.get("last_error")?,
        etag,
    })
}

const SELECT_COLUMNS: &str = "SELECT id, device_id, kind, handle, parent, name, total_bytes, \
     committed_bytes, supports_partial, temp_path, final_path, state, updated_at, last_error, \
     etag_size, etag_mtime FROM transfers";

impl JournalStore for SqliteJournal {
    fn begin_read(&self, new: &NewTransfer) -> Result<i64, JournalError> {
        self.insert(TransferKind::Read, new)
    }

    fn begin_write(&self, new: &NewTransfer) -> Result<i64, JournalError> {
        self.insert(TransferKind::Write, new)
    }

    fn update_progress(&self, id: i64, committed: u64) -> Result<(), JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let n = conn.execute(
            "UPDATE transfers SET committed_bytes = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, committed as i64, Utc::now().timestamp()],
        )?;
        if n == 0 {
            return Err(JournalError::NotFound(id));
        }
        Ok(())
    }

    fn fail(&self, id: i64, error: &str) -> Result<(), JournalError> {
        self.set_state(id, TransferState::Failed, Some(error))
    }

    fn complete(&self, id: i64) -> Result<(), JournalError> {
        self.set_state(id, TransferState::Done, None)
    }

    fn get(&self, id: i64) -> Result<Option<TransferRecord>, JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        Ok(stmt
            .query_row(params![id], record_from_row)
            .optional()?)
    }

    fn load_resumables(&self, device_id: &str) -> Result<Vec<TransferRecord>, JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE device_id = ?1 AND state = 'active' \
             AND supports_partial AND committed_bytes < total_bytes ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![device_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn find_active_read(
        &self,
        device_id: &str,
        handle: u32,
    ) -> Result<Option<TransferRecord>, JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE device_id = ?1 AND handle = ?2 AND kind = 'read' \
             AND state = 'active' ORDER BY id DESC LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(params![device_id, handle], record_from_row)
            .optional()?)
    }

    fn clear_stale_temps(&self) -> Result<Vec<PathBuf>, JournalError> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, temp_path FROM transfers \
             WHERE temp_path IS NOT NULL AND state IN ('failed', 'done')",
        )?;
        let stale: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        let mut paths = Vec::with_capacity(stale.len());
        for (id, path) in stale {
            conn.execute(
                "UPDATE transfers SET temp_path = NULL WHERE id = ?1",
                params![id],
            )?;
            let path = PathBuf::from(path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not remove stale temp {}: {e}", path.display());
                }
            }
            paths.push(path);
        }
        Ok(paths)
    }
}
