//! Program guide persistence.
//!
//! The parser writes rows through the abstract [`ProgramStore`]; the XMLTV
//! and JSON collaborators read through it. One table, keyed by
//! `(frequency, channel, start_time)`, with an index on `end_time` for the
//! guide queries.

use std::path::Path;

use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

/// SQL schema for the program store.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS programs (
    frequency TEXT NOT NULL,
    channel TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    event_id INTEGER,
    source_id INTEGER,
    PRIMARY KEY (frequency, channel, start_time)
);

CREATE INDEX IF NOT EXISTS idx_programs_end_time ON programs(end_time);
"#;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid program row: {0}")]
    InvalidRow(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One EPG row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramRow {
    pub frequency: String,
    /// Canonical channel key: a virtual channel number when the VCT mapped
    /// the source, otherwise the raw source/service id as a string.
    pub channel: String,
    /// Unix milliseconds.
    pub start_time: i64,
    pub end_time: i64,
    pub title: String,
    pub description: String,
    pub event_id: Option<i64>,
    pub source_id: Option<i64>,
}

/// Abstract program store.
pub trait ProgramStore: Send + Sync {
    /// Insert or update a row under its `(frequency, channel, start_time)`
    /// key. Later arrivals overwrite title/end/event/source; the description
    /// is only replaced when the incoming row actually carries one, so an
    /// untexted EIT re-announcement never clobbers an ETT description.
    fn upsert_program(&self, row: &ProgramRow) -> Result<()>;

    /// Set the description on rows matching `(frequency, channel, event_id)`.
    /// Returns the number of rows updated; zero means no-op, never an insert.
    fn update_description(
        &self,
        frequency: &str,
        channel: &str,
        event_id: i64,
        description: &str,
    ) -> Result<usize>;

    /// Rows still running or upcoming at `now` (unix ms).
    fn select_active(&self, now_ms: i64) -> Result<Vec<ProgramRow>>;

    /// Rows overlapping the window `[start_ms, end_ms)`.
    fn select_window(&self, start_ms: i64, end_ms: i64) -> Result<Vec<ProgramRow>>;
}

/// SQLite-backed program store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn validate(row: &ProgramRow) -> Result<()> {
        if row.title.is_empty() {
            return Err(StoreError::InvalidRow("empty title"));
        }
        if row.start_time <= 0 {
            return Err(StoreError::InvalidRow("non-positive start time"));
        }
        if row.end_time <= row.start_time {
            return Err(StoreError::InvalidRow("end time not after start time"));
        }
        Ok(())
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgramRow> {
    Ok(ProgramRow {
        frequency: row.get(0)?,
        channel: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        event_id: row.get(6)?,
        source_id: row.get(7)?,
    })
}

const SELECT_COLS: &str =
    "frequency, channel, start_time, end_time, title, description, event_id, source_id";

impl ProgramStore for SqliteStore {
    fn upsert_program(&self, row: &ProgramRow) -> Result<()> {
        Self::validate(row)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO programs
                 (frequency, channel, start_time, end_time, title, description, event_id, source_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(frequency, channel, start_time) DO UPDATE SET
                 end_time = excluded.end_time,
                 title = excluded.title,
                 event_id = excluded.event_id,
                 source_id = excluded.source_id,
                 description = CASE
                     WHEN excluded.description != '' THEN excluded.description
                     ELSE programs.description
                 END",
            params![
                row.frequency,
                row.channel,
                row.start_time,
                row.end_time,
                row.title,
                row.description,
                row.event_id,
                row.source_id,
            ],
        )?;
        Ok(())
    }

    fn update_description(
        &self,
        frequency: &str,
        channel: &str,
        event_id: i64,
        description: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE programs SET description = ?1
             WHERE frequency = ?2 AND channel = ?3 AND event_id = ?4",
            params![description, frequency, channel, event_id],
        )?;
        if updated == 0 {
            debug!(
                "store: no row for description update (freq={}, channel={}, event={})",
                frequency, channel, event_id
            );
        }
        Ok(updated)
    }

    fn select_active(&self, now_ms: i64) -> Result<Vec<ProgramRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM programs
             WHERE end_time > ?1
             ORDER BY channel, start_time"
        ))?;
        let rows = stmt
            .query_map([now_ms], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn select_window(&self, start_ms: i64, end_ms: i64) -> Result<Vec<ProgramRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM programs
             WHERE start_time < ?2 AND end_time > ?1
             ORDER BY channel, start_time"
        ))?;
        let rows = stmt
            .query_map([start_ms, end_ms], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
