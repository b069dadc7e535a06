//! SQLite punch log.
//!
//! Every accepted punch becomes one row of `log_information`. The row is the
//! source of truth for IN/OUT alternation; the daemon never keeps punch
//! history in memory.

use chrono::{DateTime, Local};
use garrison_core::{AttendanceStore, PersistenceError, PunchRecord, PunchType};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS log_information (
    event_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    date_time_saved TEXT    NOT NULL,
    date_time_event TEXT    NOT NULL,
    device_id       INTEGER NOT NULL,
    user_id         INTEGER NOT NULL,
    punch_type      TEXT    NOT NULL,
    photo_url       TEXT    NOT NULL,
    longitude       REAL    NOT NULL DEFAULT 14.47631000,
    latitude        REAL    NOT NULL DEFAULT 35.92584060,
    punch_date      TEXT    NOT NULL,
    punch_time      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_log_information_user
    ON log_information (user_id, date_time_event);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt punch type {0:?} in log")]
    CorruptPunchType(String),
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

/// One row of the punch log, as listed to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PunchSummary {
    pub event_id: i64,
    pub user_id: i64,
    pub punch_type: String,
    pub date_time_event: String,
    pub photo_url: String,
    pub device_id: i64,
}

pub struct PunchLog {
    conn: Connection,
}

impl PunchLog {
    /// Open (or create) the punch log at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Append one punch; returns its `event_id`.
    pub fn insert(&self, record: &PunchRecord, saved_at: DateTime<Local>) -> Result<i64, StoreError> {
        let event = record.event_time;
        self.conn.execute(
            "INSERT INTO log_information (
                date_time_saved, date_time_event, device_id, user_id, punch_type,
                photo_url, longitude, latitude, punch_date, punch_time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                saved_at.format(EVENT_TIME_FORMAT).to_string(),
                event.format(EVENT_TIME_FORMAT).to_string(),
                record.device_id,
                record.user_id,
                record.punch_type.as_str(),
                record.photo_reference,
                record.location.longitude,
                record.location.latitude,
                event.format("%Y-%m-%d").to_string(),
                event.format("%H:%M:%S").to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Type of the user's most recent punch, if any.
    pub fn latest_punch_type(&self, user_id: i64) -> Result<Option<PunchType>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT punch_type FROM log_information
                 WHERE user_id = ?1
                 ORDER BY date_time_event DESC, event_id DESC
                 LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| s.parse::<PunchType>().map_err(|_| StoreError::CorruptPunchType(s)))
            .transpose()
    }
}

impl AttendanceStore for PunchLog {
    fn last_punch_type(&mut self, user_id: i64) -> Result<Option<PunchType>, PersistenceError> {
        Ok(self.latest_punch_type(user_id)?)
    }

    fn record_punch(&mut self, record: &PunchRecord) -> Result<(), PersistenceError> {
        let event_id = self.insert(record, Local::now())?;
        tracing::debug!(event_id, user_id = record.user_id, "punch stored");
        Ok(())
    }
}

pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}

/// Newest punches first.
pub fn recent_punches(conn: &Connection, limit: u32) -> Result<Vec<PunchSummary>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT event_id, user_id, punch_type, date_time_event, photo_url, device_id
         FROM log_information
         ORDER BY date_time_event DESC, event_id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(PunchSummary {
            event_id: row.get(0)?,
            user_id: row.get(1)?,
            punch_type: row.get(2)?,
            date_time_event: row.get(3)?,
            photo_url: row.get(4)?,
            device_id: row.get(5)?,
        })
    })?;
    rows.collect()
}
