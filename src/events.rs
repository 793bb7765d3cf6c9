//! Event Log - SQLite-backed history of daemon activity
//!
//! Records what the daemon did and when:
//! - Daemon startup and shutdown
//! - Heads processed with a new revision
//! - Fatal sync errors (written just before the process exits)
//!
//! The database is stored in XDG_DATA_HOME/headwatch/events.db by default.
//! It is a diagnostic aid only; the per-head state files remain the source of
//! truth for which revisions were processed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info, warn};

/// Event types recorded by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Daemon started
    Startup,
    /// A head reached a new revision and the downstream handler was notified
    Processed,
    /// A reconciliation pass failed
    SyncError,
    /// Daemon stopped gracefully
    Shutdown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Startup => "startup",
            EventType::Processed => "processed",
            EventType::SyncError => "sync_error",
            EventType::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "startup" => Some(EventType::Startup),
            "processed" => Some(EventType::Processed),
            "sync_error" => Some(EventType::SyncError),
            "shutdown" => Some(EventType::Shutdown),
            _ => None,
        }
    }

    /// Get the severity level for this event type
    pub fn severity(&self) -> Severity {
        match self {
            EventType::Startup | EventType::Processed | EventType::Shutdown => Severity::Info,
            EventType::SyncError => Severity::Error,
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// A recorded event
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub head: Option<String>,
    pub revision: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
}

/// Builder for creating new events
#[derive(Debug)]
pub struct EventBuilder {
    head: Option<String>,
    revision: Option<String>,
    event_type: EventType,
    summary: String,
}

impl EventBuilder {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            head: None,
            revision: None,
            event_type,
            summary: summary.into(),
        }
    }

    pub fn head(mut self, key: impl Into<String>) -> Self {
        self.head = Some(key.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Event database
pub struct EventLog {
    conn: Connection,
}

impl EventLog {
    /// Open or create the event database at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let log = Self { conn };
        log.initialize()?;

        info!("Event log opened at {}", path.display());
        Ok(log)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let log = Self { conn };
        log.initialize()?;
        Ok(log)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    head TEXT,
                    revision TEXT,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    summary TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_head ON events(head, timestamp);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Event log schema initialized");
        Ok(())
    }

    /// Record an event
    pub fn record(&self, builder: EventBuilder) -> Result<i64> {
        let now = Utc::now();
        self.conn
            .execute(
                r#"
                INSERT INTO events (timestamp, head, revision, event_type, severity, summary)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    now.to_rfc3339(),
                    builder.head,
                    builder.revision,
                    builder.event_type.as_str(),
                    builder.event_type.severity().as_str(),
                    builder.summary,
                ],
            )
            .context("Failed to record event")?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent events, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, timestamp, head, revision, event_type, severity, summary
            FROM events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp, head, revision, event_type, severity, summary) = row?;

            let Some(event_type) = EventType::parse(&event_type) else {
                continue;
            };
            let timestamp = match DateTime::parse_from_rfc3339(&timestamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!("Skipping event {} with bad timestamp '{}': {}", id, timestamp, e);
                    continue;
                }
            };

            events.push(Event {
                id,
                timestamp,
                head,
                revision,
                event_type,
                severity: Severity::parse(&severity).unwrap_or(event_type.severity()),
                summary,
            });
        }

        Ok(events)
    }

    /// Delete events older than `days`
    pub fn cleanup_old_events(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let count = self
            .conn
            .execute(
                "DELETE FROM events WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to cleanup old events")?;
        Ok(count as u64)
    }
}
