//! Append-only audit trail of logins, sends and queue appends.
//!
//! Records are written for observability only; nothing in the relay reads
//! them back. [`SqliteAuditSink`] persists to a local SQLite file,
//! [`TracingAuditSink`] emits records as structured log events, and
//! [`MemoryAuditSink`] keeps them in memory for tests.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, trace};

/// Errors from an audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Record could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome recorded for logins and sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The call succeeded.
    Success,
    /// The call failed.
    Error,
}

impl AuditStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Size and continuation flag of a queued fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentSummary {
    /// Characters pending.
    pub len: usize,
    /// Whether earlier slices were already delivered.
    pub continued: bool,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuditEvent {
    /// A login attempt.
    Login {
        /// Outcome.
        status: AuditStatus,
        /// Failure reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A send attempt.
    SendMessage {
        /// Outcome.
        status: AuditStatus,
        /// Text handed to the destination.
        message: String,
        /// Failure reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Text appended to the queue.
    AppendMessage {
        /// Appended text.
        message: String,
        /// Queue state after the append.
        queue: Vec<FragmentSummary>,
    },
}

impl AuditEvent {
    /// Stable kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::SendMessage { .. } => "send-message",
            Self::AppendMessage { .. } => "append-message",
        }
    }

    /// Outcome, when the event has one.
    pub fn status(&self) -> Option<AuditStatus> {
        match self {
            Self::Login { status, .. } | Self::SendMessage { status, .. } => Some(*status),
            Self::AppendMessage { .. } => None,
        }
    }
}

/// A timestamped audit entry for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    /// When it happened.
    pub created_at: DateTime<Utc>,
    /// Destination name.
    pub destination: String,
    /// What happened.
    pub event: AuditEvent,
}

impl AuditRecord {
    /// Stamp an event with the current time.
    pub fn now(destination: &str, event: AuditEvent) -> Self {
        Self {
            created_at: Utc::now(),
            destination: destination.to_owned(),
            event,
        }
    }
}

/// Append-only record store.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one record.
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// SQLite-backed audit sink.
#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    pool: SqlitePool,
}

impl SqliteAuditSink {
    /// Open (or create) the audit database and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create audit directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open audit db at {}", path.display()))?;

        Self::from_pool(pool).await
    }

    /// In-memory database; the schema lives as long as the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot be initialised.
    #[doc(hidden)]
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory audit db")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        let migration_sql = include_str!("../migrations/001_audit_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply audit schema migration")?;
        Ok(Self { pool })
    }

    /// Number of stored records of a kind.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Database`] on SQLite failure.
    #[doc(hidden)]
    pub async fn count_kind(&self, kind: &str) -> Result<i64, AuditError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE kind = ?1")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let details = serde_json::to_string(&record.event)?;
        sqlx::query(
            "INSERT INTO audit_log (created_at, destination, kind, status, details) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(record.created_at.to_rfc3339())
        .bind(&record.destination)
        .bind(record.event.kind())
        .bind(record.event.status().map(AuditStatus::as_str))
        .bind(details)
        .execute(&self.pool)
        .await?;

        trace!(destination = %record.destination, kind = record.event.kind(), "audit record stored");
        Ok(())
    }
}

/// Emits audit records as `info` events on the audit log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let details = serde_json::to_string(&record.event)?;
        info!(
            target: crate::logging::AUDIT_TARGET,
            destination = %record.destination,
            kind = record.event.kind(),
            created_at = %record.created_at.to_rfc3339(),
            details = %details,
            "audit"
        );
        Ok(())
    }
}

/// Keeps records in memory.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}
