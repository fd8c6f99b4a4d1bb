//! Persistence for error events.
//!
//! The aggregator writes every event through an [`ErrorEventStore`]. The SQLite
//! store checks connections out of the shared pool, so audit writes compete for
//! the same bounded resources as everything else and never block on exhaustion.

use crate::database::SqliteConnectionPool;
use crate::error::{RiskwatchError, RiskwatchResult};
use crate::monitoring::{ErrorEvent, ErrorSeverity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt::Debug;
use uuid::Uuid;

#[async_trait]
pub trait ErrorEventStore: Send + Sync + Debug {
    async fn append(&self, event: &ErrorEvent) -> RiskwatchResult<()>;

    /// Delete events older than `cutoff`, returning how many were removed
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RiskwatchResult<u64>;

    async fn count(&self) -> RiskwatchResult<u64>;

    /// Newest first
    async fn recent(&self, limit: usize) -> RiskwatchResult<Vec<ErrorEvent>>;
}

#[derive(Debug, Default)]
pub struct InMemoryErrorEventStore {
    events: Mutex<Vec<ErrorEvent>>,
}

#[async_trait]
impl ErrorEventStore for InMemoryErrorEventStore {
    async fn append(&self, event: &ErrorEvent) -> RiskwatchResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RiskwatchResult<u64> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn count(&self) -> RiskwatchResult<u64> {
        Ok(self.events.lock().len() as u64)
    }

    async fn recent(&self, limit: usize) -> RiskwatchResult<Vec<ErrorEvent>> {
        let events = self.events.lock();
        let mut recent: Vec<ErrorEvent> = events.clone();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }
}

/// Error events persisted in the embedded store's `error_events` table
#[derive(Debug, Clone)]
pub struct SqliteErrorEventStore {
    pool: SqliteConnectionPool,
}

impl SqliteErrorEventStore {
    /// Table definition; also usable as a connection init statement
    pub const SCHEMA: &'static str = "CREATE TABLE IF NOT EXISTS error_events (
        id TEXT PRIMARY KEY,
        occurred_at_ms INTEGER NOT NULL,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        service TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT NOT NULL
    )";

    pub fn new(pool: SqliteConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the table if it doesn't exist
    pub async fn ensure_schema(&self) -> RiskwatchResult<()> {
        let mut conn = self.pool.acquire().await?;
        let result = self.pool.execute(&mut conn, Self::SCHEMA).await;
        self.pool.release(conn).await;
        result.map(|_| ())
    }

    fn event_from_row(row: &SqliteRow) -> RiskwatchResult<ErrorEvent> {
        let id: String = row.try_get("id")?;
        let occurred_at_ms: i64 = row.try_get("occurred_at_ms")?;
        let severity: String = row.try_get("severity")?;
        let context: String = row.try_get("context")?;

        Ok(ErrorEvent {
            id: Uuid::parse_str(&id)
                .map_err(|e| RiskwatchError::DatabaseError(format!("invalid event id {id}: {e}")))?,
            timestamp: DateTime::from_timestamp_millis(occurred_at_ms).ok_or_else(|| {
                RiskwatchError::DatabaseError(format!("invalid timestamp {occurred_at_ms}"))
            })?,
            kind: row.try_get("kind")?,
            severity: severity
                .parse::<ErrorSeverity>()
                .map_err(RiskwatchError::DatabaseError)?,
            service: row.try_get("service")?,
            message: row.try_get("message")?,
            context: serde_json::from_str(&context)?,
        })
    }
}

#[async_trait]
impl ErrorEventStore for SqliteErrorEventStore {
    async fn append(&self, event: &ErrorEvent) -> RiskwatchResult<()> {
        let context = serde_json::to_string(&event.context)?;
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query(
            "INSERT INTO error_events (id, occurred_at_ms, kind, severity, service, message, context)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.kind)
        .bind(event.severity.as_str())
        .bind(&event.service)
        .bind(&event.message)
        .bind(context)
        .execute(&mut *conn)
        .await;

        self.pool.record_queries(1);
        self.pool.release(conn).await;
        result.map(|_| ()).map_err(Into::into)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RiskwatchResult<u64> {
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query("DELETE FROM error_events WHERE occurred_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&mut *conn)
            .await;

        self.pool.record_queries(1);
        self.pool.release(conn).await;
        Ok(result?.rows_affected())
    }

    async fn count(&self) -> RiskwatchResult<u64> {
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query("SELECT COUNT(*) AS count FROM error_events")
            .fetch_one(&mut *conn)
            .await;

        self.pool.record_queries(1);
        self.pool.release(conn).await;
        let count: i64 = result?.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn recent(&self, limit: usize) -> RiskwatchResult<Vec<ErrorEvent>> {
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query(
            "SELECT id, occurred_at_ms, kind, severity, service, message, context
             FROM error_events ORDER BY occurred_at_ms DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await;

        self.pool.record_queries(1);
        self.pool.release(conn).await;
        result?.iter().map(Self::event_from_row).collect()
    }
}
