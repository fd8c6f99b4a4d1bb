//! # Connection Management
//!
//! The pool treats the store as an opaque resource that can create a handle,
//! execute a statement on it and close it. [`ConnectionManager`] is that seam;
//! [`SqliteConnectionManager`] implements it for the embedded SQLite store.

use crate::error::{RiskwatchError, RiskwatchResult};
use async_trait::async_trait;
use sqlx::{Connection, SqliteConnection};
use std::fmt::Debug;
use tracing::{debug, warn};

/// Creates, checks and closes raw store handles for a [`ConnectionPool`]
///
/// [`ConnectionPool`]: crate::database::ConnectionPool
#[async_trait]
pub trait ConnectionManager: Send + Sync + Debug + 'static {
    type Connection: Send + 'static;

    /// Open a new handle
    async fn create(&self) -> RiskwatchResult<Self::Connection>;

    /// Cheap liveness check used when `validate_on_checkout` is enabled
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    /// Close a handle. Errors are logged, never returned.
    async fn close(&self, conn: Self::Connection);

    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, conn: &mut Self::Connection, sql: &str) -> RiskwatchResult<u64>;
}

/// [`ConnectionManager`] for the embedded SQLite store
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    database_url: String,

    /// Statements run on every new connection, e.g. pragmas or schema setup
    init_statements: Vec<String>,
}

impl SqliteConnectionManager {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            init_statements: Vec::new(),
        }
    }

    /// Run `sql` on every connection right after it is opened
    pub fn with_init_statement(mut self, sql: impl Into<String>) -> Self {
        self.init_statements.push(sql.into());
        self
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

#[async_trait]
impl ConnectionManager for SqliteConnectionManager {
    type Connection = SqliteConnection;

    async fn create(&self) -> RiskwatchResult<SqliteConnection> {
        let mut conn = SqliteConnection::connect(&self.database_url).await?;

        for statement in &self.init_statements {
            if let Err(e) = sqlx::query(statement).execute(&mut conn).await {
                // Don't leak a half-initialized connection
                let _ = conn.close().await;
                return Err(RiskwatchError::DatabaseError(format!(
                    "connection init statement failed: {e}"
                )));
            }
        }

        debug!(database_url = %self.database_url, "Opened SQLite connection");
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Error while closing SQLite connection");
        }
    }

    async fn execute(&self, conn: &mut SqliteConnection, sql: &str) -> RiskwatchResult<u64> {
        let result = sqlx::query(sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_manager_lifecycle() {
        let manager = SqliteConnectionManager::new("sqlite::memory:")
            .with_init_statement("CREATE TABLE screenings (id INTEGER PRIMARY KEY, name TEXT)");

        let mut conn = manager.create().await.unwrap();
        assert!(manager.is_valid(&mut conn).await);

        let affected = manager
            .execute(&mut conn, "INSERT INTO screenings (name) VALUES ('acme')")
            .await
            .unwrap();
        assert_eq!(affected, 1);

        manager.close(conn).await;
    }

    #[tokio::test]
    async fn test_failing_init_statement_surfaces_error() {
        let manager =
            SqliteConnectionManager::new("sqlite::memory:").with_init_statement("NOT VALID SQL");
        let err = manager.create().await.unwrap_err();
        assert!(matches!(err, RiskwatchError::DatabaseError(_)));
    }
}
