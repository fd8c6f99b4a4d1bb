//! # Database Layer
//!
//! Connection pooling for the embedded SQL store.
//!
//! ## Key Components
//!
//! - [`connection`] - the [`ConnectionManager`] seam and its SQLite implementation
//! - [`pool`] - the bounded [`ConnectionPool`] with overflow and recycling
//! - [`pool_stats`] - snapshot statistics read by the health loop
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use riskwatch_core::config::PoolConfig;
//! use riskwatch_core::database::{ConnectionPool, PoolUnavailable};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::sqlite(PoolConfig::default())?;
//!
//! match pool.acquire().await {
//!     Ok(mut conn) => {
//!         pool.execute(&mut conn, "SELECT 1").await?;
//!         pool.release(conn).await;
//!     }
//!     Err(PoolUnavailable::Exhausted { .. }) => { /* degrade: try later */ }
//!     Err(other) => return Err(other.into()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod pool;
pub mod pool_stats;

pub use connection::{ConnectionManager, SqliteConnectionManager};
pub use pool::{
    ConnectionKind, ConnectionPool, MaintenanceReport, PoolUnavailable, PooledConnection,
    SqliteConnectionPool,
};
pub use pool_stats::{PoolStats, PoolStatsSource};
