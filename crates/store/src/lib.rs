//! Podium Store
//!
//! Postgres implementations of the engine's durable ports: the rewards-state
//! singleton, per-period epochs and winners, the read-only leaderboard
//! queries, and the advisory-lock leadership connection.

pub mod lock;
pub mod queries;
pub mod schema;
pub mod store;

pub use lock::{PgLeaderLock, LEADER_LOCK_KEY};
pub use queries::PgQueryPort;
pub use store::PgStateStore;

use podium_core::StoreError;

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Monetary columns are physically signed 64-bit; in memory they are
/// non-negative, so negative values clamp to zero on the way out.
pub(crate) fn lamports(v: i64) -> u64 {
    v.max(0) as u64
}

pub(crate) fn opt_lamports(v: Option<i64>) -> Option<u64> {
    v.map(lamports)
}

pub(crate) fn to_db(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
