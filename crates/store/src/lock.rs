//! Advisory-lock leadership on a dedicated Postgres connection.
//!
//! The lock is session-scoped: it lives exactly as long as the connection,
//! so a runaway transaction cannot orphan it, and a dropped connection
//! releases it server-side. One lock key, one holder cluster-wide.

use sqlx::{Connection, PgConnection};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use async_trait::async_trait;
use podium_core::ports::StoreResult;
use podium_core::{LeaderLock, StoreError};

use crate::db_err;

/// Fixed cluster-wide lock identifier for the settlement leader.
pub const LEADER_LOCK_KEY: i64 = 0x504f_4449_554d_0001;

pub struct PgLeaderLock {
    url: String,
    key: i64,
    conn: Mutex<Option<PgConnection>>,
}

impl PgLeaderLock {
    pub fn new(url: String, key: i64) -> Self {
        Self {
            url,
            key,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaderLock for PgLeaderLock {
    async fn try_acquire(&self) -> StoreResult<bool> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            match PgConnection::connect(&self.url).await {
                Ok(conn) => {
                    debug!("lock connection established");
                    *guard = Some(conn);
                }
                Err(e) => return Err(db_err(e)),
            }
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Database("lock connection unavailable".into()));
        };

        match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(acquired) => Ok(acquired),
            Err(e) => {
                // A dead connection has already released the lock server-side.
                warn!(error = %e, "lock connection failed during acquire");
                *guard = None;
                Err(db_err(e))
            }
        }
    }

    async fn heartbeat(&self) -> StoreResult<()> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Database("lock connection lost".into()));
        };
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "lock heartbeat failed");
                *guard = None;
                Err(db_err(e))
            }
        }
    }

    async fn release(&self) -> StoreResult<()> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        *guard = None;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(db_err(e)),
        }
    }
}
