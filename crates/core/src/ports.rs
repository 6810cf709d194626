//! Port traits the settlement engine drives.
//!
//! The engine only ever sees these seams; the Postgres implementations live
//! in the store crate and test doubles live with the engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    ClaimRecord, Decision, Epoch, LeaderboardPeriod, PeriodCursor, RewardsState, TopWallet, Winner,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("state row missing")]
    StateMissing,
    #[error("epoch {0} not found")]
    EpochNotFound(i64),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Pure decision function evaluated against the carry read under the decide
/// transaction. Input is the current `carry_rewards_lamports`.
pub type DecideFn<'a> = &'a (dyn Fn(u64) -> Decision + Send + Sync);

/// Durable rewards state, epochs, and winners. Every method is one ACID
/// transaction; money-affecting transitions never span two calls.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self) -> StoreResult<RewardsState>;

    async fn epoch_by_period(&self, period_id: i64) -> StoreResult<Option<Epoch>>;

    async fn epoch_by_id(&self, epoch_id: i64) -> StoreResult<Option<Epoch>>;

    /// Insert a fresh epoch for a period, snapshotting the pool share.
    async fn create_epoch(&self, period_id: i64, rewards_pool_bps: u16) -> StoreResult<Epoch>;

    /// Reset a failed epoch to `created` for a retry cycle, clearing the
    /// failure reason and the whole claim window (balances, inflows,
    /// signatures, treasury flag, pot and payout bookkeeping).
    async fn reset_epoch_for_retry(&self, epoch_id: i64) -> StoreResult<()>;

    /// Transition `created -> claiming`, recording the pre-claim balance.
    async fn begin_claim(&self, epoch_id: i64, before_balance: u64) -> StoreResult<()>;

    /// The decide transaction: reads carry under lock, evaluates `decide`,
    /// and commits the outcome atomically — claim bookkeeping, carry update
    /// (zeroed on pay, pot returned on skip), treasury accrual (once per
    /// claim window), status transition, and the cursor advance on skip.
    async fn decide(
        &self,
        epoch_id: i64,
        claim: &ClaimRecord,
        cursor: &PeriodCursor,
        decide: DecideFn<'_>,
    ) -> StoreResult<Decision>;

    /// Persist the payout signature the moment the send succeeds, before
    /// anything else. Single-column update in its own transaction.
    async fn record_payout_signature(&self, epoch_id: i64, signature: &str) -> StoreResult<()>;

    /// Terminal success: insert winners (insert-or-ignore on both epoch/rank
    /// and epoch/wallet), mark the epoch completed, advance the cursor.
    async fn finalize_epoch(
        &self,
        epoch_id: i64,
        signature: &str,
        winners: &[Winner],
        cursor: &PeriodCursor,
    ) -> StoreResult<()>;

    /// Terminal failure after the pot was reserved: restore it to carry and
    /// mark the epoch failed, in one transaction. The cursor stays put.
    async fn fail_epoch_restore_carry(
        &self,
        epoch_id: i64,
        reason: &str,
        total_pot: u64,
    ) -> StoreResult<()>;

    /// Terminal failure before any pot deduction. Carry is untouched.
    async fn fail_epoch(&self, epoch_id: i64, reason: &str) -> StoreResult<()>;

    /// Recovery write for a stuck claim: record the recomputed claim window
    /// and reset the epoch to `created` so the next tick runs decide with it.
    async fn store_recovered_claim(&self, epoch_id: i64, claim: &ClaimRecord) -> StoreResult<()>;

    /// Advance the cursor monotonically by period end.
    async fn advance_cursor(&self, cursor: &PeriodCursor) -> StoreResult<()>;

    /// Non-terminal epochs whose last durable write is older than the cutoff.
    async fn stuck_epochs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Epoch>>;

    /// Most recent epochs with their winners sorted by rank.
    async fn recent_epochs(&self, limit: i64) -> StoreResult<Vec<(Epoch, Vec<Winner>)>>;
}

/// Read-only access to the externally owned leaderboard and trade tables.
#[async_trait]
pub trait QueryPort: Send + Sync {
    /// The ended period with the smallest `end_time` strictly greater than
    /// `last_end`; on first run (`None`), the most recently ended period.
    async fn next_period_to_process(
        &self,
        last_end: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<LeaderboardPeriod>>;

    async fn period_by_id(&self, period_id: i64) -> StoreResult<Option<LeaderboardPeriod>>;

    /// Wallets ranked by realized profit over `[start, end)`, eligibility
    /// filters applied, deterministic ordering.
    async fn top_wallets_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        min_trades: u32,
        limit: i64,
    ) -> StoreResult<Vec<TopWallet>>;

    /// The period currently in flight, if any. Used for the status countdown.
    async fn active_period(&self) -> StoreResult<Option<LeaderboardPeriod>>;
}

/// Cluster-wide leadership via a session-scoped advisory lock held on a
/// dedicated connection. Losing the connection loses the lock.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Non-blocking acquisition attempt. `Ok(false)` means another process
    /// holds the lock.
    async fn try_acquire(&self) -> StoreResult<bool>;

    /// Trivial query on the lock connection; an error means leadership must
    /// be dropped.
    async fn heartbeat(&self) -> StoreResult<()>;

    /// Explicit release for orderly shutdown.
    async fn release(&self) -> StoreResult<()>;
}
