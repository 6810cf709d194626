//! Postgres state store: rewards-state singleton, epochs, winners.
//!
//! Every public method is one ACID transaction. The decide transaction is
//! the correctness hinge: it reads carry under a row lock, evaluates the
//! pure decision function against it, and commits the carry update together
//! with the status transition so a pot can never be reserved twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::debug;

use podium_core::ports::{DecideFn, StoreResult};
use podium_core::{
    ClaimRecord, Decision, Epoch, EpochStatus, PayoutPlanEntry, PeriodCursor, RewardsState,
    StateStore, StoreError, Winner,
};

use crate::{db_err, lamports, opt_lamports, to_db};

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct EpochRow {
    epoch_id: i64,
    leaderboard_period_id: i64,
    rewards_pool_bps: i32,
    before_balance: Option<i64>,
    after_balance: Option<i64>,
    total_inflow: Option<i64>,
    reward_inflow: Option<i64>,
    treasury_inflow: Option<i64>,
    treasury_applied: bool,
    claim_started_at: Option<DateTime<Utc>>,
    claim_completed_at: Option<DateTime<Utc>>,
    claim_tx_signatures: serde_json::Value,
    carry_in: Option<i64>,
    total_pot: Option<i64>,
    payout_plan: serde_json::Value,
    payout_started_at: Option<DateTime<Utc>>,
    payout_completed_at: Option<DateTime<Utc>>,
    payout_tx_signature: Option<String>,
    total_paid: Option<i64>,
    status: String,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EpochRow> for Epoch {
    type Error = StoreError;

    fn try_from(row: EpochRow) -> Result<Self, StoreError> {
        let status = EpochStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown status {}", row.status)))?;
        let claim_tx_signatures: Vec<String> = serde_json::from_value(row.claim_tx_signatures)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let payout_plan: Vec<PayoutPlanEntry> = serde_json::from_value(row.payout_plan)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Epoch {
            epoch_id: row.epoch_id,
            leaderboard_period_id: row.leaderboard_period_id,
            rewards_pool_bps: row.rewards_pool_bps.clamp(0, 10_000) as u16,
            before_balance: opt_lamports(row.before_balance),
            after_balance: opt_lamports(row.after_balance),
            total_inflow: opt_lamports(row.total_inflow),
            reward_inflow: opt_lamports(row.reward_inflow),
            treasury_inflow: opt_lamports(row.treasury_inflow),
            treasury_applied: row.treasury_applied,
            claim_started_at: row.claim_started_at,
            claim_completed_at: row.claim_completed_at,
            claim_tx_signatures,
            carry_in: opt_lamports(row.carry_in),
            total_pot: opt_lamports(row.total_pot),
            payout_plan,
            payout_started_at: row.payout_started_at,
            payout_completed_at: row.payout_completed_at,
            payout_tx_signature: row.payout_tx_signature,
            total_paid: opt_lamports(row.total_paid),
            status,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Cursor-advance fragment, monotonic by period end.
const ADVANCE_CURSOR_SQL: &str = r#"
    UPDATE rewards_state SET
        last_processed_period_id = CASE
            WHEN last_processed_period_end IS NULL OR last_processed_period_end < $2
            THEN $1 ELSE last_processed_period_id END,
        last_processed_period_end = CASE
            WHEN last_processed_period_end IS NULL OR last_processed_period_end < $2
            THEN $2 ELSE last_processed_period_end END,
        updated_at = NOW()
    WHERE id = 1
"#;

#[async_trait]
impl StateStore for PgStateStore {
    async fn load_state(&self) -> StoreResult<RewardsState> {
        let row = sqlx::query(
            "SELECT carry_rewards_lamports, treasury_accrued_lamports, \
             last_processed_period_id, last_processed_period_end, updated_at \
             FROM rewards_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StateMissing)?;

        Ok(RewardsState {
            carry_rewards_lamports: lamports(row.try_get(0).map_err(db_err)?),
            treasury_accrued_lamports: lamports(row.try_get(1).map_err(db_err)?),
            last_processed_period_id: row.try_get(2).map_err(db_err)?,
            last_processed_period_end: row.try_get(3).map_err(db_err)?,
            updated_at: row.try_get(4).map_err(db_err)?,
        })
    }

    async fn epoch_by_period(&self, period_id: i64) -> StoreResult<Option<Epoch>> {
        let row = sqlx::query_as::<_, EpochRow>(
            "SELECT * FROM reward_epochs WHERE leaderboard_period_id = $1",
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(Epoch::try_from).transpose()
    }

    async fn epoch_by_id(&self, epoch_id: i64) -> StoreResult<Option<Epoch>> {
        let row = sqlx::query_as::<_, EpochRow>("SELECT * FROM reward_epochs WHERE epoch_id = $1")
            .bind(epoch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Epoch::try_from).transpose()
    }

    async fn create_epoch(&self, period_id: i64, rewards_pool_bps: u16) -> StoreResult<Epoch> {
        let row = sqlx::query_as::<_, EpochRow>(
            "INSERT INTO reward_epochs (leaderboard_period_id, rewards_pool_bps) \
             VALUES ($1, $2) RETURNING *",
        )
        .bind(period_id)
        .bind(i32::from(rewards_pool_bps))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        debug!(period_id, "epoch created");
        Epoch::try_from(row)
    }

    async fn reset_epoch_for_retry(&self, epoch_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE reward_epochs SET \
                status = 'created', failure_reason = NULL, \
                before_balance = NULL, after_balance = NULL, total_inflow = NULL, \
                reward_inflow = NULL, treasury_inflow = NULL, treasury_applied = FALSE, \
                claim_started_at = NULL, claim_completed_at = NULL, \
                claim_tx_signatures = '[]'::jsonb, \
                carry_in = NULL, total_pot = NULL, payout_plan = '[]'::jsonb, \
                payout_started_at = NULL, payout_completed_at = NULL, \
                payout_tx_signature = NULL, total_paid = NULL, updated_at = NOW() \
             WHERE epoch_id = $1 AND status = 'failed'",
        )
        .bind(epoch_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::EpochNotFound(epoch_id));
        }
        Ok(())
    }

    async fn begin_claim(&self, epoch_id: i64, before_balance: u64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE reward_epochs SET status = 'claiming', claim_started_at = NOW(), \
             before_balance = $2, updated_at = NOW() WHERE epoch_id = $1",
        )
        .bind(epoch_id)
        .bind(to_db(before_balance))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn decide(
        &self,
        epoch_id: i64,
        claim: &ClaimRecord,
        cursor: &PeriodCursor,
        decide: DecideFn<'_>,
    ) -> StoreResult<Decision> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let carry: i64 = sqlx::query_scalar(
            "SELECT carry_rewards_lamports FROM rewards_state WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StateMissing)?;

        let treasury_applied: bool = sqlx::query_scalar(
            "SELECT treasury_applied FROM reward_epochs WHERE epoch_id = $1 FOR UPDATE",
        )
        .bind(epoch_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::EpochNotFound(epoch_id))?;

        let decision = decide(lamports(carry));

        let signatures = serde_json::to_value(&claim.signatures)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let treasury_delta = if treasury_applied {
            0
        } else {
            to_db(claim.treasury_inflow)
        };

        match &decision {
            Decision::Skip {
                reason,
                carry_in,
                total_pot,
            } => {
                sqlx::query(
                    "UPDATE reward_epochs SET \
                        after_balance = $2, total_inflow = $3, reward_inflow = $4, \
                        treasury_inflow = $5, treasury_applied = TRUE, \
                        claim_completed_at = NOW(), claim_tx_signatures = $6, \
                        carry_in = $7, total_pot = $8, \
                        status = 'skipped', failure_reason = $9, updated_at = NOW() \
                     WHERE epoch_id = $1",
                )
                .bind(epoch_id)
                .bind(to_db(claim.after_balance))
                .bind(to_db(claim.total_inflow))
                .bind(to_db(claim.reward_inflow))
                .bind(to_db(claim.treasury_inflow))
                .bind(&signatures)
                .bind(to_db(*carry_in))
                .bind(to_db(*total_pot))
                .bind(reason.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                // Pot back to carry, treasury accrued once, cursor advanced.
                sqlx::query(
                    "UPDATE rewards_state SET \
                        carry_rewards_lamports = $1, \
                        treasury_accrued_lamports = treasury_accrued_lamports + $2, \
                        updated_at = NOW() \
                     WHERE id = 1",
                )
                .bind(to_db(*total_pot))
                .bind(treasury_delta)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query(ADVANCE_CURSOR_SQL)
                    .bind(cursor.period_id)
                    .bind(cursor.period_end)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            Decision::Pay {
                carry_in,
                total_pot,
                plan,
            } => {
                let plan_json = serde_json::to_value(plan)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                sqlx::query(
                    "UPDATE reward_epochs SET \
                        after_balance = $2, total_inflow = $3, reward_inflow = $4, \
                        treasury_inflow = $5, treasury_applied = TRUE, \
                        claim_completed_at = NOW(), claim_tx_signatures = $6, \
                        carry_in = $7, total_pot = $8, \
                        payout_plan = $9, payout_started_at = NOW(), total_paid = $8, \
                        status = 'paying', failure_reason = NULL, updated_at = NOW() \
                     WHERE epoch_id = $1",
                )
                .bind(epoch_id)
                .bind(to_db(claim.after_balance))
                .bind(to_db(claim.total_inflow))
                .bind(to_db(claim.reward_inflow))
                .bind(to_db(claim.treasury_inflow))
                .bind(&signatures)
                .bind(to_db(*carry_in))
                .bind(to_db(*total_pot))
                .bind(&plan_json)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                // Pot reserved for this epoch: carry must hit zero in the
                // same transaction as the paying transition.
                sqlx::query(
                    "UPDATE rewards_state SET \
                        carry_rewards_lamports = 0, \
                        treasury_accrued_lamports = treasury_accrued_lamports + $1, \
                        updated_at = NOW() \
                     WHERE id = 1",
                )
                .bind(treasury_delta)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(decision)
    }

    async fn record_payout_signature(&self, epoch_id: i64, signature: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE reward_epochs SET payout_tx_signature = $2, updated_at = NOW() \
             WHERE epoch_id = $1",
        )
        .bind(epoch_id)
        .bind(signature)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn finalize_epoch(
        &self,
        epoch_id: i64,
        signature: &str,
        winners: &[Winner],
        cursor: &PeriodCursor,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for winner in winners {
            sqlx::query(
                "INSERT INTO reward_winners \
                    (epoch_id, rank, wallet_address, user_id, profit_lamports, \
                     trade_count, payout_lamports) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(epoch_id)
            .bind(i16::from(winner.rank))
            .bind(&winner.wallet_address)
            .bind(&winner.user_id)
            .bind(to_db(winner.profit_lamports))
            .bind(to_db(winner.trade_count))
            .bind(to_db(winner.payout_lamports))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            "UPDATE reward_epochs SET \
                status = 'completed', payout_completed_at = NOW(), \
                payout_tx_signature = $2, total_paid = total_pot, \
                failure_reason = NULL, updated_at = NOW() \
             WHERE epoch_id = $1",
        )
        .bind(epoch_id)
        .bind(signature)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(ADVANCE_CURSOR_SQL)
            .bind(cursor.period_id)
            .bind(cursor.period_end)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn fail_epoch_restore_carry(
        &self,
        epoch_id: i64,
        reason: &str,
        total_pot: u64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "UPDATE reward_epochs SET status = 'failed', failure_reason = $2, \
             updated_at = NOW() WHERE epoch_id = $1",
        )
        .bind(epoch_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE rewards_state SET \
             carry_rewards_lamports = carry_rewards_lamports + $1, updated_at = NOW() \
             WHERE id = 1",
        )
        .bind(to_db(total_pot))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn fail_epoch(&self, epoch_id: i64, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE reward_epochs SET status = 'failed', failure_reason = $2, \
             updated_at = NOW() WHERE epoch_id = $1",
        )
        .bind(epoch_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn store_recovered_claim(&self, epoch_id: i64, claim: &ClaimRecord) -> StoreResult<()> {
        let signatures = serde_json::to_value(&claim.signatures)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "UPDATE reward_epochs SET \
                status = 'created', after_balance = $2, total_inflow = $3, \
                reward_inflow = $4, treasury_inflow = $5, \
                claim_completed_at = NOW(), claim_tx_signatures = $6, \
                updated_at = NOW() \
             WHERE epoch_id = $1 AND status = 'claiming'",
        )
        .bind(epoch_id)
        .bind(to_db(claim.after_balance))
        .bind(to_db(claim.total_inflow))
        .bind(to_db(claim.reward_inflow))
        .bind(to_db(claim.treasury_inflow))
        .bind(&signatures)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn advance_cursor(&self, cursor: &PeriodCursor) -> StoreResult<()> {
        sqlx::query(ADVANCE_CURSOR_SQL)
            .bind(cursor.period_id)
            .bind(cursor.period_end)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn stuck_epochs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Epoch>> {
        let rows = sqlx::query_as::<_, EpochRow>(
            "SELECT * FROM reward_epochs \
             WHERE status IN ('claiming', 'paying') AND updated_at < $1 \
             ORDER BY epoch_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Epoch::try_from).collect()
    }

    async fn recent_epochs(&self, limit: i64) -> StoreResult<Vec<(Epoch, Vec<Winner>)>> {
        let rows = sqlx::query_as::<_, EpochRow>(
            "SELECT * FROM reward_epochs ORDER BY epoch_id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let epochs: Vec<Epoch> = rows
            .into_iter()
            .map(Epoch::try_from)
            .collect::<Result<_, _>>()?;

        let ids: Vec<i64> = epochs.iter().map(|e| e.epoch_id).collect();
        let winner_rows = sqlx::query(
            "SELECT epoch_id, rank, wallet_address, user_id, profit_lamports, \
             trade_count, payout_lamports \
             FROM reward_winners WHERE epoch_id = ANY($1) ORDER BY epoch_id, rank",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut winners: Vec<Winner> = Vec::with_capacity(winner_rows.len());
        for row in winner_rows {
            winners.push(Winner {
                epoch_id: row.try_get(0).map_err(db_err)?,
                rank: row.try_get::<i16, _>(1).map_err(db_err)?.clamp(0, u8::MAX as i16) as u8,
                wallet_address: row.try_get(2).map_err(db_err)?,
                user_id: row.try_get(3).map_err(db_err)?,
                profit_lamports: lamports(row.try_get(4).map_err(db_err)?),
                trade_count: lamports(row.try_get(5).map_err(db_err)?),
                payout_lamports: lamports(row.try_get(6).map_err(db_err)?),
            });
        }

        Ok(epochs
            .into_iter()
            .map(|epoch| {
                let own: Vec<Winner> = winners
                    .iter()
                    .filter(|w| w.epoch_id == epoch.epoch_id)
                    .cloned()
                    .collect();
                (epoch, own)
            })
            .collect())
    }
}
