//! Schema bootstrap for the engine-owned tables.
//!
//! The leaderboard, trade, and user tables belong to the platform and are
//! consumed read-only; only the three settlement tables are created here.

use sqlx::PgPool;
use tracing::debug;

use podium_core::ports::StoreResult;

use crate::db_err;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rewards_state (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        carry_rewards_lamports BIGINT NOT NULL DEFAULT 0,
        treasury_accrued_lamports BIGINT NOT NULL DEFAULT 0,
        last_processed_period_id BIGINT,
        last_processed_period_end TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    INSERT INTO rewards_state (id) VALUES (1) ON CONFLICT (id) DO NOTHING
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reward_epochs (
        epoch_id BIGSERIAL PRIMARY KEY,
        leaderboard_period_id BIGINT NOT NULL UNIQUE,
        rewards_pool_bps INTEGER NOT NULL,
        before_balance BIGINT,
        after_balance BIGINT,
        total_inflow BIGINT,
        reward_inflow BIGINT,
        treasury_inflow BIGINT,
        treasury_applied BOOLEAN NOT NULL DEFAULT FALSE,
        claim_started_at TIMESTAMPTZ,
        claim_completed_at TIMESTAMPTZ,
        claim_tx_signatures JSONB NOT NULL DEFAULT '[]'::jsonb,
        carry_in BIGINT,
        total_pot BIGINT,
        payout_plan JSONB NOT NULL DEFAULT '[]'::jsonb,
        payout_started_at TIMESTAMPTZ,
        payout_completed_at TIMESTAMPTZ,
        payout_tx_signature TEXT,
        total_paid BIGINT,
        status TEXT NOT NULL DEFAULT 'created',
        failure_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_reward_epochs_status
        ON reward_epochs (status, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reward_winners (
        epoch_id BIGINT NOT NULL REFERENCES reward_epochs (epoch_id),
        rank SMALLINT NOT NULL,
        wallet_address TEXT NOT NULL,
        user_id TEXT NOT NULL,
        profit_lamports BIGINT NOT NULL,
        trade_count BIGINT NOT NULL,
        payout_lamports BIGINT NOT NULL,
        PRIMARY KEY (epoch_id, rank),
        UNIQUE (epoch_id, wallet_address)
    )
    "#,
];

/// Create the settlement tables and seed the singleton state row.
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await.map_err(db_err)?;
    }
    debug!("settlement schema ready");
    Ok(())
}
