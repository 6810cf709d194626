//! Read-only queries against the platform's leaderboard and trade tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use podium_core::ports::StoreResult;
use podium_core::{LeaderboardPeriod, QueryPort, TopWallet};

use crate::{db_err, lamports};

/// Base58 character class, 32 to 44 characters. Keeps malformed wallet rows
/// out of the ranking before the limit is applied.
const WALLET_SYNTAX: &str = "^[1-9A-HJ-NP-Za-km-z]{32,44}$";

pub struct PgQueryPort {
    pool: PgPool,
}

impl PgQueryPort {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct PeriodRow {
    id: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl From<PeriodRow> for LeaderboardPeriod {
    fn from(row: PeriodRow) -> Self {
        Self {
            id: row.id,
            start_time: row.start_time,
            end_time: row.end_time,
        }
    }
}

#[derive(FromRow)]
struct TopWalletRow {
    wallet_address: String,
    user_id: String,
    profit_lamports: i64,
    trade_count: i64,
}

#[async_trait]
impl QueryPort for PgQueryPort {
    async fn next_period_to_process(
        &self,
        last_end: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<LeaderboardPeriod>> {
        let row = match last_end {
            Some(last_end) => {
                sqlx::query_as::<_, PeriodRow>(
                    "SELECT id, start_time, end_time FROM leaderboard_periods \
                     WHERE end_time <= NOW() AND end_time > $1 \
                     ORDER BY end_time ASC, id ASC LIMIT 1",
                )
                .bind(last_end)
                .fetch_optional(&self.pool)
                .await
            }
            // First run: settle only the most recently ended period.
            None => {
                sqlx::query_as::<_, PeriodRow>(
                    "SELECT id, start_time, end_time FROM leaderboard_periods \
                     WHERE end_time <= NOW() \
                     ORDER BY end_time DESC, id DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        Ok(row.map(LeaderboardPeriod::from))
    }

    async fn period_by_id(&self, period_id: i64) -> StoreResult<Option<LeaderboardPeriod>> {
        let row = sqlx::query_as::<_, PeriodRow>(
            "SELECT id, start_time, end_time FROM leaderboard_periods WHERE id = $1",
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(LeaderboardPeriod::from))
    }

    async fn top_wallets_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        min_trades: u32,
        limit: i64,
    ) -> StoreResult<Vec<TopWallet>> {
        let rows = sqlx::query_as::<_, TopWalletRow>(
            "SELECT wallet_address, \
                    MAX(user_id) AS user_id, \
                    SUM(realized_profit_lamports)::BIGINT AS profit_lamports, \
                    COUNT(*)::BIGINT AS trade_count \
             FROM trades \
             WHERE closed_at >= $1 AND closed_at < $2 AND wallet_address ~ $3 \
             GROUP BY wallet_address \
             HAVING COUNT(*) >= $4 AND SUM(realized_profit_lamports) > 0 \
             ORDER BY profit_lamports DESC, trade_count DESC, wallet_address ASC \
             LIMIT $5",
        )
        .bind(start)
        .bind(end)
        .bind(WALLET_SYNTAX)
        .bind(i64::from(min_trades))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| TopWallet {
                wallet_address: row.wallet_address,
                user_id: row.user_id,
                profit_lamports: lamports(row.profit_lamports),
                trade_count: lamports(row.trade_count),
            })
            .collect())
    }

    async fn active_period(&self) -> StoreResult<Option<LeaderboardPeriod>> {
        let row = sqlx::query_as::<_, PeriodRow>(
            "SELECT id, start_time, end_time FROM leaderboard_periods \
             WHERE start_time <= NOW() AND end_time > NOW() \
             ORDER BY end_time ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(LeaderboardPeriod::from))
    }
}
