//! Serving-layer views: status, history, rules.
//!
//! The HTTP surface lives outside the core; these methods are what it calls.
//! Every 64-bit amount is rendered as a decimal string.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use podium_core::ports::StoreResult;
use podium_core::{Epoch, Winner};

use crate::pot::REWARD_SPLIT_PERCENT;
use crate::scheduler::Engine;

const HISTORY_DEFAULT_LIMIT: i64 = 20;
const HISTORY_MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub is_leader: bool,
    pub dry_run: bool,
    pub vault_address: Option<String>,
    pub vault_balance_lamports: Option<String>,
    pub carry_rewards_lamports: String,
    pub treasury_accrued_lamports: String,
    pub last_processed_period_id: Option<i64>,
    pub last_processed_period_end: Option<DateTime<Utc>>,
    pub active_period: Option<ActivePeriodStatus>,
    pub last_epoch: Option<EpochSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivePeriodStatus {
    pub period_id: i64,
    pub end_time: DateTime<Utc>,
    pub seconds_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch_id: i64,
    pub leaderboard_period_id: i64,
    pub status: String,
    pub total_pot: Option<String>,
    pub total_paid: Option<String>,
    pub payout_tx_signature: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochHistoryEntry {
    pub epoch_id: i64,
    pub leaderboard_period_id: i64,
    pub status: String,
    pub rewards_pool_bps: u16,
    pub total_inflow: Option<String>,
    pub reward_inflow: Option<String>,
    pub treasury_inflow: Option<String>,
    pub carry_in: Option<String>,
    pub total_pot: Option<String>,
    pub total_paid: Option<String>,
    pub payout_tx_signature: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub winners: Vec<WinnerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WinnerView {
    pub rank: u8,
    pub wallet_address: String,
    pub user_id: String,
    pub profit_lamports: String,
    pub trade_count: u64,
    pub payout_lamports: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesView {
    pub rewards_pool_bps: u16,
    pub split_percent: [u64; 3],
    pub min_trades: u32,
    pub min_profit_lamports: String,
    pub vault_reserve_lamports: String,
    pub dry_run: bool,
}

impl Engine {
    /// Current engine status. Balance and period lookups are best-effort;
    /// the accounting fields come straight from the state row.
    pub async fn status(&self) -> StoreResult<EngineStatus> {
        let inner = self.inner();
        let state = inner.store.load_state().await?;

        let (vault_address, vault_balance_lamports) = match &inner.gateway {
            Some(gateway) => {
                let balance = match gateway.vault_balance().await {
                    Ok(balance) => Some(balance.to_string()),
                    Err(e) => {
                        warn!(error = %e, "vault balance unavailable for status");
                        None
                    }
                };
                (Some(gateway.vault_address()), balance)
            }
            None => (None, None),
        };

        let active_period = inner.queries.active_period().await?.map(|period| {
            ActivePeriodStatus {
                period_id: period.id,
                end_time: period.end_time,
                seconds_remaining: (period.end_time - Utc::now()).num_seconds().max(0),
            }
        });

        let last_epoch = inner
            .store
            .recent_epochs(1)
            .await?
            .into_iter()
            .next()
            .map(|(epoch, _)| summarize(&epoch));

        Ok(EngineStatus {
            enabled: self.is_enabled(),
            is_leader: self.is_leader(),
            dry_run: inner.settings.dry_run,
            vault_address,
            vault_balance_lamports,
            carry_rewards_lamports: state.carry_rewards_lamports.to_string(),
            treasury_accrued_lamports: state.treasury_accrued_lamports.to_string(),
            last_processed_period_id: state.last_processed_period_id,
            last_processed_period_end: state.last_processed_period_end,
            active_period,
            last_epoch,
        })
    }

    /// Most recent epochs with winners, newest first. `limit` defaults to 20
    /// and is clamped to 1..=100.
    pub async fn history(&self, limit: Option<i64>) -> StoreResult<Vec<EpochHistoryEntry>> {
        let limit = limit
            .unwrap_or(HISTORY_DEFAULT_LIMIT)
            .clamp(1, HISTORY_MAX_LIMIT);
        let epochs = self.inner().store.recent_epochs(limit).await?;
        Ok(epochs
            .into_iter()
            .map(|(epoch, winners)| history_entry(&epoch, &winners))
            .collect())
    }

    /// Static snapshot of the settlement rules.
    pub fn rules(&self) -> RulesView {
        let settings = &self.inner().settings;
        RulesView {
            rewards_pool_bps: settings.rewards_pool_bps,
            split_percent: REWARD_SPLIT_PERCENT,
            min_trades: settings.min_trades,
            min_profit_lamports: "1".to_string(),
            vault_reserve_lamports: settings.vault_reserve_lamports.to_string(),
            dry_run: settings.dry_run,
        }
    }
}

fn amount(value: Option<u64>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn summarize(epoch: &Epoch) -> EpochSummary {
    EpochSummary {
        epoch_id: epoch.epoch_id,
        leaderboard_period_id: epoch.leaderboard_period_id,
        status: epoch.status.as_str().to_string(),
        total_pot: amount(epoch.total_pot),
        total_paid: amount(epoch.total_paid),
        payout_tx_signature: epoch.payout_tx_signature.clone(),
        failure_reason: epoch.failure_reason.clone(),
        updated_at: epoch.updated_at,
    }
}

fn history_entry(epoch: &Epoch, winners: &[Winner]) -> EpochHistoryEntry {
    let mut winners: Vec<WinnerView> = winners
        .iter()
        .map(|winner| WinnerView {
            rank: winner.rank,
            wallet_address: winner.wallet_address.clone(),
            user_id: winner.user_id.clone(),
            profit_lamports: winner.profit_lamports.to_string(),
            trade_count: winner.trade_count,
            payout_lamports: winner.payout_lamports.to_string(),
        })
        .collect();
    winners.sort_by_key(|w| w.rank);

    EpochHistoryEntry {
        epoch_id: epoch.epoch_id,
        leaderboard_period_id: epoch.leaderboard_period_id,
        status: epoch.status.as_str().to_string(),
        rewards_pool_bps: epoch.rewards_pool_bps,
        total_inflow: amount(epoch.total_inflow),
        reward_inflow: amount(epoch.reward_inflow),
        treasury_inflow: amount(epoch.treasury_inflow),
        carry_in: amount(epoch.carry_in),
        total_pot: amount(epoch.total_pot),
        total_paid: amount(epoch.total_paid),
        payout_tx_signature: epoch.payout_tx_signature.clone(),
        failure_reason: epoch.failure_reason.clone(),
        created_at: epoch.created_at,
        updated_at: epoch.updated_at,
        winners,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_core::{Epoch, EpochStatus, Winner};

    fn completed_epoch() -> Epoch {
        let now = Utc::now();
        Epoch {
            epoch_id: 9,
            leaderboard_period_id: 4,
            rewards_pool_bps: 5_000,
            before_balance: Some(1_000_000_000),
            after_balance: Some(1_200_000_000),
            total_inflow: Some(200_000_000),
            reward_inflow: Some(100_000_000),
            treasury_inflow: Some(100_000_000),
            treasury_applied: true,
            claim_started_at: Some(now),
            claim_completed_at: Some(now),
            claim_tx_signatures: vec!["CLAIMSIG".to_string()],
            carry_in: Some(0),
            total_pot: Some(u64::MAX),
            payout_plan: Vec::new(),
            payout_started_at: Some(now),
            payout_completed_at: Some(now),
            payout_tx_signature: Some("SIG".to_string()),
            total_paid: Some(u64::MAX),
            status: EpochStatus::Completed,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_summary_amounts_serialize_as_strings() {
        let json = serde_json::to_value(summarize(&completed_epoch())).unwrap();
        assert!(json["total_pot"].is_string());
        assert_eq!(json["total_pot"], "18446744073709551615");
        assert_eq!(json["total_paid"], "18446744073709551615");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["payout_tx_signature"], "SIG");
    }

    #[test]
    fn test_history_entry_amounts_are_strings_and_winners_sorted() {
        // A payout above 2^53 - 1 must survive JSON as a decimal string.
        let big = (1u64 << 53) + 7;
        let winner = |rank: u8| Winner {
            epoch_id: 9,
            rank,
            wallet_address: format!("wallet-{rank}"),
            user_id: format!("user-{rank}"),
            profit_lamports: big,
            trade_count: 4,
            payout_lamports: big,
        };
        let entry = history_entry(&completed_epoch(), &[winner(3), winner(1), winner(2)]);

        let ranks: Vec<u8> = entry.winners.iter().map(|w| w.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["winners"][0]["payout_lamports"].is_string());
        assert_eq!(json["winners"][0]["payout_lamports"], "9007199254740999");
        assert_eq!(json["winners"][0]["profit_lamports"], "9007199254740999");
        assert_eq!(json["reward_inflow"], "100000000");
        assert_eq!(json["carry_in"], "0");
    }

    #[test]
    fn test_history_entry_leaves_absent_amounts_null() {
        let mut epoch = completed_epoch();
        epoch.status = EpochStatus::Created;
        epoch.total_pot = None;
        epoch.total_paid = None;
        let json = serde_json::to_value(history_entry(&epoch, &[])).unwrap();
        assert!(json["total_pot"].is_null());
        assert!(json["total_paid"].is_null());
        assert_eq!(json["status"], "created");
    }

    #[test]
    fn test_rules_view_serializes_split_and_string_amounts() {
        let rules = RulesView {
            rewards_pool_bps: 5_000,
            split_percent: REWARD_SPLIT_PERCENT,
            min_trades: 3,
            min_profit_lamports: "1".to_string(),
            vault_reserve_lamports: "50000000".to_string(),
            dry_run: false,
        };
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json["split_percent"], serde_json::json!([50, 30, 20]));
        assert!(json["vault_reserve_lamports"].is_string());
        assert_eq!(json["min_profit_lamports"], "1");
    }
}
