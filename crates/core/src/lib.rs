//! Podium Core
//!
//! Shared domain types and port traits for the Podium rewards-settlement
//! engine: rewards state, settlement epochs, winners, payout plans, and the
//! seams the engine drives (state store, query port, leader lock).

pub mod ports;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use ports::{LeaderLock, QueryPort, StateStore, StoreError};

/// Basis points denominator (10_000 BPS = 100%).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Sentinel payout signature written when on-chain transfers are disabled.
pub const DRY_RUN_SIGNATURE: &str = "DRY_RUN_NO_TX";

/// Durable status of one settlement epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochStatus {
    Created,
    Claiming,
    Paying,
    Completed,
    Skipped,
    Failed,
}

impl EpochStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Claiming => "claiming",
            Self::Paying => "paying",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "claiming" => Some(Self::Claiming),
            "paying" => Some(Self::Paying),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states never transition again on the normal path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

/// Process-wide rewards accounting singleton (one row, fixed identity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsState {
    /// Undistributed rewards accumulated from skipped/failed past periods.
    pub carry_rewards_lamports: u64,
    /// Cumulative treasury share. Monotonically non-decreasing.
    pub treasury_accrued_lamports: u64,
    pub last_processed_period_id: Option<i64>,
    pub last_processed_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One settlement cycle, 1:1 with a leaderboard period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub epoch_id: i64,
    pub leaderboard_period_id: i64,
    /// Rewards share of claimed fees, snapshotted at epoch creation.
    pub rewards_pool_bps: u16,
    pub before_balance: Option<u64>,
    pub after_balance: Option<u64>,
    pub total_inflow: Option<u64>,
    pub reward_inflow: Option<u64>,
    pub treasury_inflow: Option<u64>,
    /// Whether this epoch's treasury share has been added to the singleton.
    /// Cleared whenever the claim window is cleared for a retry.
    pub treasury_applied: bool,
    pub claim_started_at: Option<DateTime<Utc>>,
    pub claim_completed_at: Option<DateTime<Utc>>,
    pub claim_tx_signatures: Vec<String>,
    pub carry_in: Option<u64>,
    pub total_pot: Option<u64>,
    /// Empty until the decide phase commits a `paying` transition.
    pub payout_plan: Vec<PayoutPlanEntry>,
    pub payout_started_at: Option<DateTime<Utc>>,
    pub payout_completed_at: Option<DateTime<Utc>>,
    pub payout_tx_signature: Option<String>,
    pub total_paid: Option<u64>,
    pub status: EpochStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Epoch {
    /// A completed claim window means the inflow split is already recorded
    /// and the claim phase must not run its RPC sequence again.
    pub fn claim_window_recorded(&self) -> bool {
        self.claim_completed_at.is_some()
            && self.before_balance.is_some()
            && self.after_balance.is_some()
            && self.total_inflow.is_some()
    }
}

/// Per-epoch, per-rank winner row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub epoch_id: i64,
    pub rank: u8,
    pub wallet_address: String,
    pub user_id: String,
    #[serde(with = "lamports_string")]
    pub profit_lamports: u64,
    pub trade_count: u64,
    #[serde(with = "lamports_string")]
    pub payout_lamports: u64,
}

/// One entry of an epoch's ordered three-entry payout plan.
///
/// Amounts serialize as decimal strings so 64-bit values survive JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPlanEntry {
    pub rank: u8,
    pub wallet: String,
    #[serde(with = "lamports_string")]
    pub amount_lamports: u64,
    pub user_id: String,
    #[serde(with = "lamports_string")]
    pub profit_lamports: u64,
    pub trade_count: u64,
}

/// Aggregated trading result for one wallet over a leaderboard window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopWallet {
    pub wallet_address: String,
    pub user_id: String,
    pub profit_lamports: u64,
    pub trade_count: u64,
}

/// An externally defined leaderboard period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardPeriod {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Cursor identifying the most recent period settled to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodCursor {
    pub period_id: i64,
    pub period_end: DateTime<Utc>,
}

/// Completed claim-phase bookkeeping, handed to the decide transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub before_balance: u64,
    pub after_balance: u64,
    pub total_inflow: u64,
    pub reward_inflow: u64,
    pub treasury_inflow: u64,
    pub signatures: Vec<String>,
}

/// Why an epoch was settled without a payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InsufficientEligibleWallets,
    InsufficientVaultBalance,
    EmptyPot,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientEligibleWallets => "insufficient_eligible_wallets",
            Self::InsufficientVaultBalance => "insufficient_vault_balance",
            Self::EmptyPot => "empty_pot",
        }
    }
}

/// Outcome of the decide phase, committed atomically with the carry update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Return the pot to carry and advance the cursor.
    Skip {
        reason: SkipReason,
        carry_in: u64,
        total_pot: u64,
    },
    /// Zero out carry and reserve the pot for this epoch's payout.
    Pay {
        carry_in: u64,
        total_pot: u64,
        plan: Vec<PayoutPlanEntry>,
    },
}

impl Decision {
    pub fn skip(reason: SkipReason, carry_in: u64, total_pot: u64) -> Self {
        Self::Skip {
            reason,
            carry_in,
            total_pot,
        }
    }

    pub fn total_pot(&self) -> u64 {
        match self {
            Self::Skip { total_pot, .. } | Self::Pay { total_pot, .. } => *total_pot,
        }
    }
}

/// Check a string against the chain address syntax: base58 character class,
/// length 32 to 44, decoding to a 32-byte key.
pub fn is_valid_wallet_address(address: &str) -> bool {
    if address.len() < 32 || address.len() > 44 {
        return false;
    }
    match bs58::decode(address).into_vec() {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

/// Serialize `u64` lamport amounts as decimal strings inside JSON.
///
/// The physical schema stores amounts as 64-bit integers, but anything that
/// crosses a JSON boundary uses strings for wire safety. Deserialization
/// accepts either form.
pub mod lamports_string {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct LamportsVisitor;

        impl<'de> Visitor<'de> for LamportsVisitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a u64 or a decimal string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.parse::<u64>().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }
        }

        deserializer.deserialize_any(LamportsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            EpochStatus::Created,
            EpochStatus::Claiming,
            EpochStatus::Paying,
            EpochStatus::Completed,
            EpochStatus::Skipped,
            EpochStatus::Failed,
        ] {
            assert_eq!(EpochStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EpochStatus::parse("unknown"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(EpochStatus::Completed.is_terminal());
        assert!(EpochStatus::Skipped.is_terminal());
        assert!(EpochStatus::Failed.is_terminal());
        assert!(!EpochStatus::Created.is_terminal());
        assert!(!EpochStatus::Claiming.is_terminal());
        assert!(!EpochStatus::Paying.is_terminal());
    }

    #[test]
    fn test_wallet_address_syntax() {
        // System program address: valid base58, 32 bytes.
        assert!(is_valid_wallet_address("11111111111111111111111111111111"));
        assert!(is_valid_wallet_address(
            "So11111111111111111111111111111111111111112"
        ));
        // Too short.
        assert!(!is_valid_wallet_address("abc"));
        // Base58 alphabet excludes 0, O, I, l.
        assert!(!is_valid_wallet_address("0O1l111111111111111111111111111111"));
        assert!(!is_valid_wallet_address(""));
    }

    #[test]
    fn test_plan_entry_amounts_serialize_as_strings() {
        let entry = PayoutPlanEntry {
            rank: 1,
            wallet: "So11111111111111111111111111111111111111112".to_string(),
            amount_lamports: u64::MAX,
            user_id: "user-1".to_string(),
            profit_lamports: 12_345,
            trade_count: 4,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["amount_lamports"], "18446744073709551615");
        assert_eq!(json["profit_lamports"], "12345");

        let back: PayoutPlanEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_plan_entry_accepts_numeric_amounts() {
        let json = serde_json::json!({
            "rank": 2,
            "wallet": "So11111111111111111111111111111111111111112",
            "amount_lamports": 30_000_000u64,
            "user_id": "user-2",
            "profit_lamports": "5",
            "trade_count": 3,
        });
        let entry: PayoutPlanEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.amount_lamports, 30_000_000);
        assert_eq!(entry.profit_lamports, 5);
    }
}
