//! Pot accounting: inflow split, pot composition, payout-plan construction.
//!
//! All pure. Amounts are lamports; splits use integer floor division with
//! the remainder pushed to the last rank so nothing is ever lost to dust.

use podium_core::{PayoutPlanEntry, TopWallet, BPS_DENOMINATOR};

/// Payout split across ranks 1..=3, in percent. Compile-time constant of the
/// engine; changing the split is a code change.
pub const REWARD_SPLIT_PERCENT: [u64; 3] = [50, 30, 20];

/// Split claimed inflow into `(reward_inflow, treasury_inflow)`.
///
/// `reward = floor(total * bps / 10_000)`, treasury takes the rest.
pub fn split_inflow(total_inflow: u64, pool_bps: u16) -> (u64, u64) {
    let bps = u64::from(pool_bps).min(BPS_DENOMINATOR);
    let reward = ((total_inflow as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64;
    (reward, total_inflow - reward)
}

/// The pot for one epoch: undistributed carry plus this epoch's reward share.
pub fn compose_pot(carry_in: u64, reward_inflow: u64) -> u64 {
    carry_in.saturating_add(reward_inflow)
}

/// Build the ordered three-entry payout plan for a pot.
///
/// Ranks 1 and 2 take their floor shares; rank 3 takes the remainder, so the
/// three amounts always sum to `total_pot` exactly. Returns `None` when
/// fewer than three wallets are supplied.
pub fn build_payout_plan(total_pot: u64, top: &[TopWallet]) -> Option<[PayoutPlanEntry; 3]> {
    if top.len() < 3 {
        return None;
    }
    let first = percent_of(total_pot, REWARD_SPLIT_PERCENT[0]);
    let second = percent_of(total_pot, REWARD_SPLIT_PERCENT[1]);
    let third = total_pot - first - second;

    let entry = |rank: u8, wallet: &TopWallet, amount: u64| PayoutPlanEntry {
        rank,
        wallet: wallet.wallet_address.clone(),
        amount_lamports: amount,
        user_id: wallet.user_id.clone(),
        profit_lamports: wallet.profit_lamports,
        trade_count: wallet.trade_count,
    };

    Some([
        entry(1, &top[0], first),
        entry(2, &top[1], second),
        entry(3, &top[2], third),
    ])
}

fn percent_of(value: u64, percent: u64) -> u64 {
    ((value as u128 * percent as u128) / 100) as u64
}
