//! Settlement state machine.
//!
//! Drives one epoch per tick through claim -> decide -> pay -> finalize,
//! bounding every phase with a durable state write. The decide transaction
//! zeroes the carry atomically with the `paying` transition; recovery either
//! confirms a transfer that already landed or restores the pot to carry, so
//! a pot can never be paid twice or silently lost.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use podium_core::ports::StoreResult;
use podium_core::{
    ClaimRecord, Decision, Epoch, EpochStatus, LeaderboardPeriod, PayoutPlanEntry, PeriodCursor,
    QueryPort, SkipReason, StateStore, StoreError, Winner, DRY_RUN_SIGNATURE,
};
use podium_gateway::LedgerGateway;

use crate::pot::{build_payout_plan, compose_pot, split_inflow};

/// Upper bound on a non-terminal epoch's age before recovery intervenes.
pub const STUCK_TIMEOUT_MINUTES: i64 = 15;

/// Fixed payout fan-out: exactly three winners or none.
pub const PAYOUT_COUNT: usize = 3;

/// Snapshot of the settings the settler needs per tick.
#[derive(Debug, Clone)]
pub struct SettlerConfig {
    pub rewards_pool_bps: u16,
    pub min_trades: u32,
    pub vault_reserve_lamports: u64,
    pub dry_run: bool,
}

/// Outcome of one tick, for logging and the manual-trigger response.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Stuck epochs the recovery sweep touched.
    pub recovered: usize,
    /// Period settled this tick and the status it reached.
    pub processed: Option<(i64, EpochStatus)>,
}

pub struct Settler {
    config: SettlerConfig,
    store: Arc<dyn StateStore>,
    queries: Arc<dyn QueryPort>,
    gateway: Arc<dyn LedgerGateway>,
}

impl Settler {
    pub fn new(
        config: SettlerConfig,
        store: Arc<dyn StateStore>,
        queries: Arc<dyn QueryPort>,
        gateway: Arc<dyn LedgerGateway>,
    ) -> Self {
        Self {
            config,
            store,
            queries,
            gateway,
        }
    }

    /// One settlement pass: recovery sweep, then at most one period.
    ///
    /// Gateway failures are absorbed here (the epoch stays in its durable
    /// state for recovery); only store failures propagate, and the caller
    /// treats those as catastrophic.
    pub async fn tick(&self) -> StoreResult<TickReport> {
        let recovered = self.recover_stuck().await?;

        let state = self.store.load_state().await?;
        let Some(period) = self
            .queries
            .next_period_to_process(state.last_processed_period_end)
            .await?
        else {
            debug!("no ended leaderboard period awaiting settlement");
            return Ok(TickReport {
                recovered,
                processed: None,
            });
        };

        info!(
            period_id = period.id,
            period_end = %period.end_time,
            "settling leaderboard period"
        );
        let status = self.settle_period(&period).await?;
        Ok(TickReport {
            recovered,
            processed: status.map(|s| (period.id, s)),
        })
    }

    async fn settle_period(&self, period: &LeaderboardPeriod) -> StoreResult<Option<EpochStatus>> {
        let cursor = PeriodCursor {
            period_id: period.id,
            period_end: period.end_time,
        };

        // A. Resolve the epoch for this period, outside any RPC call.
        let mut epoch = match self.store.epoch_by_period(period.id).await? {
            Some(epoch) => epoch,
            None => {
                self.store
                    .create_epoch(period.id, self.config.rewards_pool_bps)
                    .await?
            }
        };

        match epoch.status {
            EpochStatus::Completed | EpochStatus::Skipped => {
                self.store.advance_cursor(&cursor).await?;
                return Ok(Some(epoch.status));
            }
            EpochStatus::Claiming | EpochStatus::Paying => {
                debug!(
                    epoch_id = epoch.epoch_id,
                    status = epoch.status.as_str(),
                    "epoch in flight, left to recovery"
                );
                return Ok(None);
            }
            EpochStatus::Failed => {
                info!(epoch_id = epoch.epoch_id, "retrying failed epoch");
                self.store.reset_epoch_for_retry(epoch.epoch_id).await?;
                epoch = self
                    .store
                    .epoch_by_id(epoch.epoch_id)
                    .await?
                    .ok_or(StoreError::EpochNotFound(epoch.epoch_id))?;
            }
            EpochStatus::Created => {}
        }

        // B. Claim.
        let Some(claim) = self.claim_phase(&epoch).await? else {
            return Ok(None);
        };

        // C/D/E. Decide, pay, finalize.
        self.decide_and_pay(&epoch, period, &cursor, claim).await
    }

    /// Claim accrued fees and measure the balance delta. Returns `None` on a
    /// transient gateway failure; whatever was durably written stays for the
    /// recovery sweep.
    async fn claim_phase(&self, epoch: &Epoch) -> StoreResult<Option<ClaimRecord>> {
        // A recovered epoch already carries a measured claim window; decide
        // must run with it rather than re-claiming.
        if epoch.claim_window_recorded() {
            debug!(
                epoch_id = epoch.epoch_id,
                "claim window already recorded, going straight to decide"
            );
            return Ok(Some(ClaimRecord {
                before_balance: epoch.before_balance.unwrap_or_default(),
                after_balance: epoch.after_balance.unwrap_or_default(),
                total_inflow: epoch.total_inflow.unwrap_or_default(),
                reward_inflow: epoch.reward_inflow.unwrap_or_default(),
                treasury_inflow: epoch.treasury_inflow.unwrap_or_default(),
                signatures: epoch.claim_tx_signatures.clone(),
            }));
        }

        let before_balance = match self.gateway.vault_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(epoch_id = epoch.epoch_id, error = %e, "balance read failed before claim");
                return Ok(None);
            }
        };
        self.store
            .begin_claim(epoch.epoch_id, before_balance)
            .await?;

        let signatures = match self.gateway.claim_fees().await {
            Ok(signatures) => signatures,
            // A permanent rejection will not heal with time; fail the epoch
            // now rather than cycling through the stuck sweep. Nothing has
            // been deducted, so carry is unaffected.
            Err(e) if e.is_permanent() => {
                warn!(
                    epoch_id = epoch.epoch_id,
                    error = %e,
                    "fee claim rejected permanently, failing epoch"
                );
                self.store
                    .fail_epoch(epoch.epoch_id, &format!("claim_failed: {e}"))
                    .await?;
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    epoch_id = epoch.epoch_id,
                    error = %e,
                    "fee claim failed, epoch left claiming for recovery"
                );
                return Ok(None);
            }
        };

        let after_balance = match self.gateway.vault_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(
                    epoch_id = epoch.epoch_id,
                    error = %e,
                    "balance read failed after claim, epoch left claiming for recovery"
                );
                return Ok(None);
            }
        };

        let total_inflow = after_balance.saturating_sub(before_balance);
        let (reward_inflow, treasury_inflow) =
            split_inflow(total_inflow, epoch.rewards_pool_bps);
        info!(
            epoch_id = epoch.epoch_id,
            total_inflow,
            reward_inflow,
            treasury_inflow,
            claims = signatures.len(),
            "claim window measured"
        );

        Ok(Some(ClaimRecord {
            before_balance,
            after_balance,
            total_inflow,
            reward_inflow,
            treasury_inflow,
            signatures,
        }))
    }

    async fn decide_and_pay(
        &self,
        epoch: &Epoch,
        period: &LeaderboardPeriod,
        cursor: &PeriodCursor,
        claim: ClaimRecord,
    ) -> StoreResult<Option<EpochStatus>> {
        let top = self
            .queries
            .top_wallets_for_period(
                period.start_time,
                period.end_time,
                self.config.min_trades,
                PAYOUT_COUNT as i64,
            )
            .await?;

        let reserve = self.config.vault_reserve_lamports;
        let payout_fee = self.gateway.estimate_payout_fee(PAYOUT_COUNT);
        let after_balance = claim.after_balance;
        let reward_inflow = claim.reward_inflow;

        let decision = self
            .store
            .decide(epoch.epoch_id, &claim, cursor, &|carry| {
                let total_pot = compose_pot(carry, reward_inflow);
                if top.len() < PAYOUT_COUNT {
                    return Decision::skip(
                        SkipReason::InsufficientEligibleWallets,
                        carry,
                        total_pot,
                    );
                }
                if total_pot == 0 {
                    // A zero plan would never pass payout validation and
                    // would pin the cursor on this period forever.
                    return Decision::skip(SkipReason::EmptyPot, carry, total_pot);
                }
                let min_required = total_pot.saturating_add(reserve).saturating_add(payout_fee);
                if after_balance < min_required {
                    return Decision::skip(
                        SkipReason::InsufficientVaultBalance,
                        carry,
                        total_pot,
                    );
                }
                match build_payout_plan(total_pot, &top) {
                    Some(plan) => Decision::Pay {
                        carry_in: carry,
                        total_pot,
                        plan: plan.to_vec(),
                    },
                    None => Decision::skip(
                        SkipReason::InsufficientEligibleWallets,
                        carry,
                        total_pot,
                    ),
                }
            })
            .await?;

        match decision {
            Decision::Skip {
                reason, total_pot, ..
            } => {
                info!(
                    epoch_id = epoch.epoch_id,
                    reason = reason.as_str(),
                    total_pot,
                    "epoch skipped, pot carried forward"
                );
                Ok(Some(EpochStatus::Skipped))
            }
            Decision::Pay {
                total_pot, plan, ..
            } => {
                let status = self
                    .payout_phase(epoch.epoch_id, cursor, total_pot, &plan)
                    .await?;
                Ok(Some(status))
            }
        }
    }

    /// D. Send the batch transfer and finalize. The pot is already reserved
    /// (carry is zero), so any send failure must restore it in the same
    /// breath as the `failed` transition.
    async fn payout_phase(
        &self,
        epoch_id: i64,
        cursor: &PeriodCursor,
        total_pot: u64,
        plan: &[PayoutPlanEntry],
    ) -> StoreResult<EpochStatus> {
        let signature = if self.config.dry_run {
            info!(epoch_id, total_pot, "dry run, skipping on-chain payout");
            DRY_RUN_SIGNATURE.to_string()
        } else {
            match self.gateway.send_payout(plan).await {
                Ok(signature) => {
                    // Durable before finalize: recovery keys off this column.
                    self.store
                        .record_payout_signature(epoch_id, &signature)
                        .await?;
                    signature
                }
                Err(e) => {
                    // Pre-validation rejects never reach the chain; a
                    // transient send failure might have, which is why
                    // recovery verifies before any resend.
                    let reason = if e.is_permanent() {
                        format!("payout_rejected: {e}")
                    } else {
                        format!("payout_failed: {e}")
                    };
                    warn!(
                        epoch_id,
                        error = %e,
                        permanent = e.is_permanent(),
                        total_pot,
                        "payout failed, restoring pot to carry"
                    );
                    self.store
                        .fail_epoch_restore_carry(epoch_id, &reason, total_pot)
                        .await?;
                    return Ok(EpochStatus::Failed);
                }
            }
        };

        self.finalize(epoch_id, cursor, &signature, plan).await?;
        Ok(EpochStatus::Completed)
    }

    /// E. Terminal success: winners, completed status, cursor — one
    /// transaction in the store.
    async fn finalize(
        &self,
        epoch_id: i64,
        cursor: &PeriodCursor,
        signature: &str,
        plan: &[PayoutPlanEntry],
    ) -> StoreResult<()> {
        let winners: Vec<Winner> = plan
            .iter()
            .map(|entry| Winner {
                epoch_id,
                rank: entry.rank,
                wallet_address: entry.wallet.clone(),
                user_id: entry.user_id.clone(),
                profit_lamports: entry.profit_lamports,
                trade_count: entry.trade_count,
                payout_lamports: entry.amount_lamports,
            })
            .collect();
        self.store
            .finalize_epoch(epoch_id, signature, &winners, cursor)
            .await?;
        info!(epoch_id, signature, "epoch completed");
        Ok(())
    }

    /// F. Recovery sweep: resolve epochs stuck mid-phase longer than the
    /// timeout. Runs before normal processing on every tick.
    pub async fn recover_stuck(&self) -> StoreResult<usize> {
        let cutoff = Utc::now() - Duration::minutes(STUCK_TIMEOUT_MINUTES);
        let stuck = self.store.stuck_epochs(cutoff).await?;
        for epoch in &stuck {
            warn!(
                epoch_id = epoch.epoch_id,
                status = epoch.status.as_str(),
                "recovering stuck epoch"
            );
            match epoch.status {
                EpochStatus::Claiming => self.recover_claiming(epoch).await?,
                EpochStatus::Paying => self.recover_paying(epoch).await?,
                _ => {}
            }
        }
        Ok(stuck.len())
    }

    /// A claim window that never closed: recompute the inflow from the
    /// recorded pre-claim balance and reset the epoch so the next pass runs
    /// decide with it. Nothing was deducted yet, so carry is untouched.
    async fn recover_claiming(&self, epoch: &Epoch) -> StoreResult<()> {
        let Some(before_balance) = epoch.before_balance else {
            self.store
                .fail_epoch(epoch.epoch_id, "stuck_in_claiming_no_before_balance")
                .await?;
            return Ok(());
        };

        let after_balance = match self.gateway.vault_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(
                    epoch_id = epoch.epoch_id,
                    error = %e,
                    "balance read failed during claim recovery, will retry"
                );
                return Ok(());
            }
        };

        let total_inflow = after_balance.saturating_sub(before_balance);
        let (reward_inflow, treasury_inflow) =
            split_inflow(total_inflow, epoch.rewards_pool_bps);
        self.store
            .store_recovered_claim(
                epoch.epoch_id,
                &ClaimRecord {
                    before_balance,
                    after_balance,
                    total_inflow,
                    reward_inflow,
                    treasury_inflow,
                    signatures: epoch.claim_tx_signatures.clone(),
                },
            )
            .await?;
        info!(
            epoch_id = epoch.epoch_id,
            total_inflow, "stuck claim window recomputed, epoch reset for decide"
        );
        Ok(())
    }

    /// A payout that may or may not have landed. Verify before any retry:
    /// a resend uses a fresh blockhash and would double-pay if the original
    /// transfer confirmed.
    async fn recover_paying(&self, epoch: &Epoch) -> StoreResult<()> {
        let total_pot = epoch.total_pot.unwrap_or_default();

        if let Some(signature) = &epoch.payout_tx_signature {
            match self.gateway.verify_transaction(signature).await {
                Ok(true) => {
                    info!(
                        epoch_id = epoch.epoch_id,
                        signature = %signature,
                        "stuck payout already confirmed, finalizing"
                    );
                    let Some(cursor) = self.cursor_for(epoch.leaderboard_period_id).await? else {
                        warn!(
                            epoch_id = epoch.epoch_id,
                            "leaderboard period missing, cannot finalize"
                        );
                        return Ok(());
                    };
                    self.finalize(epoch.epoch_id, &cursor, signature, &epoch.payout_plan)
                        .await?;
                    return Ok(());
                }
                Ok(false) => {
                    debug!(
                        epoch_id = epoch.epoch_id,
                        signature = %signature,
                        "recorded payout signature never confirmed"
                    );
                }
                Err(e) => {
                    warn!(
                        epoch_id = epoch.epoch_id,
                        error = %e,
                        "cannot verify stuck payout, leaving epoch for the next sweep"
                    );
                    return Ok(());
                }
            }
        }

        if epoch.payout_plan.len() == PAYOUT_COUNT {
            let Some(cursor) = self.cursor_for(epoch.leaderboard_period_id).await? else {
                warn!(
                    epoch_id = epoch.epoch_id,
                    "leaderboard period missing, cannot re-enter payout"
                );
                return Ok(());
            };
            info!(epoch_id = epoch.epoch_id, "re-entering payout for stuck epoch");
            self.payout_phase(epoch.epoch_id, &cursor, total_pot, &epoch.payout_plan)
                .await?;
        } else {
            self.store
                .fail_epoch_restore_carry(epoch.epoch_id, "stuck_in_paying_no_plan", total_pot)
                .await?;
        }
        Ok(())
    }

    async fn cursor_for(&self, period_id: i64) -> StoreResult<Option<PeriodCursor>> {
        Ok(self
            .queries
            .period_by_id(period_id)
            .await?
            .map(|period| PeriodCursor {
                period_id: period.id,
                period_end: period.end_time,
            }))
    }
}
