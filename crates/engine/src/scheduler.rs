//! Leader election and tick scheduling.
//!
//! Two cooperative loops share a shutdown signal: a heartbeat loop that
//! holds (or chases) the advisory lock, and a tick loop that runs the
//! settler while leader. A single-flight guard keeps ticks from overlapping
//! within the process; the lock keeps processes from overlapping across the
//! cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use podium_core::{LeaderLock, QueryPort, StateStore};
use podium_gateway::LedgerGateway;
use podium_settings::EngineSettings;

use crate::settle::{Settler, SettlerConfig, TickReport};

/// Settlement tick cadence.
pub const ENGINE_TICK_MS: u64 = 60_000;

/// Leader heartbeat / election cadence.
pub const LEADER_CHECK_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("engine is not configured")]
    NotConfigured,
    #[error("this instance is not the settlement leader")]
    NotLeader,
    #[error("a settlement tick is already running")]
    AlreadyRunning,
    #[error("tick failed: {0}")]
    Failed(String),
}

pub(crate) struct EngineInner {
    pub(crate) settings: EngineSettings,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) queries: Arc<dyn QueryPort>,
    pub(crate) lock: Arc<dyn LeaderLock>,
    pub(crate) gateway: Option<Arc<dyn LedgerGateway>>,
    pub(crate) settler: Option<Settler>,
    pub(crate) leader: AtomicBool,
    /// Non-reentrant tick guard; `try_lock` failure means a tick is running.
    pub(crate) tick_guard: Mutex<()>,
}

/// Lifecycle-managed settlement engine: explicit `start`/`stop`, shared with
/// the serving layer for status, history, and the manual trigger.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine. `gateway` is `None` when required configuration is
    /// absent; the engine then stays dormant and mutates nothing.
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn StateStore>,
        queries: Arc<dyn QueryPort>,
        lock: Arc<dyn LeaderLock>,
        gateway: Option<Arc<dyn LedgerGateway>>,
    ) -> Self {
        let settler = gateway.clone().map(|gateway| {
            Settler::new(
                SettlerConfig {
                    rewards_pool_bps: settings.rewards_pool_bps,
                    min_trades: settings.min_trades,
                    vault_reserve_lamports: settings.vault_reserve_lamports,
                    dry_run: settings.dry_run,
                },
                store.clone(),
                queries.clone(),
                gateway,
            )
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                settings,
                store,
                queries,
                lock,
                gateway,
                settler,
                leader: AtomicBool::new(false),
                tick_guard: Mutex::new(()),
            }),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Install the heartbeat and tick loops. Dormant when unconfigured.
    /// The first firing of each loop is immediate, so a freshly started
    /// leader settles without waiting out a full tick interval.
    pub fn start(&self) {
        if self.inner.settler.is_none() {
            warn!("gateway not configured, settlement engine stays dormant");
            return;
        }
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            debug!("engine already started");
            return;
        }
        info!(
            tick_ms = ENGINE_TICK_MS,
            leader_check_ms = LEADER_CHECK_MS,
            dry_run = self.inner.settings.dry_run,
            "settlement engine starting"
        );
        tasks.push(tokio::spawn(leader_loop(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(tick_loop(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Orderly shutdown: stop the loops, then release the advisory lock
    /// before the connection goes away.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        if self.inner.leader.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.inner.lock.release().await {
                warn!(error = %e, "failed to release leader lock on shutdown");
            } else {
                info!("leader lock released");
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settler.is_some()
    }

    /// Manual trigger: same single-flight guard as the scheduled tick.
    pub async fn run_now(&self) -> Result<String, TriggerError> {
        let Some(settler) = &self.inner.settler else {
            return Err(TriggerError::NotConfigured);
        };
        if !self.inner.leader.load(Ordering::SeqCst) {
            return Err(TriggerError::NotLeader);
        }
        let Ok(_guard) = self.inner.tick_guard.try_lock() else {
            return Err(TriggerError::AlreadyRunning);
        };

        match settler.tick().await {
            Ok(report) => Ok(describe_report(&report)),
            Err(e) => Err(TriggerError::Failed(e.to_string())),
        }
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn force_leader_for_tests(&self, leader: bool) {
        self.inner.leader.store(leader, Ordering::SeqCst);
    }
}

fn describe_report(report: &TickReport) -> String {
    match &report.processed {
        Some((period_id, status)) => format!(
            "period {} settled to {} ({} recovered)",
            period_id,
            status.as_str(),
            report.recovered
        ),
        None => format!("no period ready ({} recovered)", report.recovered),
    }
}

async fn leader_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut beat = interval(Duration::from_millis(LEADER_CHECK_MS));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = beat.tick() => {}
        }
        if inner.leader.load(Ordering::SeqCst) {
            if let Err(e) = inner.lock.heartbeat().await {
                warn!(error = %e, "leader heartbeat failed, dropping leadership");
                inner.leader.store(false, Ordering::SeqCst);
            }
        } else {
            match inner.lock.try_acquire().await {
                Ok(true) => {
                    info!("settlement leadership acquired");
                    inner.leader.store(true, Ordering::SeqCst);
                    // Settle promptly instead of waiting out the next tick.
                    tokio::spawn(run_guarded_tick(inner.clone()));
                }
                Ok(false) => debug!("settlement leadership held elsewhere"),
                Err(e) => warn!(error = %e, "leadership acquisition failed"),
            }
        }
    }
}

async fn tick_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = interval(Duration::from_millis(ENGINE_TICK_MS));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {}
        }
        if !inner.leader.load(Ordering::SeqCst) {
            continue;
        }
        run_guarded_tick(inner.clone()).await;
    }
}

async fn run_guarded_tick(inner: Arc<EngineInner>) {
    let Some(settler) = &inner.settler else {
        return;
    };
    let Ok(_guard) = inner.tick_guard.try_lock() else {
        debug!("settlement tick already in flight");
        return;
    };

    match settler.tick().await {
        Ok(report) => {
            if report.processed.is_some() || report.recovered > 0 {
                info!(summary = %describe_report(&report), "settlement tick complete");
            }
        }
        Err(e) => {
            // Catastrophic store failure: drop leadership and let the next
            // heartbeat re-elect once the database is reachable again.
            error!(error = %e, "settlement tick failed, dropping leadership");
            inner.leader.store(false, Ordering::SeqCst);
            if let Err(release_err) = inner.lock.release().await {
                warn!(error = %release_err, "lock release after failed tick also failed");
            }
        }
    }
}
