//! Podium Engine
//!
//! The settlement core: pot accounting, the epoch state machine with crash
//! recovery, and the leader-elected tick scheduler. At the end of each
//! leaderboard period the engine claims accrued creator fees, splits them
//! between the rewards pot and the treasury, selects the top three trading
//! wallets, and executes one batch payout — at most once, across replicas.

pub mod pot;
pub mod scheduler;
pub mod settle;
pub mod status;


pub use scheduler::{Engine, TriggerError, ENGINE_TICK_MS, LEADER_CHECK_MS};
pub use settle::{Settler, SettlerConfig, TickReport, PAYOUT_COUNT, STUCK_TIMEOUT_MINUTES};
pub use status::{
    ActivePeriodStatus, EngineStatus, EpochHistoryEntry, EpochSummary, RulesView, WinnerView,
};
