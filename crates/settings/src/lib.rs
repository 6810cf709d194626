//! Podium Settings
//!
//! Environment configuration for the settlement engine. Values are clamped
//! into their valid ranges; the gateway quad is optional as a group — when
//! any of it is missing the engine starts dormant instead of failing.

use tracing::warn;

/// Default rewards share of claimed fees (5000 BPS = 50%).
pub const DEFAULT_REWARDS_POOL_BPS: u16 = 5_000;

/// Default minimum closed trades for leaderboard eligibility.
pub const DEFAULT_MIN_TRADES: u32 = 3;

/// Default minimum balance kept in the vault after a payout (0.05 SOL).
pub const DEFAULT_VAULT_RESERVE_LAMPORTS: u64 = 50_000_000;

/// Engine configuration, normally read from the process environment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Rewards share of claimed fees, clamped to 0..=10_000 BPS.
    pub rewards_pool_bps: u16,
    /// Minimum trades closed per wallet to qualify for the leaderboard.
    pub min_trades: u32,
    /// Minimum balance to keep in the vault after a payout.
    pub vault_reserve_lamports: u64,
    /// Suppress on-chain calls; finalize still runs with a sentinel signature.
    pub dry_run: bool,
    pub solana_rpc_url: Option<String>,
    pub vault_private_key: Option<String>,
    pub token_mint: Option<String>,
    /// API key for the upstream creator-fee source.
    pub bags_api_key: Option<String>,
    /// Required header value for the manual-trigger surface.
    pub admin_secret: Option<String>,
    pub database_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rewards_pool_bps: DEFAULT_REWARDS_POOL_BPS,
            min_trades: DEFAULT_MIN_TRADES,
            vault_reserve_lamports: DEFAULT_VAULT_RESERVE_LAMPORTS,
            dry_run: false,
            solana_rpc_url: None,
            vault_private_key: None,
            token_mint: None,
            bags_api_key: None,
            admin_secret: None,
            database_url: None,
        }
    }
}

impl EngineSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an injected lookup. Lets tests supply an
    /// environment without mutating process globals.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            rewards_pool_bps: parse_clamped_u64(
                get("REWARDS_POOL_BPS"),
                "REWARDS_POOL_BPS",
                u64::from(defaults.rewards_pool_bps),
                10_000,
            ) as u16,
            min_trades: parse_clamped_u64(
                get("REWARDS_MIN_TRADES"),
                "REWARDS_MIN_TRADES",
                u64::from(defaults.min_trades),
                u64::from(u32::MAX),
            ) as u32,
            vault_reserve_lamports: parse_clamped_u64(
                get("VAULT_RESERVE_LAMPORTS"),
                "VAULT_RESERVE_LAMPORTS",
                defaults.vault_reserve_lamports,
                u64::MAX,
            ),
            dry_run: is_truthy(get("REWARDS_DRY_RUN").as_deref()),
            solana_rpc_url: non_empty(get("SOLANA_RPC_URL")),
            vault_private_key: non_empty(get("REWARDS_VAULT_PRIVATE_KEY")),
            token_mint: non_empty(get("REWARDS_TOKEN_MINT")),
            bags_api_key: non_empty(get("BAGS_API_KEY")),
            admin_secret: non_empty(get("REWARDS_ADMIN_SECRET")),
            database_url: non_empty(get("DATABASE_URL")),
        }
    }

    /// Whether every required gateway variable is present. Absence of any
    /// one of them disables the engine at startup.
    pub fn gateway_configured(&self) -> bool {
        self.solana_rpc_url.is_some()
            && self.vault_private_key.is_some()
            && self.token_mint.is_some()
            && self.bags_api_key.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true"))
}

fn parse_clamped_u64(value: Option<String>, name: &str, default: u64, max: u64) -> u64 {
    match value.as_deref().map(str::trim) {
        None | Some("") => default,
        Some(raw) => match raw.parse::<i128>() {
            Ok(parsed) => parsed.clamp(0, max as i128) as u64,
            Err(_) => {
                warn!(variable = name, value = raw, "unparseable setting, using default");
                default
            }
        },
    }
}
