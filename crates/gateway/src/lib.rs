//! Podium Gateway
//!
//! The engine's only door to the outside ledger: claims creator fees from
//! the upstream fee source, reads the vault balance, signs and submits the
//! payout batch, and verifies previously submitted transactions. The gateway
//! never touches the state store; all durability around its calls belongs to
//! the settlement state machine.

pub mod claim;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::UiTransactionEncoding;
use thiserror::Error;
use tracing::{info, warn};

use podium_core::{is_valid_wallet_address, PayoutPlanEntry};
use podium_settings::EngineSettings;

use crate::claim::FeeClaimClient;

/// Client-side resubmission bound for one transaction.
pub const MAX_SEND_RETRIES: usize = 3;

/// Largest lamport amount handed to the transfer builder. The wire encoding
/// upstream of the chain treats amounts as JS numbers, so the engine clamps
/// against 2^53 - 1 rather than full u64 range.
pub const MAX_SAFE_LAMPORTS: u64 = (1 << 53) - 1;

/// Base transaction fee per signature.
const BASE_TX_FEE_LAMPORTS: u64 = 5_000;
/// Conservative per-transfer allowance on top of the base fee.
const PER_TRANSFER_FEE_LAMPORTS: u64 = 5_000;
/// Slack so a fee-market bump cannot push the vault below its reserve.
const FEE_SLACK_LAMPORTS: u64 = 10_000;

const CONFIRM_ATTEMPTS: usize = 30;
const CONFIRM_POLL_MS: u64 = 2_000;

/// Gateway failures split into two classes: permanent errors (bad keys,
/// pre-validation rejects, malformed wire payloads) fail identically on
/// every attempt, while transient ones (RPC, upstream API, confirmation
/// timeouts) may heal on retry. Callers treat permanent errors as epoch
/// failures and transient errors as recoverable.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid vault key: {0}")]
    InvalidVaultKey(String),
    #[error("invalid token mint: {0}")]
    InvalidTokenMint(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("fee claim api error: {0}")]
    ClaimApi(String),
    #[error("invalid payout entry at rank {rank}: {reason}")]
    InvalidPayoutEntry { rank: u8, reason: String },
    #[error("transaction {signature} failed on chain: {error}")]
    TransactionFailed { signature: String, error: String },
    #[error("transaction {0} not confirmed in time")]
    Unconfirmed(String),
    #[error("malformed claim transaction: {0}")]
    MalformedClaimTransaction(String),
}

impl GatewayError {
    /// Whether retrying the same call can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidVaultKey(_)
                | Self::InvalidTokenMint(_)
                | Self::InvalidPayoutEntry { .. }
                | Self::MalformedClaimTransaction(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Ledger operations the settlement state machine drives.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Current vault balance in lamports.
    async fn vault_balance(&self) -> Result<u64>;

    /// Base58 vault address.
    fn vault_address(&self) -> String;

    /// Claim all accrued creator fees for the configured token. Individual
    /// sub-transaction failures are logged and skipped; an empty signature
    /// list with `Ok` means nothing was claimable.
    async fn claim_fees(&self) -> Result<Vec<String>>;

    /// Build, sign, submit, and confirm ONE batch transfer containing
    /// exactly the given entries. Pre-validation failures return an error
    /// without sending anything.
    async fn send_payout(&self, entries: &[PayoutPlanEntry]) -> Result<String>;

    /// Whether a previously submitted transaction reached confirmation.
    /// Used by recovery to avoid double-sending a payout.
    async fn verify_transaction(&self, signature: &str) -> Result<bool>;

    /// Conservative overestimate of the fee for a batch of `transfers`.
    fn estimate_payout_fee(&self, transfers: usize) -> u64;
}

/// Required gateway configuration, extracted from settings as a group.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rpc_url: String,
    pub vault_private_key: String,
    pub token_mint: String,
    pub api_key: String,
    pub api_base: String,
}

impl GatewayConfig {
    /// `Some` only when every required variable is present; the caller
    /// treats `None` as "engine disabled", with no state mutations.
    pub fn from_settings(settings: &EngineSettings) -> Option<Self> {
        Some(Self {
            rpc_url: settings.solana_rpc_url.clone()?,
            vault_private_key: settings.vault_private_key.clone()?,
            token_mint: settings.token_mint.clone()?,
            api_key: settings.bags_api_key.clone()?,
            api_base: claim::DEFAULT_API_BASE.to_string(),
        })
    }
}

/// Production gateway: nonblocking Solana RPC at `confirmed` commitment plus
/// the upstream fee-claim API.
pub struct SolanaGateway {
    rpc: RpcClient,
    vault: Keypair,
    vault_pubkey: Pubkey,
    token_mint: Pubkey,
    claims: FeeClaimClient,
}

impl SolanaGateway {
    /// Load the vault keypair, build the RPC client, and smoke-check
    /// connectivity with a balance call.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let vault = parse_vault_key(&config.vault_private_key)?;
        let vault_pubkey = vault.pubkey();
        let token_mint = Pubkey::from_str(&config.token_mint)
            .map_err(|e| GatewayError::InvalidTokenMint(e.to_string()))?;

        let rpc = RpcClient::new_with_commitment(config.rpc_url, CommitmentConfig::confirmed());
        let claims = FeeClaimClient::new(config.api_base, config.api_key)?;

        let balance = rpc
            .get_balance(&vault_pubkey)
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;
        info!(
            vault = %vault_pubkey,
            balance_lamports = balance,
            "ledger gateway connected"
        );

        Ok(Self {
            rpc,
            vault,
            vault_pubkey,
            token_mint,
            claims,
        })
    }

    /// Decode a base64 claim transaction from the upstream API, sign it with
    /// the vault key against its embedded blockhash, submit and confirm.
    async fn sign_and_send_claim(&self, encoded: &str) -> Result<String> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::MalformedClaimTransaction(e.to_string()))?;
        let mut tx: Transaction = bincode::deserialize(&bytes)
            .map_err(|e| GatewayError::MalformedClaimTransaction(e.to_string()))?;

        let blockhash = tx.message.recent_blockhash;
        tx.try_partial_sign(&[&self.vault], blockhash)
            .map_err(|e| GatewayError::MalformedClaimTransaction(e.to_string()))?;

        let signature = self.submit(&tx).await?;
        self.await_confirmation(&signature).await?;
        Ok(signature.to_string())
    }

    async fn submit(&self, tx: &Transaction) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            max_retries: Some(MAX_SEND_RETRIES),
            ..RpcSendTransactionConfig::default()
        };
        self.rpc
            .send_transaction_with_config(tx, config)
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))
    }

    async fn await_confirmation(&self, signature: &Signature) -> Result<()> {
        for _ in 0..CONFIRM_ATTEMPTS {
            let statuses = self
                .rpc
                .get_signature_statuses(&[*signature])
                .await
                .map_err(|e| GatewayError::Rpc(e.to_string()))?;
            if let Some(Some(status)) = statuses.value.first() {
                if let Some(err) = &status.err {
                    return Err(GatewayError::TransactionFailed {
                        signature: signature.to_string(),
                        error: err.to_string(),
                    });
                }
                if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
        }
        Err(GatewayError::Unconfirmed(signature.to_string()))
    }
}

#[async_trait]
impl LedgerGateway for SolanaGateway {
    async fn vault_balance(&self) -> Result<u64> {
        self.rpc
            .get_balance(&self.vault_pubkey)
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))
    }

    fn vault_address(&self) -> String {
        self.vault_pubkey.to_string()
    }

    async fn claim_fees(&self) -> Result<Vec<String>> {
        let wallet = self.vault_pubkey.to_string();
        let mint = self.token_mint.to_string();

        let positions = self.claims.claimable_positions(&wallet).await?;
        let positions: Vec<_> = positions
            .into_iter()
            .filter(|p| p.base_mint == mint)
            .collect();
        if positions.is_empty() {
            info!(mint = %mint, "no claimable fee positions");
            return Ok(vec![]);
        }

        let mut signatures = Vec::new();
        for position in &positions {
            let batches = match self.claims.claim_transactions(&wallet, position).await {
                Ok(batches) => batches,
                Err(e) => {
                    warn!(position = %position.describe(), error = %e, "claim batch fetch failed, skipping position");
                    continue;
                }
            };
            for encoded in &batches {
                match self.sign_and_send_claim(encoded).await {
                    Ok(signature) => {
                        info!(signature = %signature, "fee claim confirmed");
                        signatures.push(signature);
                    }
                    Err(e) => {
                        warn!(error = %e, "claim transaction failed, skipping");
                    }
                }
            }
        }
        Ok(signatures)
    }

    async fn send_payout(&self, entries: &[PayoutPlanEntry]) -> Result<String> {
        let destinations = validate_entries(entries)?;

        let transfers: Vec<_> = entries
            .iter()
            .zip(&destinations)
            .map(|(entry, dest)| {
                system_instruction::transfer(&self.vault_pubkey, dest, entry.amount_lamports)
            })
            .collect();

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;
        let tx = Transaction::new_signed_with_payer(
            &transfers,
            Some(&self.vault_pubkey),
            &[&self.vault],
            blockhash,
        );

        let signature = self.submit(&tx).await?;
        self.await_confirmation(&signature).await?;
        info!(
            signature = %signature,
            transfers = transfers.len(),
            "payout batch confirmed"
        );
        Ok(signature.to_string())
    }

    async fn verify_transaction(&self, signature: &str) -> Result<bool> {
        let parsed = match Signature::from_str(signature) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(false),
        };

        let statuses = self
            .rpc
            .get_signature_statuses(&[parsed])
            .await
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;
        if let Some(Some(status)) = statuses.value.first() {
            return Ok(status.err.is_none()
                && status.satisfies_commitment(CommitmentConfig::confirmed()));
        }

        // Status history is bounded; fall back to a direct lookup.
        match self
            .rpc
            .get_transaction(&parsed, UiTransactionEncoding::Base64)
            .await
        {
            Ok(tx) => Ok(tx
                .transaction
                .meta
                .map(|meta| meta.err.is_none())
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    fn estimate_payout_fee(&self, transfers: usize) -> u64 {
        BASE_TX_FEE_LAMPORTS
            + PER_TRANSFER_FEE_LAMPORTS * transfers as u64
            + FEE_SLACK_LAMPORTS
    }
}

/// Parse the vault secret: base58-encoded 64-byte keypair, or the JSON byte
/// array format the chain CLI writes.
fn parse_vault_key(raw: &str) -> Result<Keypair> {
    let trimmed = raw.trim();
    let bytes = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<u8>>(trimmed)
            .map_err(|e| GatewayError::InvalidVaultKey(e.to_string()))?
    } else {
        bs58::decode(trimmed)
            .into_vec()
            .map_err(|e| GatewayError::InvalidVaultKey(e.to_string()))?
    };
    Keypair::from_bytes(&bytes).map_err(|e| GatewayError::InvalidVaultKey(e.to_string()))
}

/// Pre-validate payout entries: strictly positive amounts within the safe
/// numeric range, destinations that parse as chain addresses. Any failure
/// rejects the whole batch before anything is sent.
fn validate_entries(entries: &[PayoutPlanEntry]) -> Result<Vec<Pubkey>> {
    let mut destinations = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.amount_lamports == 0 {
            return Err(GatewayError::InvalidPayoutEntry {
                rank: entry.rank,
                reason: "amount must be strictly positive".to_string(),
            });
        }
        if entry.amount_lamports > MAX_SAFE_LAMPORTS {
            return Err(GatewayError::InvalidPayoutEntry {
                rank: entry.rank,
                reason: format!(
                    "amount {} exceeds safe range {}",
                    entry.amount_lamports, MAX_SAFE_LAMPORTS
                ),
            });
        }
        if !is_valid_wallet_address(&entry.wallet) {
            return Err(GatewayError::InvalidPayoutEntry {
                rank: entry.rank,
                reason: format!("wallet {} is not a valid address", entry.wallet),
            });
        }
        let dest = Pubkey::from_str(&entry.wallet).map_err(|_| GatewayError::InvalidPayoutEntry {
            rank: entry.rank,
            reason: format!("wallet {} does not parse", entry.wallet),
        })?;
        destinations.push(dest);
    }
    Ok(destinations)
}
