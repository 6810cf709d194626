//! Client for the upstream creator-fee API.
//!
//! The fee source exposes claimable fee-share positions per wallet and hands
//! back pre-built transactions (base64) that only need the vault signature.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{GatewayError, Result};

/// Production base URL of the fee-share API.
pub const DEFAULT_API_BASE: &str = "https://public-api-v2.bags.fm/api/v1";

const API_KEY_HEADER: &str = "x-api-key";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// A fee-share position the vault can claim from.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimablePosition {
    /// Mint of the token the position accrues fees for.
    #[serde(rename = "baseMint")]
    pub base_mint: String,
    /// Pool the fees accrued in, when the API reports one.
    #[serde(rename = "virtualPoolAddress")]
    pub virtual_pool_address: Option<String>,
    /// Claimable amount as a decimal string, informational only.
    #[serde(rename = "claimableAmount")]
    pub claimable_amount: Option<String>,
}

impl ClaimablePosition {
    pub fn describe(&self) -> String {
        match &self.virtual_pool_address {
            Some(pool) => format!("{}@{}", self.base_mint, pool),
            None => self.base_mint.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    response: Option<T>,
    error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    fn into_response(self, context: &str) -> Result<T> {
        if !self.success {
            return Err(GatewayError::ClaimApi(format!(
                "{context}: {}",
                self.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        self.response
            .ok_or_else(|| GatewayError::ClaimApi(format!("{context}: empty response")))
    }
}

/// Thin HTTP client over the fee-share endpoints.
pub struct FeeClaimClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FeeClaimClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// All claimable fee-share positions for a wallet, across tokens. The
    /// gateway filters down to the configured mint.
    pub async fn claimable_positions(&self, wallet: &str) -> Result<Vec<ClaimablePosition>> {
        let url = format!("{}/token-launch/fee-share/claimable", self.base_url);
        let envelope: ApiEnvelope<Vec<ClaimablePosition>> = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(&[("wallet", wallet)])
            .send()
            .await
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?
            .error_for_status()
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?;

        let positions = envelope.into_response("claimable positions")?;
        debug!(wallet, positions = positions.len(), "fetched claimable positions");
        Ok(positions)
    }

    /// Pre-built claim transactions (base64) for one position. May return
    /// several batches for a large position.
    pub async fn claim_transactions(
        &self,
        wallet: &str,
        position: &ClaimablePosition,
    ) -> Result<Vec<String>> {
        let url = format!("{}/token-launch/fee-share/claim-txs", self.base_url);
        let body = serde_json::json!({
            "wallet": wallet,
            "baseMint": position.base_mint,
            "virtualPoolAddress": position.virtual_pool_address,
        });
        let envelope: ApiEnvelope<Vec<String>> = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?
            .error_for_status()
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::ClaimApi(e.to_string()))?;

        envelope.into_response("claim transactions")
    }
}
