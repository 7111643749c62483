use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};

/// Payment admission state. `state` is a CAS field: `verified → consumed`
/// links the payment to exactly one eigen; `verified → failed` happens when
/// the TTL lapses or a downstream step fails before consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Verified,
    Consumed,
    Failed,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Verified => "verified",
            PaymentState::Consumed => "consumed",
            PaymentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "pending" => Ok(PaymentState::Pending),
            "verified" => Ok(PaymentState::Verified),
            "consumed" => Ok(PaymentState::Consumed),
            "failed" => Ok(PaymentState::Failed),
            other => Err(KeeperError::validation(format!("unknown payment state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentScheme {
    /// Stablecoin transfer already on chain; proof is the tx hash.
    Direct,
    /// ERC-3009-style signed authorization settled by the facilitator.
    Authorization,
}

impl PaymentScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentScheme::Direct => "direct",
            PaymentScheme::Authorization => "authorization",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "direct" => Ok(PaymentScheme::Direct),
            "authorization" => Ok(PaymentScheme::Authorization),
            other => Err(KeeperError::validation(format!("unknown payment scheme '{other}'"))),
        }
    }
}

/// One admitted (or rejected) payment. The id is the SHA-256 of the
/// authorization payload, or of (tx hash, chain id) for direct transfers,
/// and doubles as the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub payer: Address,
    pub recipient: Address,
    #[serde(with = "super::wei_string")]
    pub amount: U256,
    pub chain_id: u64,
    pub scheme: PaymentScheme,
    pub state: PaymentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eigen_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<i64>,
}

/// The 402 body: everything a client needs to pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Accepted schemes, most preferred first.
    pub schemes: Vec<PaymentScheme>,
    pub chain: u64,
    pub token: Address,
    /// Stablecoin minor units, decimal string.
    #[serde(with = "super::wei_string")]
    pub amount: U256,
    pub recipient: Address,
    /// Unix seconds after which a fresh 402 handshake is required.
    pub valid_until: i64,
}
