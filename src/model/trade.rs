use alloy::primitives::{B256, I256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Buy,
    Sell,
    Rebalance,
    ProfitTake,
    FeeClaim,
    Liquidate,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
            TradeKind::Rebalance => "rebalance",
            TradeKind::ProfitTake => "profit_take",
            TradeKind::FeeClaim => "fee_claim",
            TradeKind::Liquidate => "liquidate",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "buy" => Ok(TradeKind::Buy),
            "sell" => Ok(TradeKind::Sell),
            "rebalance" => Ok(TradeKind::Rebalance),
            "profit_take" => Ok(TradeKind::ProfitTake),
            "fee_claim" => Ok(TradeKind::FeeClaim),
            "liquidate" => Ok(TradeKind::Liquidate),
            other => Err(KeeperError::validation(format!("unknown trade kind '{other}'"))),
        }
    }

    /// Whether the trade moves tokens out of the position.
    pub fn is_sell_side(&self) -> bool {
        matches!(
            self,
            TradeKind::Sell | TradeKind::ProfitTake | TradeKind::Liquidate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Submitted,
    Confirmed,
    Reverted,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Submitted => "submitted",
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "submitted" => Ok(TradeStatus::Submitted),
            "confirmed" => Ok(TradeStatus::Confirmed),
            "reverted" => Ok(TradeStatus::Reverted),
            other => Err(KeeperError::validation(format!("unknown trade status '{other}'"))),
        }
    }
}

/// Append-only trade log row. Within one eigen, rows are totally ordered by
/// commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: String,
    pub eigen_id: String,
    pub kind: TradeKind,
    #[serde(with = "super::wei_string")]
    pub eth_amount_wei: U256,
    #[serde(with = "super::wei_string")]
    pub token_amount_raw: U256,
    /// Execution price in ETH per whole token.
    pub price_eth: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    pub status: TradeStatus,
    #[serde(with = "super::wei_string")]
    pub gas_cost_wei: U256,
    #[serde(with = "super::signed_wei_string")]
    pub realized_pnl_delta_wei: I256,
    /// Sub-wallet index that carried the transaction.
    pub wallet_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    pub created_at: i64,
}
