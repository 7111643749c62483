use std::fmt;

use alloy::primitives::{Address, I256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};
use crate::model::pool::PoolDescriptor;

// ── Status machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EigenStatus {
    PendingFunding,
    PendingLp,
    Active,
    Suspended,
    Liquidating,
    Liquidated,
    Terminated,
    Closed,
}

impl EigenStatus {
    /// Terminal states: the scheduler never executes in them. Settlement
    /// edges (liquidated → terminated → closed) still exist for lifecycle
    /// operations; they never lead back out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EigenStatus::Liquidated | EigenStatus::Terminated | EigenStatus::Closed
        )
    }

    pub fn can_transition(&self, to: EigenStatus) -> bool {
        use EigenStatus::*;
        matches!(
            (*self, to),
            (PendingFunding, Active)
                | (PendingFunding, Liquidating)
                | (PendingLp, Active)
                | (PendingLp, Liquidating)
                | (Active, Suspended)
                | (Active, Liquidating)
                | (Suspended, Active)
                | (Suspended, Liquidating)
                | (Liquidating, Liquidated)
                | (Liquidating, Terminated)
                | (Liquidated, Terminated)
                | (Terminated, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EigenStatus::PendingFunding => "pending_funding",
            EigenStatus::PendingLp => "pending_lp",
            EigenStatus::Active => "active",
            EigenStatus::Suspended => "suspended",
            EigenStatus::Liquidating => "liquidating",
            EigenStatus::Liquidated => "liquidated",
            EigenStatus::Terminated => "terminated",
            EigenStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "pending_funding" => Ok(EigenStatus::PendingFunding),
            "pending_lp" => Ok(EigenStatus::PendingLp),
            "active" => Ok(EigenStatus::Active),
            "suspended" => Ok(EigenStatus::Suspended),
            "liquidating" => Ok(EigenStatus::Liquidating),
            "liquidated" => Ok(EigenStatus::Liquidated),
            "terminated" => Ok(EigenStatus::Terminated),
            "closed" => Ok(EigenStatus::Closed),
            other => Err(KeeperError::validation(format!("unknown status '{other}'"))),
        }
    }
}

impl fmt::Display for EigenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Class ───────────────────────────────────────────────────────────

/// Service tier. Selects default config ranges and the keeper fee rate.
/// Class changes are allowed only upward and only while `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EigenClass {
    Lite,
    Core,
    Pro,
    Ultra,
}

impl EigenClass {
    pub fn rank(&self) -> u8 {
        match self {
            EigenClass::Lite => 0,
            EigenClass::Core => 1,
            EigenClass::Pro => 2,
            EigenClass::Ultra => 3,
        }
    }

    pub fn fee_rate_bps(&self) -> u32 {
        match self {
            EigenClass::Lite => 100,
            EigenClass::Core => 80,
            EigenClass::Pro => 60,
            EigenClass::Ultra => 40,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EigenClass::Lite => "lite",
            EigenClass::Core => "core",
            EigenClass::Pro => "pro",
            EigenClass::Ultra => "ultra",
        }
    }

    pub fn parse(s: &str) -> KeeperResult<Self> {
        match s {
            "lite" => Ok(EigenClass::Lite),
            "core" => Ok(EigenClass::Core),
            "pro" => Ok(EigenClass::Pro),
            "ultra" => Ok(EigenClass::Ultra),
            other => Err(KeeperError::validation(format!("unknown class '{other}'"))),
        }
    }

    /// Default trading config for a fresh eigen of this class.
    pub fn default_config(&self) -> EigenConfig {
        let (freq, wallets) = match self {
            EigenClass::Lite => (4.0, 2),
            EigenClass::Core => (8.0, 4),
            EigenClass::Pro => (15.0, 8),
            EigenClass::Ultra => (30.0, 12),
        };
        EigenConfig {
            volume_target_eth: 0.05,
            trade_frequency: freq,
            order_size_min_wei: U256::from(1_000_000_000_000_000u64), // 0.001 ETH
            order_size_max_wei: U256::from(10_000_000_000_000_000u64), // 0.01 ETH
            order_size_min_pct: 1.0,
            order_size_max_pct: 5.0,
            spread_width_pct: 0.6,
            profit_target_pct: 12.0,
            stop_loss_pct: 25.0,
            rebalance_threshold: 0.7,
            wallet_count: wallets,
            slippage_bps: 100,
            reactive_sell_mode: false,
            reactive_sell_pct: 50,
            strategy_prompt: None,
        }
    }
}

impl fmt::Display for EigenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Config ──────────────────────────────────────────────────────────

/// Mutable per-eigen trading parameters. A closed record: every field has a
/// declared range, enforced on every write. Out-of-range patches are
/// rejected whole and leave the previous config untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EigenConfig {
    /// Daily volume target, ETH equivalent.
    pub volume_target_eth: f64,
    /// Planned trades per hour; cadence is 3600 / frequency seconds.
    pub trade_frequency: f64,
    #[serde(with = "super::wei_string")]
    pub order_size_min_wei: U256,
    #[serde(with = "super::wei_string")]
    pub order_size_max_wei: U256,
    /// Order size band as percent of applicable balance.
    pub order_size_min_pct: f64,
    pub order_size_max_pct: f64,
    pub spread_width_pct: f64,
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    /// Inventory ratio beyond which the planner forces a rebalance.
    pub rebalance_threshold: f64,
    pub wallet_count: u32,
    pub slippage_bps: u32,
    pub reactive_sell_mode: bool,
    pub reactive_sell_pct: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_prompt: Option<String>,
}

impl EigenConfig {
    /// Validate every field against its declared range. Returns all
    /// violations, not just the first.
    pub fn validate(&self) -> KeeperResult<()> {
        let mut errors = Vec::new();

        range_f64(&mut errors, "volumeTarget", self.volume_target_eth, 0.001, 10_000.0);
        range_f64(&mut errors, "tradeFrequency", self.trade_frequency, 1.0, 120.0);
        range_f64(&mut errors, "orderSizePctMin", self.order_size_min_pct, 0.1, 100.0);
        range_f64(&mut errors, "orderSizePctMax", self.order_size_max_pct, 0.1, 100.0);
        range_f64(&mut errors, "spreadWidth", self.spread_width_pct, 0.01, 10.0);
        range_f64(&mut errors, "profitTarget", self.profit_target_pct, 0.1, 1000.0);
        range_f64(&mut errors, "stopLoss", self.stop_loss_pct, 0.1, 100.0);
        range_f64(&mut errors, "rebalanceThreshold", self.rebalance_threshold, 0.0, 1.0);

        if self.order_size_min_wei.is_zero() {
            errors.push("orderSizeMin: must be positive".into());
        }
        if self.order_size_max_wei < self.order_size_min_wei {
            errors.push("orderSizeMax: below orderSizeMin".into());
        }
        if self.order_size_max_pct < self.order_size_min_pct {
            errors.push("orderSizePctMax: below orderSizePctMin".into());
        }
        if !(1..=20).contains(&self.wallet_count) {
            errors.push(format!("walletCount: {} outside [1, 20]", self.wallet_count));
        }
        if !(10..=1000).contains(&self.slippage_bps) {
            errors.push(format!("slippageBps: {} outside [10, 1000]", self.slippage_bps));
        }
        if !(1..=100).contains(&self.reactive_sell_pct) {
            errors.push(format!("reactiveSellPct: {} outside [1, 100]", self.reactive_sell_pct));
        }
        if let Some(prompt) = &self.strategy_prompt {
            if prompt.len() > 2000 {
                errors.push("strategyPrompt: longer than 2000 bytes".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(KeeperError::Validation(errors.join("; ")))
        }
    }

    /// Nominal seconds between planned actions.
    pub fn cadence_secs(&self) -> f64 {
        3600.0 / self.trade_frequency
    }
}

fn range_f64(errors: &mut Vec<String>, name: &str, v: f64, min: f64, max: f64) {
    if !v.is_finite() || v < min || v > max {
        errors.push(format!("{name}: {v} outside [{min}, {max}]"));
    }
}

/// Partial config update. Absent fields keep their current value.
/// `walletCount` may only grow; shrinking the wallet set is rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub volume_target_eth: Option<f64>,
    pub trade_frequency: Option<f64>,
    #[serde(default, with = "opt_wei")]
    pub order_size_min_wei: Option<U256>,
    #[serde(default, with = "opt_wei")]
    pub order_size_max_wei: Option<U256>,
    pub order_size_min_pct: Option<f64>,
    pub order_size_max_pct: Option<f64>,
    pub spread_width_pct: Option<f64>,
    pub profit_target_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub rebalance_threshold: Option<f64>,
    pub wallet_count: Option<u32>,
    pub slippage_bps: Option<u32>,
    pub reactive_sell_mode: Option<bool>,
    pub reactive_sell_pct: Option<u32>,
    pub strategy_prompt: Option<String>,
}

mod opt_wei {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|s| U256::from_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl ConfigPatch {
    /// Apply onto an existing config, producing the candidate the registry
    /// then validates. Returns whether anything actually changed so no-op
    /// patches can skip the write entirely.
    pub fn apply(&self, current: &EigenConfig) -> KeeperResult<(EigenConfig, bool)> {
        if let Some(n) = self.wallet_count {
            if n < current.wallet_count {
                return Err(KeeperError::validation(format!(
                    "walletCount: cannot shrink from {} to {n}",
                    current.wallet_count
                )));
            }
        }

        let mut next = current.clone();
        if let Some(v) = self.volume_target_eth {
            next.volume_target_eth = v;
        }
        if let Some(v) = self.trade_frequency {
            next.trade_frequency = v;
        }
        if let Some(v) = self.order_size_min_wei {
            next.order_size_min_wei = v;
        }
        if let Some(v) = self.order_size_max_wei {
            next.order_size_max_wei = v;
        }
        if let Some(v) = self.order_size_min_pct {
            next.order_size_min_pct = v;
        }
        if let Some(v) = self.order_size_max_pct {
            next.order_size_max_pct = v;
        }
        if let Some(v) = self.spread_width_pct {
            next.spread_width_pct = v;
        }
        if let Some(v) = self.profit_target_pct {
            next.profit_target_pct = v;
        }
        if let Some(v) = self.stop_loss_pct {
            next.stop_loss_pct = v;
        }
        if let Some(v) = self.rebalance_threshold {
            next.rebalance_threshold = v;
        }
        if let Some(v) = self.wallet_count {
            next.wallet_count = v;
        }
        if let Some(v) = self.slippage_bps {
            next.slippage_bps = v;
        }
        if let Some(v) = self.reactive_sell_mode {
            next.reactive_sell_mode = v;
        }
        if let Some(v) = self.reactive_sell_pct {
            next.reactive_sell_pct = v;
        }
        if let Some(v) = &self.strategy_prompt {
            next.strategy_prompt = Some(v.clone());
        }

        next.validate()?;
        let changed = serde_json::to_string(&next).unwrap_or_default()
            != serde_json::to_string(current).unwrap_or_default();
        Ok((next, changed))
    }
}

// ── Eigen ───────────────────────────────────────────────────────────

/// A single market-making agent: one token, one chain, one config, one
/// budget. Owns its derived wallets and its trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eigen {
    pub id: String,
    /// Lower-case hex owner address.
    pub owner: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<String>,
    pub chain_id: u64,
    pub token: Address,
    pub pool: PoolDescriptor,
    pub class: EigenClass,
    pub config: EigenConfig,

    // Budget ledger, all wei.
    #[serde(with = "super::wei_string")]
    pub deposited_wei: U256,
    #[serde(with = "super::wei_string")]
    pub balance_wei: U256,
    #[serde(with = "super::wei_string")]
    pub reserved_wei: U256,

    // Position.
    #[serde(with = "super::wei_string")]
    pub token_balance: U256,
    /// Weighted-average entry price, wei per 10^18 raw token units.
    #[serde(with = "super::wei_string")]
    pub average_entry_wei: U256,
    #[serde(with = "super::signed_wei_string")]
    pub realized_pnl_wei: I256,
    #[serde(with = "super::wei_string")]
    pub gas_spent_wei: U256,
    #[serde(with = "super::wei_string")]
    pub fee_accrued_wei: U256,
    #[serde(with = "super::wei_string")]
    pub volume_produced_wei: U256,
    #[serde(with = "super::wei_string")]
    pub volume_cap_wei: U256,

    pub trade_count: u64,
    pub buy_count: u64,
    pub sell_count: u64,

    pub status: EigenStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<i64>,
    /// End of the purchased volume window.
    pub expires_at: i64,
}

/// Price scale for average-entry bookkeeping: prices are wei per 10^18 raw
/// token units so integer math stays exact.
pub const PRICE_SCALE: u64 = 1_000_000_000_000_000_000;

impl Eigen {
    /// Mark-to-market P&L of the open position at `price_wei` (same scale as
    /// `average_entry_wei`). Recomputed on read, never stored.
    pub fn unrealized_pnl_wei(&self, price_wei: U256) -> I256 {
        if self.token_balance.is_zero() {
            return I256::ZERO;
        }
        let scale = U256::from(PRICE_SCALE);
        let current = self.token_balance * price_wei / scale;
        let cost = self.token_balance * self.average_entry_wei / scale;
        I256::try_from(current).unwrap_or(I256::MAX)
            - I256::try_from(cost).unwrap_or(I256::MAX)
    }

    /// Unrealized P&L as a percent of position cost basis.
    pub fn unrealized_pnl_pct(&self, price_wei: U256) -> f64 {
        if self.token_balance.is_zero() || self.average_entry_wei.is_zero() {
            return 0.0;
        }
        let scale = U256::from(PRICE_SCALE);
        let cost = self.token_balance * self.average_entry_wei / scale;
        if cost.is_zero() {
            return 0.0;
        }
        let pnl = self.unrealized_pnl_wei(price_wei);
        let cost_f = u256_to_f64(cost);
        let pnl_f = i256_to_f64(pnl);
        pnl_f / cost_f * 100.0
    }

    /// The purchased volume window or cap has been exhausted.
    pub fn volume_exhausted(&self, now: i64) -> bool {
        self.volume_produced_wei >= self.volume_cap_wei || now >= self.expires_at
    }

    /// Generate a fresh `ES-` id with a 6-char lowercase-hex suffix.
    pub fn new_id() -> String {
        let raw = uuid::Uuid::new_v4();
        let hex = raw.simple().to_string();
        format!("ES-{}", &hex[..6])
    }
}

pub fn u256_to_f64(v: U256) -> f64 {
    // Lossy by construction; only used for percent math and display.
    v.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

pub fn i256_to_f64(v: I256) -> f64 {
    let negative = v.is_negative();
    let abs = v.unsigned_abs();
    let f = u256_to_f64(abs);
    if negative { -f } else { f }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_way_back_to_trading() {
        use EigenStatus::*;
        for terminal in [Liquidated, Terminated, Closed] {
            for target in [PendingFunding, PendingLp, Active, Suspended, Liquidating] {
                assert!(
                    !terminal.can_transition(target),
                    "{terminal} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn suspend_resume_round_trip() {
        assert!(EigenStatus::Active.can_transition(EigenStatus::Suspended));
        assert!(EigenStatus::Suspended.can_transition(EigenStatus::Active));
        assert!(!EigenStatus::Liquidating.can_transition(EigenStatus::Active));
    }

    #[test]
    fn patch_rejects_shrinking_wallets() {
        let config = EigenClass::Core.default_config();
        let patch = ConfigPatch {
            wallet_count: Some(config.wallet_count - 1),
            ..Default::default()
        };
        assert!(patch.apply(&config).is_err());
    }

    #[test]
    fn noop_patch_reports_unchanged() {
        let config = EigenClass::Lite.default_config();
        let (next, changed) = ConfigPatch::default().apply(&config).unwrap();
        assert!(!changed);
        assert_eq!(next.wallet_count, config.wallet_count);
    }

    #[test]
    fn out_of_range_patch_is_rejected_whole() {
        let config = EigenClass::Lite.default_config();
        let patch = ConfigPatch {
            slippage_bps: Some(5_000),
            ..Default::default()
        };
        assert!(patch.apply(&config).is_err());
    }
}
