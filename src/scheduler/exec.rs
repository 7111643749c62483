use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolError, SolEvent, SolInterface};
use tracing::{debug, info, warn};

use crate::chain::types::{CallRequest, ChainError};
use crate::chain::{ChainClient, scaled_gas};
use crate::error::{KeeperError, KeeperResult, NextAction, RevertReport};
use crate::model::eigen::{Eigen, PRICE_SCALE, u256_to_f64};
use crate::model::trade::{TradeKind, TradeStatus};
use crate::oracle::PriceOracle;
use crate::quote::{QuoteEngine, Side, mul_div};
use crate::registry::TradeSettlement;
use crate::wallet::{TxParams, WalletSet};

use super::plan::PlannedTrade;

/// A quote this far from the oracle's fair price is discarded outright.
const ORACLE_DEVIATION_LIMIT: f64 = 0.5;

/// Priority fee attached to every outbound transaction.
const PRIORITY_FEE_WEI: u128 = 1_000_000_000; // 1 gwei

const RECEIPT_TIMEOUT: Duration = Duration::from_secs(90);

sol! {
    interface IEigenRouter {
        function buy(address token, uint256 minOut, address recipient) external payable returns (uint256 amountOut);
        function sell(address token, uint256 amountIn, uint256 minOut, address recipient) external returns (uint256 amountOut);

        error SlippageExceeded(uint256 amountOut, uint256 minOut);
        error InsufficientLiquidity();
        error TradingPaused();
        error DeadlineExpired();
    }

    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// What one execution attempt produced. `Dropped` is not an error: the
/// runner logs the reason and waits a cadence tick.
#[derive(Debug)]
pub enum ExecOutcome {
    Settled(TradeSettlement),
    Dropped { reason: String },
}

pub struct Executor {
    chain: Arc<ChainClient>,
    quote: Arc<QuoteEngine>,
    oracle: Arc<PriceOracle>,
}

impl Executor {
    pub fn new(chain: Arc<ChainClient>, quote: Arc<QuoteEngine>, oracle: Arc<PriceOracle>) -> Self {
        Self {
            chain,
            quote,
            oracle,
        }
    }

    /// Run one planned trade end to end: quote, sanity, wallet choice,
    /// simulation, send, receipt.
    pub async fn execute(
        &self,
        eigen: &Eigen,
        wallets: &WalletSet,
        trade: &PlannedTrade,
        rr_start: u32,
    ) -> KeeperResult<ExecOutcome> {
        let (wallet_index, wallet_addr, amount_in) = match self
            .pick_wallet(eigen, wallets, trade, rr_start)
            .await?
        {
            Some(pick) => pick,
            None => {
                return Ok(ExecOutcome::Dropped {
                    reason: "no sub-wallet can cover this action".into(),
                });
            }
        };

        // Quote at the final size: a clamped sell must not reuse the quote
        // of the planned one.
        let quote = self
            .quote
            .quote(&eigen.pool, eigen.token, trade.side, amount_in)
            .await?;
        if quote.amount_out.is_zero() {
            return Ok(ExecOutcome::Dropped {
                reason: "quote returned zero output".into(),
            });
        }

        let scale = U256::from(PRICE_SCALE);
        let implied_price = match trade.side {
            Side::Buy => mul_div(amount_in, scale, quote.amount_out)?,
            Side::Sell => mul_div(quote.amount_out, scale, amount_in)?,
        };

        if let Some(reason) = self.price_sanity(eigen, trade, implied_price).await {
            return Ok(ExecOutcome::Dropped { reason });
        }

        let slippage = U256::from(eigen.config.slippage_bps);
        let min_out = quote.amount_out * (U256::from(10_000u64) - slippage) / U256::from(10_000u64);

        // Sells spend tokens; the router needs an allowance first.
        let mut prep_gas = U256::ZERO;
        if trade.side == Side::Sell {
            prep_gas = self
                .ensure_allowance(eigen, wallets, wallet_index, wallet_addr, quote.router, amount_in)
                .await?;
        }

        let (calldata, value) = match trade.side {
            Side::Buy => (
                IEigenRouter::buyCall {
                    token: eigen.token,
                    minOut: min_out,
                    recipient: wallet_addr,
                }
                .abi_encode(),
                amount_in,
            ),
            Side::Sell => (
                IEigenRouter::sellCall {
                    token: eigen.token,
                    amountIn: amount_in,
                    minOut: min_out,
                    recipient: wallet_addr,
                }
                .abi_encode(),
                U256::ZERO,
            ),
        };

        let call = CallRequest {
            from: Some(wallet_addr),
            to: quote.router,
            value: (!value.is_zero()).then_some(value),
            data: Some(Bytes::from(calldata.clone())),
            gas: None,
        };

        // Simulate before spending gas; a simulation revert skips the cycle
        // with the decoded reason in the log.
        if let Err(e) = self.chain.simulate(&call).await {
            return match e {
                ChainError::Rpc { data, message, .. } => {
                    let report = decode_revert(data.as_deref().map(|v| v.as_ref()), &message);
                    debug!(eigen = %eigen.id, revert = %report, "simulation revert, skipping cycle");
                    Ok(ExecOutcome::Dropped {
                        reason: report.to_string(),
                    })
                }
                other => Err(other.into()),
            };
        }

        let estimate = self.chain.estimate_gas(&call).await?;
        let gas_limit = scaled_gas(estimate, quote.kind == crate::quote::RouteKind::BondingCurve);
        let (max_fee, priority) = self.fees().await?;

        // The nonce slot stays locked across sign + send so concurrent
        // actions on one wallet go out strictly nonce-ordered.
        let mut slot = self.chain.nonces.lock(wallet_addr).await;
        let nonce = match slot.current() {
            Some(n) => n,
            None => {
                let on_chain = self.chain.transaction_count(wallet_addr).await?;
                slot.prime(on_chain)
            }
        };

        let signed = wallets.sign(&TxParams {
            wallet_index,
            to: quote.router,
            value,
            data: Bytes::from(calldata),
            nonce,
            gas_limit,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        })?;

        let tx_hash = match self.chain.send_raw(&signed.raw).await {
            Ok(hash) => {
                slot.advance(nonce);
                hash
            }
            Err(e) => {
                // Send never reached the mempool: the local nonce rolls back
                // by simply not advancing.
                drop(slot);
                return Err(e.into());
            }
        };
        drop(slot);

        info!(
            eigen = %eigen.id,
            side = ?trade.side,
            wallet = wallet_index,
            tx = %format!("{tx_hash:#x}"),
            "swap submitted"
        );

        let receipt = self.chain.wait_receipt(tx_hash, RECEIPT_TIMEOUT).await?;
        let gas_cost = receipt.gas_cost_wei() + prep_gas;

        if !receipt.succeeded() {
            warn!(eigen = %eigen.id, tx = %format!("{tx_hash:#x}"), "swap reverted on chain");
            return Ok(ExecOutcome::Settled(TradeSettlement {
                kind: trade.kind,
                wallet_index,
                eth_amount_wei: U256::ZERO,
                token_amount_raw: U256::ZERO,
                price_eth: 0.0,
                price_wei: U256::ZERO,
                tx_hash: Some(tx_hash),
                status: TradeStatus::Reverted,
                gas_cost_wei: gas_cost,
                fee_wei: U256::ZERO,
                revert_reason: Some("reverted on chain".into()),
            }));
        }

        // Settled amounts: token legs come from the Transfer logs when the
        // receipt carries them, the quote otherwise.
        let (eth_amount, token_amount) = match trade.side {
            Side::Buy => {
                let received = tokens_received(&receipt.logs, eigen.token, wallet_addr)
                    .unwrap_or(quote.amount_out);
                (amount_in, received)
            }
            Side::Sell => (quote.amount_out, amount_in),
        };

        let price_wei = if token_amount.is_zero() {
            U256::ZERO
        } else {
            mul_div(eth_amount, scale, token_amount)?
        };
        let fee_wei = eth_amount * U256::from(eigen.class.fee_rate_bps()) / U256::from(10_000u64);

        Ok(ExecOutcome::Settled(TradeSettlement {
            kind: trade.kind,
            wallet_index,
            eth_amount_wei: eth_amount,
            token_amount_raw: token_amount,
            price_eth: u256_to_f64(price_wei) / 1e18,
            price_wei,
            tx_hash: Some(tx_hash),
            status: TradeStatus::Confirmed,
            gas_cost_wei: gas_cost,
            fee_wei,
            revert_reason: None,
        }))
    }

    /// Limit and oracle checks on the quoted execution price.
    async fn price_sanity(
        &self,
        eigen: &Eigen,
        trade: &PlannedTrade,
        implied_price: U256,
    ) -> Option<String> {
        match trade.side {
            Side::Sell if implied_price < trade.limit_price_wei => {
                return Some(format!(
                    "sell fill {implied_price} below limit {}",
                    trade.limit_price_wei
                ));
            }
            Side::Buy if !trade.limit_price_wei.is_zero()
                && implied_price > trade.limit_price_wei =>
            {
                return Some(format!(
                    "buy fill {implied_price} above limit {}",
                    trade.limit_price_wei
                ));
            }
            _ => {}
        }

        let reading = self.oracle.read(&eigen.pool, eigen.token).await;
        if let Some(fair) = reading.spot_wei {
            if !fair.is_zero() {
                let fair_f = u256_to_f64(fair);
                let implied_f = u256_to_f64(implied_price);
                let deviation = (implied_f - fair_f).abs() / fair_f;
                if deviation > ORACLE_DEVIATION_LIMIT {
                    return Some(format!(
                        "quote deviates {:.0}% from oracle",
                        deviation * 100.0
                    ));
                }
            }
        }
        None
    }

    /// Round-robin wallet choice starting at `rr_start`, skipping wallets
    /// that cannot cover the action. Sells may clamp to the best holder.
    async fn pick_wallet(
        &self,
        eigen: &Eigen,
        wallets: &WalletSet,
        trade: &PlannedTrade,
        rr_start: u32,
    ) -> KeeperResult<Option<(u32, Address, U256)>> {
        let count = wallets.len();
        let order: Vec<u32> = (0..count).map(|i| (rr_start + i) % count).collect();

        match trade.side {
            Side::Buy => {
                let headroom = U256::from(super::plan::GAS_HEADROOM_WEI);
                let calls = order
                    .iter()
                    .map(|&i| {
                        let addr = wallets.address(i)?;
                        Ok((
                            "eth_getBalance".to_string(),
                            serde_json::json!([format!("{addr:#x}"), "latest"]),
                        ))
                    })
                    .collect::<KeeperResult<Vec<_>>>()?;
                let results = self.chain.batch(calls).await.map_err(KeeperError::from)?;

                for (&i, result) in order.iter().zip(results) {
                    let Ok(v) = result else { continue };
                    let Some(s) = v.as_str() else { continue };
                    let Ok(balance) = crate::chain::types::parse_hex_u256(s) else {
                        continue;
                    };
                    if balance >= trade.amount_in + headroom {
                        return Ok(Some((i, wallets.address(i)?, trade.amount_in)));
                    }
                }
                Ok(None)
            }
            Side::Sell => {
                let mut best: Option<(u32, U256)> = None;
                for &i in &order {
                    let addr = wallets.address(i)?;
                    let held = self.quote.erc20_balance(eigen.token, addr).await?;
                    if held >= trade.amount_in {
                        return Ok(Some((i, addr, trade.amount_in)));
                    }
                    if !held.is_zero() && best.map(|(_, b)| held > b).unwrap_or(true) {
                        best = Some((i, held));
                    }
                }
                // No single wallet holds the full size: clamp to the best.
                match best {
                    Some((i, held)) => Ok(Some((i, wallets.address(i)?, held))),
                    None => Ok(None),
                }
            }
        }
    }

    async fn ensure_allowance(
        &self,
        eigen: &Eigen,
        wallets: &WalletSet,
        wallet_index: u32,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> KeeperResult<U256> {
        let raw = self
            .chain
            .call(
                eigen.token,
                Bytes::from(IERC20::allowanceCall { owner, spender }.abi_encode()),
                None,
            )
            .await?;
        let allowance = IERC20::allowanceCall::abi_decode_returns(&raw)
            .map_err(|e| KeeperError::upstream(format!("allowance decode: {e}")))?;
        if allowance >= amount {
            return Ok(U256::ZERO);
        }

        let calldata = IERC20::approveCall {
            spender,
            amount: U256::MAX,
        }
        .abi_encode();
        let call = CallRequest {
            from: Some(owner),
            to: eigen.token,
            value: None,
            data: Some(Bytes::from(calldata.clone())),
            gas: None,
        };
        let estimate = self.chain.estimate_gas(&call).await?;
        let (max_fee, priority) = self.fees().await?;

        let mut slot = self.chain.nonces.lock(owner).await;
        let nonce = match slot.current() {
            Some(n) => n,
            None => {
                let on_chain = self.chain.transaction_count(owner).await?;
                slot.prime(on_chain)
            }
        };
        let signed = wallets.sign(&TxParams {
            wallet_index,
            to: eigen.token,
            value: U256::ZERO,
            data: Bytes::from(calldata),
            nonce,
            gas_limit: scaled_gas(estimate, false),
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        })?;
        let hash = self.chain.send_raw(&signed.raw).await?;
        slot.advance(nonce);
        drop(slot);

        let receipt = self.chain.wait_receipt(hash, RECEIPT_TIMEOUT).await?;
        if !receipt.succeeded() {
            return Err(KeeperError::Revert(RevertReport {
                error_name: "ApproveFailed".into(),
                args: vec![format!("{:#x}", eigen.token)],
                next_action: NextAction::SkipCycle,
            }));
        }
        debug!(eigen = %eigen.id, wallet = wallet_index, "router allowance granted");
        Ok(receipt.gas_cost_wei())
    }

    /// EIP-1559 fee caps from the latest base fee.
    pub async fn fees(&self) -> KeeperResult<(u128, u128)> {
        let base = self.chain.base_fee().await?;
        let base: u128 = base.try_into().unwrap_or(u128::MAX / 4);
        Ok((base * 2 + PRIORITY_FEE_WEI, PRIORITY_FEE_WEI))
    }

    /// Plain-transfer sweep of every sub-wallet's native balance to `to`.
    /// Used by withdraw; returns (total moved, tx hashes).
    pub async fn sweep_wallets(
        &self,
        wallets: &WalletSet,
        to: Address,
    ) -> KeeperResult<(U256, Vec<B256>)> {
        let (max_fee, priority) = self.fees().await?;
        let transfer_cost = U256::from(21_000u64) * U256::from(max_fee);

        let mut total = U256::ZERO;
        let mut hashes = Vec::new();
        for (index, addr) in wallets.addresses() {
            let balance = self.chain.get_balance(addr).await?;
            if balance <= transfer_cost {
                continue;
            }
            let value = balance - transfer_cost;

            let mut slot = self.chain.nonces.lock(addr).await;
            let nonce = match slot.current() {
                Some(n) => n,
                None => {
                    let on_chain = self.chain.transaction_count(addr).await?;
                    slot.prime(on_chain)
                }
            };
            let signed = wallets.sign(&TxParams {
                wallet_index: index,
                to,
                value,
                data: Bytes::new(),
                nonce,
                gas_limit: 21_000,
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            })?;
            let hash = self.chain.send_raw(&signed.raw).await?;
            slot.advance(nonce);
            drop(slot);

            self.chain.wait_receipt(hash, RECEIPT_TIMEOUT).await?;
            total += value;
            hashes.push(hash);
        }
        Ok((total, hashes))
    }

    /// Distribute a funding amount from the treasury wallet across the
    /// eigen's sub-wallets, equal shares.
    pub async fn distribute_funding(
        &self,
        treasury: &WalletSet,
        targets: &[Address],
        total: U256,
    ) -> KeeperResult<Vec<B256>> {
        if targets.is_empty() || total.is_zero() {
            return Ok(Vec::new());
        }
        let share = total / U256::from(targets.len() as u64);
        let (max_fee, priority) = self.fees().await?;
        let from = treasury.address(0)?;

        let mut hashes = Vec::new();
        for target in targets {
            let mut slot = self.chain.nonces.lock(from).await;
            let nonce = match slot.current() {
                Some(n) => n,
                None => {
                    let on_chain = self.chain.transaction_count(from).await?;
                    slot.prime(on_chain)
                }
            };
            let signed = treasury.sign(&TxParams {
                wallet_index: 0,
                to: *target,
                value: share,
                data: Bytes::new(),
                nonce,
                gas_limit: 21_000,
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            })?;
            let hash = self.chain.send_raw(&signed.raw).await?;
            slot.advance(nonce);
            drop(slot);

            self.chain.wait_receipt(hash, RECEIPT_TIMEOUT).await?;
            hashes.push(hash);
        }
        Ok(hashes)
    }

    /// Spot read for the runner's planning snapshot and price sampling.
    pub async fn spot(&self, eigen: &Eigen) -> KeeperResult<U256> {
        self.quote.spot_price(&eigen.pool, eigen.token).await
    }

    pub async fn oracle_read(&self, eigen: &Eigen) -> crate::oracle::OracleReading {
        self.oracle.read(&eigen.pool, eigen.token).await
    }
}

// ── Revert decoding ─────────────────────────────────────────────────

/// Decode revert data against the router ABI, then the standard
/// Error(string), then give up with the raw message.
pub fn decode_revert(data: Option<&[u8]>, fallback: &str) -> RevertReport {
    if let Some(data) = data {
        if let Ok(err) = IEigenRouter::IEigenRouterErrors::abi_decode(data) {
            let (name, args) = match err {
                IEigenRouter::IEigenRouterErrors::SlippageExceeded(e) => (
                    "SlippageExceeded",
                    vec![e.amountOut.to_string(), e.minOut.to_string()],
                ),
                IEigenRouter::IEigenRouterErrors::InsufficientLiquidity(_) => {
                    ("InsufficientLiquidity", vec![])
                }
                IEigenRouter::IEigenRouterErrors::TradingPaused(_) => ("TradingPaused", vec![]),
                IEigenRouter::IEigenRouterErrors::DeadlineExpired(_) => ("DeadlineExpired", vec![]),
            };
            return RevertReport {
                error_name: name.into(),
                args,
                next_action: NextAction::SkipCycle,
            };
        }
        if let Ok(revert) = alloy::sol_types::Revert::abi_decode(data) {
            return RevertReport {
                error_name: "Error".into(),
                args: vec![revert.reason.clone()],
                next_action: NextAction::SkipCycle,
            };
        }
    }
    RevertReport {
        error_name: "Revert".into(),
        args: vec![fallback.to_string()],
        next_action: NextAction::SkipCycle,
    }
}

/// Sum of token transfers into `recipient` in a receipt.
fn tokens_received(
    logs: &[crate::chain::types::RpcLog],
    token: Address,
    recipient: Address,
) -> Option<U256> {
    let mut total = U256::ZERO;
    let mut seen = false;
    for log in logs {
        if log.address != token {
            continue;
        }
        if log.topics.first() != Some(&IERC20::Transfer::SIGNATURE_HASH) {
            continue;
        }
        let Ok(event) = IERC20::Transfer::decode_raw_log(log.topics.iter().copied(), &log.data)
        else {
            continue;
        };
        if event.to == recipient {
            total += event.value;
            seen = true;
        }
    }
    seen.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_errors_decode_by_name() {
        let data = IEigenRouter::SlippageExceeded {
            amountOut: U256::from(90u64),
            minOut: U256::from(100u64),
        }
        .abi_encode();
        let report = decode_revert(Some(&data), "unused");
        assert_eq!(report.error_name, "SlippageExceeded");
        assert_eq!(report.args, vec!["90".to_string(), "100".to_string()]);
    }

    #[test]
    fn string_reverts_fall_through() {
        let data = alloy::sol_types::Revert {
            reason: "TRANSFER_FROM_FAILED".into(),
        }
        .abi_encode();
        let report = decode_revert(Some(&data), "unused");
        assert_eq!(report.error_name, "Error");
        assert_eq!(report.args, vec!["TRANSFER_FROM_FAILED".to_string()]);
    }

    #[test]
    fn opaque_reverts_keep_the_provider_message() {
        let report = decode_revert(None, "execution reverted");
        assert_eq!(report.error_name, "Revert");
        assert_eq!(report.args, vec!["execution reverted".to_string()]);
    }
}
