use std::sync::Arc;

use alloy::primitives::aliases::U512;
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};

use crate::chain::ChainClient;
use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::PRICE_SCALE;
use crate::model::pool::{PoolDescriptor, PoolVersion};

// ── On-chain ABI surface ────────────────────────────────────────────

sol! {
    interface IUniswapV3Pool {
        function slot0() external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint16 observationIndex,
            uint16 observationCardinality,
            uint16 observationCardinalityNext,
            uint8 feeProtocol,
            bool unlocked
        );
    }

    interface IStateView {
        function getSlot0(bytes32 poolId) external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint24 protocolFee,
            uint24 lpFee
        );
    }

    interface ICurveRouter {
        function getAmountOut(address token, uint256 amountIn, bool isBuy) external view returns (uint256 amountOut);
        function isGraduated(address token) external view returns (bool);
        function dexRouter() external view returns (address);
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function name() external view returns (string);
        function symbol() external view returns (string);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

// ── Quote types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteKind {
    BondingCurve,
    Dex,
}

/// A quote answers exactly one question: for this pool, direction and input
/// amount, what comes out and through which router.
#[derive(Debug, Clone)]
pub struct Quote {
    pub amount_out: U256,
    pub router: Address,
    pub kind: RouteKind,
}

pub struct QuoteEngine {
    chain: Arc<ChainClient>,
}

impl QuoteEngine {
    pub fn new(chain: Arc<ChainClient>) -> Self {
        Self { chain }
    }

    /// Estimated output for swapping `amount_in` of the input side. Errors
    /// surface; a quote is never approximated silently.
    pub async fn quote(
        &self,
        pool: &PoolDescriptor,
        token: Address,
        side: Side,
        amount_in: U256,
    ) -> KeeperResult<Quote> {
        match pool.version {
            PoolVersion::BondingCurve => self.quote_curve(pool, token, side, amount_in).await,
            PoolVersion::V3 | PoolVersion::V4 => {
                let price = Box::pin(self.spot_price(pool, token)).await?;
                if price.is_zero() {
                    return Err(KeeperError::upstream("pool reports zero price"));
                }
                let scale = U256::from(PRICE_SCALE);
                let amount_out = match side {
                    // Quote in, token out.
                    Side::Buy => mul_div(amount_in, scale, price)?,
                    // Token in, quote out.
                    Side::Sell => mul_div(amount_in, price, scale)?,
                };
                Ok(Quote {
                    amount_out,
                    router: pool.router,
                    kind: RouteKind::Dex,
                })
            }
        }
    }

    async fn quote_curve(
        &self,
        pool: &PoolDescriptor,
        token: Address,
        side: Side,
        amount_in: U256,
    ) -> KeeperResult<Quote> {
        let curve = pool.router;
        let is_buy = side == Side::Buy;

        let data = ICurveRouter::getAmountOutCall {
            token,
            amountIn: amount_in,
            isBuy: is_buy,
        }
        .abi_encode();
        let raw = self.chain.call(curve, Bytes::from(data), None).await?;
        let amount_out = ICurveRouter::getAmountOutCall::abi_decode_returns(&raw)
            .map_err(|e| KeeperError::upstream(format!("getAmountOut decode: {e}")))?;

        let graduated_raw = self
            .chain
            .call(
                curve,
                Bytes::from(ICurveRouter::isGraduatedCall { token }.abi_encode()),
                None,
            )
            .await?;
        let graduated = ICurveRouter::isGraduatedCall::abi_decode_returns(&graduated_raw)
            .map_err(|e| KeeperError::upstream(format!("isGraduated decode: {e}")))?;

        if graduated {
            let dex_raw = self
                .chain
                .call(
                    curve,
                    Bytes::from(ICurveRouter::dexRouterCall {}.abi_encode()),
                    None,
                )
                .await?;
            let dex = ICurveRouter::dexRouterCall::abi_decode_returns(&dex_raw)
                .map_err(|e| KeeperError::upstream(format!("dexRouter decode: {e}")))?;
            Ok(Quote {
                amount_out,
                router: dex,
                kind: RouteKind::Dex,
            })
        } else {
            Ok(Quote {
                amount_out,
                router: curve,
                kind: RouteKind::BondingCurve,
            })
        }
    }

    /// Spot price of `token` in quote-token wei per 10^18 raw token units.
    /// Concentrated-liquidity pools decode sqrtPriceX96 exactly; bonding
    /// curves quote a notional 1-unit sell.
    pub async fn spot_price(&self, pool: &PoolDescriptor, token: Address) -> KeeperResult<U256> {
        match pool.version {
            PoolVersion::V3 => {
                let address = pool
                    .pool
                    .ok_or_else(|| KeeperError::validation("v3 pool without address"))?;
                let raw = self
                    .chain
                    .call(
                        address,
                        Bytes::from(IUniswapV3Pool::slot0Call {}.abi_encode()),
                        None,
                    )
                    .await?;
                let slot0 = IUniswapV3Pool::slot0Call::abi_decode_returns(&raw)
                    .map_err(|e| KeeperError::upstream(format!("slot0 decode: {e}")))?;
                price_from_sqrt(U256::from(slot0.sqrtPriceX96), pool.token_is_token0(token))
            }
            PoolVersion::V4 => {
                let pool_id = pool
                    .pool_id
                    .ok_or_else(|| KeeperError::validation("v4 pool without poolId"))?;
                let raw = self
                    .chain
                    .call(
                        pool.router,
                        Bytes::from(IStateView::getSlot0Call { poolId: pool_id }.abi_encode()),
                        None,
                    )
                    .await?;
                let slot0 = IStateView::getSlot0Call::abi_decode_returns(&raw)
                    .map_err(|e| KeeperError::upstream(format!("getSlot0 decode: {e}")))?;
                price_from_sqrt(U256::from(slot0.sqrtPriceX96), pool.token_is_token0(token))
            }
            PoolVersion::BondingCurve => {
                let quote = self
                    .quote(pool, token, Side::Sell, U256::from(PRICE_SCALE))
                    .await?;
                Ok(quote.amount_out)
            }
        }
    }

    /// ERC-20 metadata reads batched into one request.
    pub async fn token_metadata(&self, token: Address) -> KeeperResult<(String, String, u8)> {
        let calls = vec![
            call_params(token, IERC20::nameCall {}.abi_encode()),
            call_params(token, IERC20::symbolCall {}.abi_encode()),
            call_params(token, IERC20::decimalsCall {}.abi_encode()),
        ];
        let results = self
            .chain
            .batch(calls.into_iter().map(|p| ("eth_call".to_string(), p)).collect())
            .await?;

        let mut bytes = Vec::with_capacity(3);
        for r in results {
            let v = r.map_err(KeeperError::from)?;
            let s = v
                .as_str()
                .ok_or_else(|| KeeperError::upstream("eth_call returned non-string"))?;
            bytes.push(
                s.parse::<Bytes>()
                    .map_err(|e| KeeperError::upstream(format!("eth_call bytes: {e}")))?,
            );
        }

        let name = IERC20::nameCall::abi_decode_returns(&bytes[0])
            .map_err(|e| KeeperError::upstream(format!("name decode: {e}")))?;
        let symbol = IERC20::symbolCall::abi_decode_returns(&bytes[1])
            .map_err(|e| KeeperError::upstream(format!("symbol decode: {e}")))?;
        let decimals = IERC20::decimalsCall::abi_decode_returns(&bytes[2])
            .map_err(|e| KeeperError::upstream(format!("decimals decode: {e}")))?;

        Ok((name, symbol, decimals))
    }

    pub async fn erc20_balance(&self, token: Address, account: Address) -> KeeperResult<U256> {
        let raw = self
            .chain
            .call(
                token,
                Bytes::from(IERC20::balanceOfCall { account }.abi_encode()),
                None,
            )
            .await?;
        IERC20::balanceOfCall::abi_decode_returns(&raw)
            .map_err(|e| KeeperError::upstream(format!("balanceOf decode: {e}")))
    }
}

fn call_params(to: Address, data: Vec<u8>) -> serde_json::Value {
    serde_json::json!([
        { "to": format!("{to:#x}"), "data": format!("0x{}", alloy::primitives::hex::encode(data)) },
        "latest"
    ])
}

// ── Fixed-point helpers ─────────────────────────────────────────────

/// (sqrtPriceX96)^2 / 2^192 as a 10^18-scaled price, inverted when the
/// target token sits on the token0 side.
pub fn price_from_sqrt(sqrt_price_x96: U256, token_is_token0: bool) -> KeeperResult<U256> {
    if sqrt_price_x96.is_zero() {
        return Err(KeeperError::upstream("pool not initialized (sqrtPrice = 0)"));
    }
    let sq = U512::from(sqrt_price_x96) * U512::from(sqrt_price_x96);
    let scale = U512::from(U256::from(PRICE_SCALE));

    let scaled = if token_is_token0 {
        // Price of token0 in token1: sq / 2^192, scaled.
        (sq * scale) >> 192
    } else {
        // Price of token1 in token0: inverse.
        (U512::from(1u64) << 192) * scale / sq
    };
    u512_to_u256(scaled)
}

/// a * b / denom without intermediate overflow.
pub fn mul_div(a: U256, b: U256, denom: U256) -> KeeperResult<U256> {
    if denom.is_zero() {
        return Err(KeeperError::invariant("mul_div by zero"));
    }
    let wide = U512::from(a) * U512::from(b) / U512::from(denom);
    u512_to_u256(wide)
}

fn u512_to_u256(v: U512) -> KeeperResult<U256> {
    if v > U512::from(U256::MAX) {
        return Err(KeeperError::invariant("512-bit intermediate exceeds u256"));
    }
    let limbs: [u64; 4] = v.as_limbs()[..4]
        .try_into()
        .expect("U512 always has 8 limbs");
    Ok(U256::from_limbs(limbs))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// sqrtPriceX96 for price 1.0 is exactly 2^96.
    #[test]
    fn unit_price_round_trips() {
        let one_x96 = U256::from(1u64) << 96;
        let scale = U256::from(PRICE_SCALE);
        assert_eq!(price_from_sqrt(one_x96, true).unwrap(), scale);
        assert_eq!(price_from_sqrt(one_x96, false).unwrap(), scale);
    }

    #[test]
    fn doubled_sqrt_means_quadrupled_price() {
        let two_x96 = U256::from(2u64) << 96;
        let p = price_from_sqrt(two_x96, true).unwrap();
        assert_eq!(p, U256::from(PRICE_SCALE) * U256::from(4u64));

        let inverted = price_from_sqrt(two_x96, false).unwrap();
        assert_eq!(inverted, U256::from(PRICE_SCALE) / U256::from(4u64));
    }

    #[test]
    fn mul_div_survives_wide_intermediates() {
        let a = U256::MAX / U256::from(2u64);
        let out = mul_div(a, U256::from(2u64), U256::from(2u64)).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn zero_sqrt_price_is_an_error() {
        assert!(price_from_sqrt(U256::ZERO, true).is_err());
    }
}
