use std::time::Duration;

use alloy::primitives::U256;
use rand::Rng;
use rand::rngs::StdRng;

use crate::error::KeeperResult;
use crate::model::eigen::{Eigen, PRICE_SCALE, u256_to_f64};
use crate::model::trade::TradeKind;
use crate::quote::{Side, mul_div};

/// Jitter band around the nominal cadence, ±30 %.
const JITTER_LOW: f64 = 0.7;
const JITTER_HIGH: f64 = 1.3;

/// Positions below this ETH value are dust: a sell that would strand less
/// than this is raised to clear the position instead.
pub const DUST_FLOOR_WEI: u64 = 10_000_000_000_000; // 0.00001 ETH

/// Gas headroom kept out of the sizable balance per planned action.
pub const GAS_HEADROOM_WEI: u64 = 2_000_000_000_000_000; // 0.002 ETH

/// Snapshot the planner works from. Everything is read before planning;
/// the plan never touches live state.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub eigen: Eigen,
    /// Current spot, quote-token wei per 10^18 raw token units.
    pub spot_wei: U256,
    /// Largest external buy observed on the pool inside the last cadence
    /// window, raw token units.
    pub external_buy_raw: Option<U256>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Wait(Duration),
    Trade(PlannedTrade),
    StartLiquidation(LiquidationTrigger),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidationTrigger {
    StopLoss,
    VolumeExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrade {
    pub kind: TradeKind,
    pub side: Side,
    /// Buys: quote wei in. Sells: raw token units in.
    pub amount_in: U256,
    /// Budget moved to `reserved` for the duration of the action.
    pub reserve_wei: U256,
    /// Worst acceptable execution price: sells at or above, buys at or
    /// below. Half the configured spread away from the planning-time spot.
    pub limit_price_wei: U256,
}

/// Jittered pause until the next planned action.
pub fn cadence_wait(eigen: &Eigen, rng: &mut StdRng) -> Duration {
    let nominal = eigen.config.cadence_secs();
    let factor = rng.random_range(JITTER_LOW..=JITTER_HIGH);
    Duration::from_secs_f64((nominal * factor).max(1.0))
}

/// Decide the next action from a snapshot. Deterministic: the same snapshot
/// and the same PRNG state always produce the same plan.
pub fn plan_next(ctx: &PlanContext, rng: &mut StdRng) -> KeeperResult<PlannedAction> {
    let eigen = &ctx.eigen;
    let config = &eigen.config;
    let spot = ctx.spot_wei;
    let scale = U256::from(PRICE_SCALE);

    // Stop loss beats everything: no further trade, drain instead.
    let pnl_pct = eigen.unrealized_pnl_pct(spot);
    if !eigen.token_balance.is_zero() && pnl_pct <= -config.stop_loss_pct {
        return Ok(PlannedAction::StartLiquidation(LiquidationTrigger::StopLoss));
    }

    let sell_limit = price_with_spread(spot, config.spread_width_pct, Side::Sell);
    let buy_limit = price_with_spread(spot, config.spread_width_pct, Side::Buy);

    // Profit take: realize the spread once the open position is ahead.
    if !eigen.token_balance.is_zero() && pnl_pct >= config.profit_target_pct {
        let planned = sized_sell_tokens(ctx, rng)?;
        let amount = planned.min(eigen.token_balance);
        if !amount.is_zero() {
            return Ok(PlannedAction::Trade(PlannedTrade {
                kind: TradeKind::ProfitTake,
                side: Side::Sell,
                amount_in: apply_dust_floor(eigen, amount, spot)?,
                reserve_wei: U256::from(GAS_HEADROOM_WEI),
                limit_price_wei: sell_limit,
            }));
        }
    }

    // Reactive mode: mirror an observed external buy with a sell.
    if config.reactive_sell_mode {
        if let Some(external) = ctx.external_buy_raw {
            let mirrored = external * U256::from(config.reactive_sell_pct) / U256::from(100u64);
            let amount = mirrored.min(eigen.token_balance);
            if !amount.is_zero() {
                return Ok(PlannedAction::Trade(PlannedTrade {
                    kind: TradeKind::Sell,
                    side: Side::Sell,
                    amount_in: apply_dust_floor(eigen, amount, spot)?,
                    reserve_wei: U256::from(GAS_HEADROOM_WEI),
                    limit_price_wei: sell_limit,
                }));
            }
        }
    }

    // Direction: inventory ratio first, spread policy otherwise.
    let token_value = mul_div(eigen.token_balance, spot, scale)?;
    let total = token_value + eigen.balance_wei;
    let ratio = if total.is_zero() {
        0.0
    } else {
        u256_to_f64(token_value) / u256_to_f64(total)
    };

    let (side, kind) = if ratio > config.rebalance_threshold {
        (Side::Sell, TradeKind::Rebalance)
    } else if ratio < 1.0 - config.rebalance_threshold {
        (Side::Buy, TradeKind::Rebalance)
    } else if rng.random_bool(0.5) {
        (Side::Sell, TradeKind::Sell)
    } else {
        (Side::Buy, TradeKind::Buy)
    };

    match side {
        Side::Buy => {
            let size = sized_buy_wei(ctx, rng);
            if size.is_zero() {
                return Ok(PlannedAction::Wait(cadence_wait(eigen, rng)));
            }
            Ok(PlannedAction::Trade(PlannedTrade {
                kind,
                side: Side::Buy,
                amount_in: size,
                reserve_wei: size + U256::from(GAS_HEADROOM_WEI),
                limit_price_wei: buy_limit,
            }))
        }
        Side::Sell => {
            let tokens = sized_sell_tokens(ctx, rng)?.min(eigen.token_balance);
            if tokens.is_zero() {
                // Nothing to sell; an empty book waits rather than forcing
                // the other direction against the inventory bias.
                return Ok(PlannedAction::Wait(cadence_wait(eigen, rng)));
            }
            Ok(PlannedAction::Trade(PlannedTrade {
                kind,
                side: Side::Sell,
                amount_in: apply_dust_floor(eigen, tokens, spot)?,
                reserve_wei: U256::from(GAS_HEADROOM_WEI),
                limit_price_wei: sell_limit,
            }))
        }
    }
}

// ── Sizing ──────────────────────────────────────────────────────────

/// Buy size in quote wei: the smaller of the absolute band sample and the
/// percent-of-balance sample, clipped to the spendable balance.
fn sized_buy_wei(ctx: &PlanContext, rng: &mut StdRng) -> U256 {
    let config = &ctx.eigen.config;
    let absolute = uniform_u256(rng, config.order_size_min_wei, config.order_size_max_wei);

    let pct = rng.random_range(config.order_size_min_pct..=config.order_size_max_pct);
    let by_pct = mul_f64(ctx.eigen.balance_wei, pct / 100.0);

    let spendable = ctx
        .eigen
        .balance_wei
        .saturating_sub(U256::from(GAS_HEADROOM_WEI));
    absolute.min(by_pct).min(spendable)
}

/// Sell size in raw token units, from the same two-band rule with the
/// absolute band converted through spot.
fn sized_sell_tokens(ctx: &PlanContext, rng: &mut StdRng) -> KeeperResult<U256> {
    let config = &ctx.eigen.config;
    let scale = U256::from(PRICE_SCALE);

    let absolute_wei = uniform_u256(rng, config.order_size_min_wei, config.order_size_max_wei);
    let absolute_tokens = if ctx.spot_wei.is_zero() {
        U256::ZERO
    } else {
        mul_div(absolute_wei, scale, ctx.spot_wei)?
    };

    let pct = rng.random_range(config.order_size_min_pct..=config.order_size_max_pct);
    let by_pct = mul_f64(ctx.eigen.token_balance, pct / 100.0);

    Ok(absolute_tokens.min(by_pct))
}

/// A sell that would strand a dust position clears it entirely.
fn apply_dust_floor(eigen: &Eigen, tokens: U256, spot: U256) -> KeeperResult<U256> {
    let scale = U256::from(PRICE_SCALE);
    let remaining = eigen.token_balance.saturating_sub(tokens);
    if remaining.is_zero() {
        return Ok(tokens);
    }
    let remaining_value = mul_div(remaining, spot, scale)?;
    if remaining_value < U256::from(DUST_FLOOR_WEI) {
        Ok(eigen.token_balance)
    } else {
        Ok(tokens)
    }
}

fn price_with_spread(spot: U256, spread_pct: f64, side: Side) -> U256 {
    let half = spread_pct / 200.0;
    match side {
        Side::Sell => mul_f64(spot, 1.0 - half),
        Side::Buy => mul_f64(spot, 1.0 + half),
    }
}

/// Uniform sample in [min, max]. Order sizes comfortably fit u128.
fn uniform_u256(rng: &mut StdRng, min: U256, max: U256) -> U256 {
    if max <= min {
        return min;
    }
    let lo: u128 = min.try_into().unwrap_or(u128::MAX);
    let hi: u128 = max.try_into().unwrap_or(u128::MAX);
    if hi <= lo {
        return min;
    }
    U256::from(rng.random_range(lo..=hi))
}

fn mul_f64(v: U256, factor: f64) -> U256 {
    if factor <= 0.0 {
        return U256::ZERO;
    }
    // Scale through parts-per-billion to stay in integer math.
    let ppb = (factor * 1e9) as u128;
    v * U256::from(ppb) / U256::from(1_000_000_000u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, I256};
    use rand::SeedableRng;

    use crate::model::eigen::{EigenClass, EigenStatus};
    use crate::model::pool::{PoolDescriptor, PoolVersion};

    fn test_eigen() -> Eigen {
        let class = EigenClass::Core;
        Eigen {
            id: "ES-ab12cd".into(),
            owner: Address::repeat_byte(1),
            agent_identity: None,
            chain_id: 143,
            token: Address::repeat_byte(2),
            pool: PoolDescriptor {
                version: PoolVersion::V3,
                pool: Some(Address::repeat_byte(3)),
                pool_id: None,
                token0: Address::repeat_byte(2),
                token1: Address::repeat_byte(4),
                fee: 3000,
                tick_spacing: Some(60),
                router: Address::repeat_byte(5),
            },
            class,
            config: class.default_config(),
            deposited_wei: U256::from(10u64).pow(U256::from(17u64)),
            balance_wei: U256::from(10u64).pow(U256::from(17u64)),
            reserved_wei: U256::ZERO,
            token_balance: U256::ZERO,
            average_entry_wei: U256::ZERO,
            realized_pnl_wei: I256::ZERO,
            gas_spent_wei: U256::ZERO,
            fee_accrued_wei: U256::ZERO,
            volume_produced_wei: U256::ZERO,
            volume_cap_wei: U256::from(10u64).pow(U256::from(18u64)),
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
            status: EigenStatus::Active,
            created_at: 0,
            updated_at: 0,
            terminated_at: None,
            expires_at: i64::MAX,
        }
    }

    fn spot() -> U256 {
        // 0.0001 ETH per whole token.
        U256::from(100_000_000_000_000u64)
    }

    #[test]
    fn planning_is_deterministic_for_a_fixed_seed() {
        let ctx = PlanContext {
            eigen: test_eigen(),
            spot_wei: spot(),
            external_buy_raw: None,
        };
        let a = plan_next(&ctx, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = plan_next(&ctx, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_position_plans_a_buy() {
        let ctx = PlanContext {
            eigen: test_eigen(),
            spot_wei: spot(),
            external_buy_raw: None,
        };
        // Inventory ratio 0 < 1 - threshold: forced buy regardless of seed.
        for seed in 0..8 {
            match plan_next(&ctx, &mut StdRng::seed_from_u64(seed)).unwrap() {
                PlannedAction::Trade(t) => {
                    assert_eq!(t.side, Side::Buy);
                    assert_eq!(t.kind, TradeKind::Rebalance);
                    assert!(t.amount_in <= ctx.eigen.config.order_size_max_wei);
                    assert!(t.reserve_wei > t.amount_in);
                }
                other => panic!("expected buy, got {other:?}"),
            }
        }
    }

    #[test]
    fn heavy_inventory_forces_a_sell() {
        let mut eigen = test_eigen();
        // 1e21 raw tokens at 1e14 spot = 0.1 ETH value vs 0.001 ETH free.
        eigen.token_balance = U256::from(10u64).pow(U256::from(21u64));
        eigen.average_entry_wei = spot();
        eigen.balance_wei = U256::from(10u64).pow(U256::from(15u64));
        let ctx = PlanContext {
            eigen,
            spot_wei: spot(),
            external_buy_raw: None,
        };
        for seed in 0..8 {
            match plan_next(&ctx, &mut StdRng::seed_from_u64(seed)).unwrap() {
                PlannedAction::Trade(t) => assert_eq!(t.side, Side::Sell),
                other => panic!("expected sell, got {other:?}"),
            }
        }
    }

    #[test]
    fn stop_loss_starts_liquidation() {
        let mut eigen = test_eigen();
        eigen.token_balance = U256::from(10u64).pow(U256::from(21u64));
        // Entry at 2x current spot: 50 % underwater, stop loss is 25 %.
        eigen.average_entry_wei = spot() * U256::from(2u64);
        let ctx = PlanContext {
            eigen,
            spot_wei: spot(),
            external_buy_raw: None,
        };
        assert_eq!(
            plan_next(&ctx, &mut StdRng::seed_from_u64(1)).unwrap(),
            PlannedAction::StartLiquidation(LiquidationTrigger::StopLoss)
        );
    }

    #[test]
    fn profit_target_takes_profit() {
        let mut eigen = test_eigen();
        eigen.token_balance = U256::from(10u64).pow(U256::from(20u64));
        // Entry well below spot: +100 % unrealized, target 12 %.
        eigen.average_entry_wei = spot() / U256::from(2u64);
        let ctx = PlanContext {
            eigen,
            spot_wei: spot(),
            external_buy_raw: None,
        };
        match plan_next(&ctx, &mut StdRng::seed_from_u64(3)).unwrap() {
            PlannedAction::Trade(t) => {
                assert_eq!(t.kind, TradeKind::ProfitTake);
                assert!(t.amount_in <= ctx.eigen.token_balance);
            }
            other => panic!("expected profit take, got {other:?}"),
        }
    }

    #[test]
    fn reactive_mode_mirrors_external_buys() {
        let mut eigen = test_eigen();
        eigen.config.reactive_sell_mode = true;
        eigen.config.reactive_sell_pct = 50;
        eigen.config.rebalance_threshold = 1.0;
        eigen.token_balance = U256::from(10u64).pow(U256::from(21u64));
        eigen.average_entry_wei = spot();
        let external = U256::from(4_000_000_000_000_000_000u64);
        let ctx = PlanContext {
            eigen,
            spot_wei: spot(),
            external_buy_raw: Some(external),
        };
        match plan_next(&ctx, &mut StdRng::seed_from_u64(9)).unwrap() {
            PlannedAction::Trade(t) => {
                assert_eq!(t.side, Side::Sell);
                assert_eq!(t.amount_in, external / U256::from(2u64));
            }
            other => panic!("expected reactive sell, got {other:?}"),
        }
    }

    #[test]
    fn dust_remainder_clears_the_position() {
        let mut eigen = test_eigen();
        // Tiny position worth just above the dust floor.
        eigen.token_balance = U256::from(200_000_000_000_000_000u64); // 0.2 tokens
        let tokens = U256::from(150_000_000_000_000_000u64);
        // Remainder would be 0.05 tokens * 1e14 / 1e18 = 5e9 wei < dust floor.
        let cleared = apply_dust_floor(&eigen, tokens, spot()).unwrap();
        assert_eq!(cleared, eigen.token_balance);
    }

    #[test]
    fn cadence_jitter_stays_in_band() {
        let eigen = test_eigen();
        let nominal = eigen.config.cadence_secs();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let wait = cadence_wait(&eigen, &mut rng).as_secs_f64();
            assert!(wait >= nominal * JITTER_LOW - 1.0);
            assert!(wait <= nominal * JITTER_HIGH + 1.0);
        }
    }
}
