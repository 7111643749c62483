mod common;

use alloy::primitives::U256;
use rand::SeedableRng;
use rand::rngs::StdRng;

use eigenswarm::model::eigen::EigenStatus;
use eigenswarm::scheduler::plan::{PlanContext, PlannedAction, cadence_wait, plan_next};

use common::{eth, test_eigen};

fn spot() -> U256 {
    U256::from(100_000_000_000_000u64) // 0.0001 ETH per token
}

fn funded_ctx(id: &str) -> PlanContext {
    let mut eigen = test_eigen(id);
    eigen.status = EigenStatus::Active;
    eigen.deposited_wei = eth(100);
    eigen.balance_wei = eth(100);
    PlanContext {
        eigen,
        spot_wei: spot(),
        external_buy_raw: None,
    }
}

// ── Determinism ─────────────────────────────────────────────────────

#[test]
fn identical_snapshot_and_seed_give_identical_plans() {
    let ctx = funded_ctx("ES-cccc01");
    for seed in [0u64, 1, 7, 42, 1337] {
        let a = plan_next(&ctx, &mut StdRng::seed_from_u64(seed)).unwrap();
        let b = plan_next(&ctx, &mut StdRng::seed_from_u64(seed)).unwrap();
        assert_eq!(a, b, "seed {seed}");
    }
}

#[test]
fn consecutive_draws_from_one_rng_still_replay() {
    let ctx = funded_ctx("ES-cccc02");
    let mut rng1 = StdRng::seed_from_u64(99);
    let mut rng2 = StdRng::seed_from_u64(99);
    for _ in 0..20 {
        assert_eq!(
            plan_next(&ctx, &mut rng1).unwrap(),
            plan_next(&ctx, &mut rng2).unwrap()
        );
    }
}

// ── Cadence bound ───────────────────────────────────────────────────

/// At tradeFrequency = 1/h the jitter band is ±30 %, so a 24 h window can
/// never fit more than ⌈86400 / 2520⌉ actions, and typical seeds stay at
/// 26 or fewer.
#[test]
fn one_per_hour_cadence_caps_daily_actions() {
    let mut eigen = test_eigen("ES-cccc03");
    eigen.config.trade_frequency = 1.0;

    let mut counts = Vec::new();
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut elapsed = 0.0f64;
        let mut actions = 0u32;
        while elapsed < 86_400.0 {
            elapsed += cadence_wait(&eigen, &mut rng).as_secs_f64();
            actions += 1;
        }
        assert!(
            actions <= 35,
            "seed {seed}: {actions} actions breaks the hard jitter bound"
        );
        assert!(actions >= 18, "seed {seed} scheduled only {actions}");
        counts.push(actions);
    }

    let mean = counts.iter().sum::<u32>() as f64 / counts.len() as f64;
    assert!(
        mean <= 26.0,
        "mean daily actions {mean} exceeds the cadence budget"
    );
}

// ── Single-wallet configs still trade ───────────────────────────────

#[test]
fn wallet_count_one_still_plans_trades() {
    let mut ctx = funded_ctx("ES-cccc04");
    ctx.eigen.config.wallet_count = 1;
    ctx.eigen.config.validate().unwrap();

    match plan_next(&ctx, &mut StdRng::seed_from_u64(5)).unwrap() {
        PlannedAction::Trade(t) => {
            assert!(!t.amount_in.is_zero());
        }
        other => panic!("expected a trade, got {other:?}"),
    }
}

// ── Sizing respects both bands ──────────────────────────────────────

#[test]
fn buy_size_stays_within_the_absolute_band() {
    let ctx = funded_ctx("ES-cccc05");
    let min = ctx.eigen.config.order_size_min_wei;
    let max = ctx.eigen.config.order_size_max_wei;

    for seed in 0..32u64 {
        if let PlannedAction::Trade(t) = plan_next(&ctx, &mut StdRng::seed_from_u64(seed)).unwrap()
        {
            assert!(t.amount_in <= max, "seed {seed}: {} > {max}", t.amount_in);
            // The percent band can only shrink the absolute sample.
            assert!(
                t.amount_in <= ctx.eigen.balance_wei,
                "never exceeds balance"
            );
            let _ = min;
        }
    }
}

#[test]
fn empty_budget_waits_instead_of_trading() {
    let mut ctx = funded_ctx("ES-cccc06");
    ctx.eigen.balance_wei = U256::ZERO;
    ctx.eigen.deposited_wei = U256::ZERO;

    match plan_next(&ctx, &mut StdRng::seed_from_u64(3)).unwrap() {
        PlannedAction::Wait(_) => {}
        other => panic!("expected wait on empty budget, got {other:?}"),
    }
}
