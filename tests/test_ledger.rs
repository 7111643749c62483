mod common;

use alloy::primitives::{B256, I256, U256};

use eigenswarm::model::eigen::EigenStatus;
use eigenswarm::model::trade::{TradeKind, TradeStatus};
use eigenswarm::registry::TradeSettlement;

use common::{eth, fresh_registry, test_eigen};

fn wei(v: u64) -> U256 {
    U256::from(v)
}

// ── Budget conservation through a full buy/sell round ───────────────

#[tokio::test]
async fn ledger_conserved_through_buy_and_sell() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-bbbb01");
    registry.create(&eigen).await.unwrap();
    registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap();

    registry.fund(&eigen.id, eth(100)).await.unwrap(); // 0.1 ETH

    // Reserve, then settle a confirmed buy.
    registry.reserve(&eigen.id, eth(10)).await.unwrap();
    let mid = registry.require(&eigen.id).await.unwrap();
    assert_eq!(mid.balance_wei, eth(90));
    assert_eq!(mid.reserved_wei, eth(10));

    let buy = TradeSettlement {
        kind: TradeKind::Buy,
        wallet_index: 0,
        eth_amount_wei: eth(9),
        token_amount_raw: wei(9_000_000_000_000_000_000), // 9 tokens
        price_eth: 0.001,
        price_wei: wei(1_000_000_000_000_000), // 0.001 ETH per token
        tx_hash: Some(B256::repeat_byte(1)),
        status: TradeStatus::Confirmed,
        gas_cost_wei: wei(500_000_000_000_000),
        fee_wei: wei(90_000_000_000_000),
        revert_reason: None,
    };
    let delta = registry
        .commit_settlement(&eigen.id, eth(10), &buy)
        .await
        .unwrap();
    assert_eq!(delta, I256::ZERO, "buys realize nothing");

    let after_buy = registry.require(&eigen.id).await.unwrap();
    assert_eq!(after_buy.reserved_wei, U256::ZERO);
    assert_eq!(after_buy.token_balance, buy.token_amount_raw);
    assert_eq!(after_buy.average_entry_wei, buy.price_wei);
    assert_eq!(after_buy.buy_count, 1);
    assert_eq!(after_buy.volume_produced_wei, eth(9));

    let (expected, actual) = registry.reconcile(&eigen.id).await.unwrap();
    assert_eq!(expected, actual, "conservation after the buy");

    // Sell 4 tokens above entry: realizes exactly the spread.
    registry.reserve(&eigen.id, eth(2)).await.unwrap();
    let sell = TradeSettlement {
        kind: TradeKind::Sell,
        wallet_index: 1,
        eth_amount_wei: eth(5),
        token_amount_raw: wei(4_000_000_000_000_000_000),
        price_eth: 0.00125,
        price_wei: wei(1_250_000_000_000_000),
        tx_hash: Some(B256::repeat_byte(2)),
        status: TradeStatus::Confirmed,
        gas_cost_wei: wei(400_000_000_000_000),
        fee_wei: wei(50_000_000_000_000),
        revert_reason: None,
    };
    let delta = registry
        .commit_settlement(&eigen.id, eth(2), &sell)
        .await
        .unwrap();
    assert_eq!(delta, I256::try_from(eth(1)).unwrap());

    let after_sell = registry.require(&eigen.id).await.unwrap();
    assert_eq!(
        after_sell.token_balance,
        wei(5_000_000_000_000_000_000),
        "position shrinks by the sold amount"
    );
    // Weighted-average entry survives a partial sell.
    assert_eq!(after_sell.average_entry_wei, buy.price_wei);
    assert_eq!(after_sell.realized_pnl_wei, I256::try_from(eth(1)).unwrap());
    assert_eq!(after_sell.sell_count, 1);
    assert_eq!(after_sell.volume_produced_wei, eth(14));

    let (expected, actual) = registry.reconcile(&eigen.id).await.unwrap();
    assert_eq!(expected, actual, "conservation after the sell");

    let trades = registry.trades(&eigen.id, 10, 0).await.unwrap();
    assert_eq!(trades.len(), 2);
}

#[tokio::test]
async fn reverted_trade_charges_gas_only() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-bbbb02");
    registry.create(&eigen).await.unwrap();
    registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap();
    registry.fund(&eigen.id, eth(50)).await.unwrap();

    registry.reserve(&eigen.id, eth(5)).await.unwrap();
    let reverted = TradeSettlement {
        kind: TradeKind::Buy,
        wallet_index: 0,
        eth_amount_wei: U256::ZERO,
        token_amount_raw: U256::ZERO,
        price_eth: 0.0,
        price_wei: U256::ZERO,
        tx_hash: Some(B256::repeat_byte(3)),
        status: TradeStatus::Reverted,
        gas_cost_wei: wei(300_000_000_000_000),
        fee_wei: U256::ZERO,
        revert_reason: Some("SlippageExceeded(90, 100)".into()),
    };
    registry
        .commit_settlement(&eigen.id, eth(5), &reverted)
        .await
        .unwrap();

    let after = registry.require(&eigen.id).await.unwrap();
    assert_eq!(after.reserved_wei, U256::ZERO);
    assert_eq!(after.balance_wei, eth(50) - wei(300_000_000_000_000));
    assert_eq!(after.token_balance, U256::ZERO);
    assert_eq!(after.buy_count, 0, "reverted trades do not count as fills");
    assert_eq!(after.trade_count, 1, "but they are logged");

    let (expected, actual) = registry.reconcile(&eigen.id).await.unwrap();
    assert_eq!(expected, actual);

    let trades = registry.trades(&eigen.id, 10, 0).await.unwrap();
    assert_eq!(trades[0].status, TradeStatus::Reverted);
    assert!(trades[0].revert_reason.as_deref().unwrap().contains("SlippageExceeded"));
}

#[tokio::test]
async fn reserve_beyond_balance_is_refused() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-bbbb03");
    registry.create(&eigen).await.unwrap();
    registry.fund(&eigen.id, eth(1)).await.unwrap();

    assert!(registry.reserve(&eigen.id, eth(2)).await.is_err());
    let unchanged = registry.require(&eigen.id).await.unwrap();
    assert_eq!(unchanged.balance_wei, eth(1));
    assert_eq!(unchanged.reserved_wei, U256::ZERO);
}

#[tokio::test]
async fn release_returns_reservation_intact() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-bbbb04");
    registry.create(&eigen).await.unwrap();
    registry.fund(&eigen.id, eth(10)).await.unwrap();

    registry.reserve(&eigen.id, eth(4)).await.unwrap();
    registry.release(&eigen.id, eth(4)).await.unwrap();

    let e = registry.require(&eigen.id).await.unwrap();
    assert_eq!(e.balance_wei, eth(10));
    assert_eq!(e.reserved_wei, U256::ZERO);

    // Releasing more than is reserved is an invariant violation.
    assert!(registry.release(&eigen.id, eth(1)).await.is_err());
}

#[tokio::test]
async fn selling_more_than_the_position_is_refused() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-bbbb05");
    registry.create(&eigen).await.unwrap();
    registry.fund(&eigen.id, eth(10)).await.unwrap();

    let sell = TradeSettlement {
        kind: TradeKind::Sell,
        wallet_index: 0,
        eth_amount_wei: eth(1),
        token_amount_raw: wei(1_000_000_000_000_000_000),
        price_eth: 0.001,
        price_wei: wei(1_000_000_000_000_000),
        tx_hash: None,
        status: TradeStatus::Confirmed,
        gas_cost_wei: U256::ZERO,
        fee_wei: U256::ZERO,
        revert_reason: None,
    };
    let err = registry
        .commit_settlement(&eigen.id, U256::ZERO, &sell)
        .await
        .unwrap_err();
    assert!(!err.is_recoverable(), "oversell is an invariant violation");
}
