mod common;

use eigenswarm::model::eigen::ConfigPatch;

use common::{fresh_registry, test_eigen};

// ── No-op patches write nothing ─────────────────────────────────────

#[tokio::test]
async fn noop_patch_leaves_updated_at_alone() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-ffff01");
    registry.create(&eigen).await.unwrap();

    let before = registry.require(&eigen.id).await.unwrap();
    let (after, changed) = registry
        .update_config(&eigen.id, &ConfigPatch::default())
        .await
        .unwrap();

    assert!(!changed);
    assert_eq!(after.updated_at, before.updated_at, "zero updatedAt drift");
}

#[tokio::test]
async fn patch_with_current_values_is_still_a_noop() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-ffff02");
    registry.create(&eigen).await.unwrap();

    let patch = ConfigPatch {
        trade_frequency: Some(eigen.config.trade_frequency),
        slippage_bps: Some(eigen.config.slippage_bps),
        ..Default::default()
    };
    let (_, changed) = registry.update_config(&eigen.id, &patch).await.unwrap();
    assert!(!changed);
}

// ── Out-of-range patches leave the previous config untouched ────────

#[tokio::test]
async fn rejected_patch_changes_nothing() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-ffff03");
    registry.create(&eigen).await.unwrap();

    let patch = ConfigPatch {
        trade_frequency: Some(10_000.0),
        spread_width_pct: Some(2.0),
        ..Default::default()
    };
    assert!(registry.update_config(&eigen.id, &patch).await.is_err());

    let after = registry.require(&eigen.id).await.unwrap();
    assert_eq!(after.config.trade_frequency, eigen.config.trade_frequency);
    assert_eq!(after.config.spread_width_pct, eigen.config.spread_width_pct);
}

#[tokio::test]
async fn real_changes_bump_updated_at_and_apply() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-ffff04");
    registry.create(&eigen).await.unwrap();

    let patch = ConfigPatch {
        spread_width_pct: Some(1.5),
        reactive_sell_mode: Some(true),
        reactive_sell_pct: Some(35),
        ..Default::default()
    };
    let (after, changed) = registry.update_config(&eigen.id, &patch).await.unwrap();
    assert!(changed);
    assert_eq!(after.config.spread_width_pct, 1.5);
    assert!(after.config.reactive_sell_mode);
    assert_eq!(after.config.reactive_sell_pct, 35);
    // Untouched fields survive.
    assert_eq!(after.config.wallet_count, eigen.config.wallet_count);
}
