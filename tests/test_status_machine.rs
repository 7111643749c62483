mod common;

use eigenswarm::error::KeeperError;
use eigenswarm::model::eigen::EigenStatus;

use common::{fresh_registry, test_eigen};

// ── Registry-level transitions ──────────────────────────────────────

#[tokio::test]
async fn happy_path_purchase_to_closed() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-aaaa01");
    registry.create(&eigen).await.unwrap();

    for (from, to) in [
        (EigenStatus::PendingFunding, EigenStatus::Active),
        (EigenStatus::Active, EigenStatus::Liquidating),
        (EigenStatus::Liquidating, EigenStatus::Liquidated),
        (EigenStatus::Liquidated, EigenStatus::Terminated),
        (EigenStatus::Terminated, EigenStatus::Closed),
    ] {
        let updated = registry.transition(&eigen.id, from, to).await.unwrap();
        assert_eq!(updated.status, to);
    }

    let e = registry.require(&eigen.id).await.unwrap();
    assert!(e.terminated_at.is_some());
}

#[tokio::test]
async fn cas_rejects_stale_from_state() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-aaaa02");
    registry.create(&eigen).await.unwrap();

    registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap();

    // The eigen is no longer pending; the same edge must not apply twice.
    let err = registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::Validation(_)));
}

#[tokio::test]
async fn terminal_states_reject_reactivation() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-aaaa03");
    registry.create(&eigen).await.unwrap();

    registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap();
    registry
        .transition(&eigen.id, EigenStatus::Active, EigenStatus::Liquidating)
        .await
        .unwrap();
    registry
        .transition(&eigen.id, EigenStatus::Liquidating, EigenStatus::Liquidated)
        .await
        .unwrap();

    for target in [EigenStatus::Active, EigenStatus::Suspended] {
        assert!(
            registry
                .transition(&eigen.id, EigenStatus::Liquidated, target)
                .await
                .is_err(),
            "liquidated -> {target} must be rejected"
        );
    }
}

#[tokio::test]
async fn suspend_resume_cycle_preserves_counters() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-aaaa04");
    registry.create(&eigen).await.unwrap();

    registry
        .transition(&eigen.id, EigenStatus::PendingFunding, EigenStatus::Active)
        .await
        .unwrap();
    registry.fund(&eigen.id, common::eth(100)).await.unwrap();

    registry
        .transition(&eigen.id, EigenStatus::Active, EigenStatus::Suspended)
        .await
        .unwrap();
    let resumed = registry
        .transition(&eigen.id, EigenStatus::Suspended, EigenStatus::Active)
        .await
        .unwrap();

    assert_eq!(resumed.status, EigenStatus::Active);
    assert_eq!(resumed.deposited_wei, common::eth(100));
    assert_eq!(resumed.balance_wei, common::eth(100));
}

#[tokio::test]
async fn unknown_eigen_is_reported_as_such() {
    let (registry, _db) = fresh_registry().await;
    let err = registry
        .transition("ES-nope00", EigenStatus::Active, EigenStatus::Suspended)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown eigen"));
}
