mod common;

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};

use eigenswarm::chain::ChainClient;
use eigenswarm::error::{KeeperError, PaymentCode};
use eigenswarm::model::payment::{PaymentScheme, PaymentState};
use eigenswarm::payment::{
    PaymentGateway, authorization_payment_id, base64_decode, base64_encode, direct_payment_id,
};
use eigenswarm::registry::Db;

use common::addr;

fn gateway(db: Db) -> PaymentGateway {
    let chain = Arc::new(
        ChainClient::new(vec!["http://127.0.0.1:0".into()], 143).expect("client"),
    );
    PaymentGateway::new(
        db,
        chain,
        "http://127.0.0.1:0/settle".into(),
        addr(0x42),
        addr(0x75),
        2,
    )
}

async fn insert_payment(db: &Db, id: &str, state: &str, verified_at: i64) {
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO payments (id, payer, recipient, amount, chain_id, scheme, state,
                               created_at, verified_at)
         VALUES (?1, ?2, ?3, '1000000', 143, 'direct', ?4, ?5, ?5)",
        rusqlite::params![
            id,
            format!("{:#x}", addr(0x99)),
            format!("{:#x}", addr(0x42)),
            state,
            verified_at,
        ],
    )
    .unwrap();
}

// ── Consume is a CAS: one payment, one eigen ────────────────────────

#[tokio::test]
async fn consume_links_exactly_one_eigen() {
    let (_registry, db) = common::fresh_registry().await;
    let gateway = gateway(db.clone());
    let now = chrono::Utc::now().timestamp();
    insert_payment(&db, "pay-1", "verified", now).await;

    gateway.consume("pay-1", "ES-dddd01").await.unwrap();

    // Second consume, same or different eigen: replay.
    let err = gateway.consume("pay-1", "ES-dddd02").await.unwrap_err();
    match err {
        KeeperError::Payment { code, message } => {
            assert_eq!(code, PaymentCode::AlreadyConsumed);
            assert_eq!(message, "pay-1");
        }
        other => panic!("expected payment error, got {other}"),
    }

    let record = gateway.get("pay-1").await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Consumed);
    assert_eq!(record.eigen_id.as_deref(), Some("ES-dddd01"));
    assert_eq!(record.scheme, PaymentScheme::Direct);
}

#[tokio::test]
async fn release_reopens_an_unconsumed_payment() {
    let (_registry, db) = common::fresh_registry().await;
    let gateway = gateway(db.clone());
    let now = chrono::Utc::now().timestamp();
    insert_payment(&db, "pay-2", "verified", now).await;

    gateway.release("pay-2").await.unwrap();
    let record = gateway.get("pay-2").await.unwrap().unwrap();
    assert_eq!(record.state, PaymentState::Failed);

    // A failed payment cannot be consumed.
    assert!(gateway.consume("pay-2", "ES-dddd03").await.is_err());
}

#[tokio::test]
async fn consuming_unknown_payment_is_a_bad_proof() {
    let (_registry, db) = common::fresh_registry().await;
    let gateway = gateway(db);
    let err = gateway.consume("no-such", "ES-dddd04").await.unwrap_err();
    match err {
        KeeperError::Payment { code, .. } => assert_eq!(code, PaymentCode::BadProof),
        other => panic!("unexpected: {other}"),
    }
}

// ── Payment ids ─────────────────────────────────────────────────────

#[test]
fn direct_ids_are_chain_scoped() {
    let hash = B256::repeat_byte(0x77);
    assert_ne!(direct_payment_id(hash, 143), direct_payment_id(hash, 1));
    assert_eq!(direct_payment_id(hash, 143), direct_payment_id(hash, 143));
}

#[test]
fn authorization_ids_cover_the_whole_payload() {
    let a = br#"{"from":"0x01","value":"1000000","nonce":"0xaa"}"#;
    let b = br#"{"from":"0x01","value":"1000000","nonce":"0xab"}"#;
    assert_ne!(authorization_payment_id(a), authorization_payment_id(b));
}

// ── Header payload encoding ─────────────────────────────────────────

#[test]
fn x_payment_payload_round_trips_base64() {
    let payload = serde_json::json!({
        "from": format!("{:#x}", Address::repeat_byte(9)),
        "to": format!("{:#x}", Address::repeat_byte(0x42)),
        "value": U256::from(1_000_000u64).to_string(),
        "validAfter": 0,
        "validBefore": 2_000_000_000i64,
        "nonce": format!("{:#x}", B256::repeat_byte(5)),
        "signature": "0x00",
    });
    let raw = serde_json::to_vec(&payload).unwrap();
    let header = base64_encode(&raw);
    let decoded = base64_decode(&header).unwrap();
    assert_eq!(decoded, raw);

    let parsed: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(parsed["value"], "1000000");
}
