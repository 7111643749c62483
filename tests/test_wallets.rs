mod common;

use alloy::primitives::{Address, Bytes, U256};

use eigenswarm::wallet::{TxParams, WalletSet, derive_address};

use common::{addr, fresh_registry, test_eigen};

const SECRET: &str = "integration-master-secret";

// ── Restart safety ──────────────────────────────────────────────────

/// No key database exists: the registry stores only (index, address), and
/// a re-derivation after restart must land on the same addresses.
#[tokio::test]
async fn recorded_addresses_survive_a_restart() {
    let (registry, _db) = fresh_registry().await;
    let eigen = test_eigen("ES-eeee01");
    registry.create(&eigen).await.unwrap();

    let set = WalletSet::derive(SECRET, &eigen.id, eigen.chain_id, 4, vec![addr(0x40)]).unwrap();
    registry.put_wallets(&eigen.id, &set.addresses()).await.unwrap();

    // "Restart": derive from scratch and compare with the records.
    let rederived = WalletSet::derive(SECRET, &eigen.id, eigen.chain_id, 4, vec![addr(0x40)]).unwrap();
    let stored = registry.wallets(&eigen.id).await.unwrap();
    assert_eq!(stored, rederived.addresses());
}

#[test]
fn each_index_and_eigen_gets_its_own_key() {
    let mut seen = std::collections::HashSet::new();
    for eigen_id in ["ES-eeee02", "ES-eeee03", "ES-eeee04"] {
        for index in 0..20 {
            let address = derive_address(SECRET, eigen_id, index).unwrap();
            assert!(seen.insert(address), "collision at {eigen_id}#{index}");
        }
    }
}

// ── Signing boundary ────────────────────────────────────────────────

#[test]
fn signed_transactions_carry_the_expected_envelope() {
    let set = WalletSet::derive(SECRET, "ES-eeee05", 143, 2, vec![addr(0x40)]).unwrap();
    let signed = set
        .sign(&TxParams {
            wallet_index: 1,
            to: addr(0x40),
            value: U256::from(1_000_000_000_000_000u64),
            data: Bytes::from(vec![0xde, 0xad]),
            nonce: 3,
            gas_limit: 150_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        })
        .unwrap();

    assert_eq!(signed.from, set.address(1).unwrap());
    assert_eq!(signed.nonce, 3);
    // EIP-2718 typed envelope, type 2.
    assert_eq!(signed.raw[0], 0x02);
}

#[test]
fn foreign_contracts_are_not_signable() {
    let set = WalletSet::derive(SECRET, "ES-eeee06", 143, 1, vec![addr(0x40)]).unwrap();
    let attacker = Address::repeat_byte(0x66);
    let result = set.sign(&TxParams {
        wallet_index: 0,
        to: attacker,
        value: U256::ZERO,
        data: Bytes::new(),
        nonce: 0,
        gas_limit: 21_000,
        max_fee_per_gas: 1_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
    });
    assert!(result.is_err());
}
