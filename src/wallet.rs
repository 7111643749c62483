use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, B256, Bytes, TxKind, U256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{KeeperError, KeeperResult};

type HmacSha256 = Hmac<Sha256>;

/// secp256k1 group order, for clamping derived scalars into [1, n-1].
fn curve_order() -> U256 {
    U256::from_str_radix(
        "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
        16,
    )
    .unwrap()
}

/// Derive the sub-wallet scalar for (eigen, index) from the keeper master
/// secret. Deterministic: a restart re-derives the same wallets, so no key
/// material is ever at rest.
fn derive_scalar(master_secret: &str, eigen_id: &str, index: u32) -> B256 {
    let mut mac = HmacSha256::new_from_slice(master_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(eigen_id.as_bytes());
    mac.update(&index.to_be_bytes());
    let digest: [u8; 32] = mac.finalize().into_bytes().into();

    let raw = U256::from_be_bytes(digest);
    let clamped = raw % (curve_order() - U256::from(1)) + U256::from(1);
    B256::from(clamped.to_be_bytes::<32>())
}

fn derive_signer(master_secret: &str, eigen_id: &str, index: u32) -> KeeperResult<PrivateKeySigner> {
    let scalar = derive_scalar(master_secret, eigen_id, index);
    PrivateKeySigner::from_bytes(&scalar)
        .map_err(|e| KeeperError::invariant(format!("derived scalar rejected: {e}")))
}

/// Address-only derivation, for restart recovery and key-rotation planning.
pub fn derive_address(master_secret: &str, eigen_id: &str, index: u32) -> KeeperResult<Address> {
    Ok(derive_signer(master_secret, eigen_id, index)?.address())
}

// ── Transaction parameters ──────────────────────────────────────────

/// Everything an outbound transaction names, decided by the caller.
#[derive(Debug, Clone)]
pub struct TxParams {
    pub wallet_index: u32,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A signed transaction ready for eth_sendRawTransaction.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
}

// ── Wallet set ──────────────────────────────────────────────────────

/// The N derived sub-wallets of one eigen. The count is fixed at creation
/// and only ever grows through an explicit admin extension.
pub struct WalletSet {
    eigen_id: String,
    chain_id: u64,
    master_secret: String,
    signers: Vec<PrivateKeySigner>,
    /// Contracts a sub-wallet is allowed to transact with, besides its
    /// sibling sub-wallets.
    approved_targets: Vec<Address>,
}

impl WalletSet {
    pub fn derive(
        master_secret: &str,
        eigen_id: &str,
        chain_id: u64,
        count: u32,
        approved_targets: Vec<Address>,
    ) -> KeeperResult<Self> {
        if count == 0 {
            return Err(KeeperError::validation("wallet count must be at least 1"));
        }
        let signers = (0..count)
            .map(|i| derive_signer(master_secret, eigen_id, i))
            .collect::<KeeperResult<Vec<_>>>()?;
        Ok(Self {
            eigen_id: eigen_id.to_string(),
            chain_id,
            master_secret: master_secret.to_string(),
            signers,
            approved_targets,
        })
    }

    pub fn len(&self) -> u32 {
        self.signers.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn address(&self, index: u32) -> KeeperResult<Address> {
        self.signers
            .get(index as usize)
            .map(|s| s.address())
            .ok_or_else(|| {
                KeeperError::validation(format!(
                    "wallet index {index} out of range for {}",
                    self.eigen_id
                ))
            })
    }

    pub fn addresses(&self) -> Vec<(u32, Address)> {
        self.signers
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, s.address()))
            .collect()
    }

    /// Grow the set to `count` wallets. Shrinking is not a thing.
    pub fn extend_to(&mut self, count: u32) -> KeeperResult<()> {
        if count < self.len() {
            return Err(KeeperError::validation(format!(
                "wallet set of {} cannot shrink to {count}",
                self.len()
            )));
        }
        for i in self.len()..count {
            let signer = derive_signer(&self.master_secret, &self.eigen_id, i)?;
            self.signers.push(signer);
        }
        Ok(())
    }

    fn target_allowed(&self, to: Address) -> bool {
        self.approved_targets.contains(&to)
            || self.signers.iter().any(|s| s.address() == to)
    }

    /// Sign an EIP-1559 transaction after enforcing the target allowlist.
    /// Rejecting here, before any signature exists, is the sandbox boundary.
    pub fn sign(&self, params: &TxParams) -> KeeperResult<SignedTx> {
        if !self.target_allowed(params.to) {
            return Err(KeeperError::auth(format!(
                "target {:#x} is not an approved destination for {}",
                params.to, self.eigen_id
            )));
        }

        let signer = self
            .signers
            .get(params.wallet_index as usize)
            .ok_or_else(|| {
                KeeperError::validation(format!(
                    "wallet index {} out of range for {}",
                    params.wallet_index, self.eigen_id
                ))
            })?;

        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce: params.nonce,
            gas_limit: params.gas_limit,
            max_fee_per_gas: params.max_fee_per_gas,
            max_priority_fee_per_gas: params.max_priority_fee_per_gas,
            to: TxKind::Call(params.to),
            value: params.value,
            access_list: Default::default(),
            input: params.data.clone(),
        };

        let signature = signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| KeeperError::invariant(format!("signing failed: {e}")))?;
        let signed = tx.into_signed(signature);
        let envelope = TxEnvelope::Eip1559(signed);

        Ok(SignedTx {
            raw: envelope.encoded_2718(),
            hash: *envelope.tx_hash(),
            from: signer.address(),
            nonce: params.nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-master-secret";

    fn targets() -> Vec<Address> {
        vec![Address::repeat_byte(0xAA)]
    }

    #[test]
    fn derivation_is_deterministic_and_distinct() {
        let a0 = derive_address(SECRET, "ES-ab12cd", 0).unwrap();
        let a0_again = derive_address(SECRET, "ES-ab12cd", 0).unwrap();
        let a1 = derive_address(SECRET, "ES-ab12cd", 1).unwrap();
        let other = derive_address(SECRET, "ES-ff00ff", 0).unwrap();

        assert_eq!(a0, a0_again);
        assert_ne!(a0, a1);
        assert_ne!(a0, other);
    }

    #[test]
    fn different_master_secret_changes_every_address() {
        let a = derive_address(SECRET, "ES-ab12cd", 0).unwrap();
        let b = derive_address("rotated", "ES-ab12cd", 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn signer_rejects_unapproved_targets() {
        let set = WalletSet::derive(SECRET, "ES-ab12cd", 143, 2, targets()).unwrap();
        let params = TxParams {
            wallet_index: 0,
            to: Address::repeat_byte(0xEE),
            value: U256::ZERO,
            data: Bytes::new(),
            nonce: 0,
            gas_limit: 21_000,
            max_fee_per_gas: 1_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        };
        assert!(matches!(set.sign(&params), Err(KeeperError::Auth(_))));
    }

    #[test]
    fn sibling_sub_wallets_are_valid_targets() {
        let set = WalletSet::derive(SECRET, "ES-ab12cd", 143, 2, targets()).unwrap();
        let sibling = set.address(1).unwrap();
        let params = TxParams {
            wallet_index: 0,
            to: sibling,
            value: U256::from(1u64),
            data: Bytes::new(),
            nonce: 0,
            gas_limit: 21_000,
            max_fee_per_gas: 1_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        };
        let signed = set.sign(&params).unwrap();
        assert_eq!(signed.from, set.address(0).unwrap());
        assert!(!signed.raw.is_empty());
    }

    #[test]
    fn extension_keeps_existing_addresses() {
        let mut set = WalletSet::derive(SECRET, "ES-ab12cd", 143, 2, targets()).unwrap();
        let before = set.addresses();
        set.extend_to(5).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(&set.addresses()[..2], &before[..]);
        assert!(set.extend_to(3).is_err());
    }
}
