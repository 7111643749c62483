pub mod facilitator;

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes, Signature, U256};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolEvent, SolStruct};
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::error::{KeeperError, KeeperResult, PaymentCode};
use crate::model::payment::{PaymentRecord, PaymentRequirements, PaymentScheme, PaymentState};
use crate::registry::Db;

use facilitator::{FacilitatorClient, SettleOutcome};

/// How long a 402 requirements record stays valid.
const REQUIREMENTS_TTL_SECS: i64 = 600;

/// A payment verified but never consumed decays to `failed` after this, so
/// the payer can retry with a fresh signature.
const VERIFIED_TTL_SECS: i64 = 900;

sol! {
    /// ERC-3009 transfer authorization, signed under the stablecoin's
    /// EIP-712 domain.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }

    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// The client-submitted authorization payload, base64(JSON) in `X-PAYMENT`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPayload {
    pub from: Address,
    pub to: Address,
    #[serde(with = "crate::model::wei_string")]
    pub value: U256,
    pub valid_after: i64,
    pub valid_before: i64,
    pub nonce: B256,
    pub signature: Bytes,
}

#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    pub payment_id: String,
    pub payer: Address,
}

/// The 402 admission gate: verifies direct stablecoin transfers or signed
/// authorizations, locks each payment behind a CAS state field, and maps
/// every payment to at most one eigen.
pub struct PaymentGateway {
    db: Db,
    chain: Arc<ChainClient>,
    facilitator: FacilitatorClient,
    recipient: Address,
    stablecoin: Address,
    confirmation_depth: u64,
}

impl PaymentGateway {
    pub fn new(
        db: Db,
        chain: Arc<ChainClient>,
        facilitator_url: String,
        recipient: Address,
        stablecoin: Address,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            db,
            chain,
            facilitator: FacilitatorClient::new(facilitator_url),
            recipient,
            stablecoin,
            confirmation_depth,
        }
    }

    /// The body of a 402 response.
    pub fn requirements(&self, amount_minor: U256) -> PaymentRequirements {
        PaymentRequirements {
            schemes: vec![PaymentScheme::Authorization, PaymentScheme::Direct],
            chain: self.chain.chain_id(),
            token: self.stablecoin,
            amount: amount_minor,
            recipient: self.recipient,
            valid_until: chrono::Utc::now().timestamp() + REQUIREMENTS_TTL_SECS,
        }
    }

    /// Verify an `X-PAYMENT` header value against the required amount.
    /// A bare 66-char hex string is a direct-transfer tx hash; anything
    /// else must be base64(JSON authorization payload).
    pub async fn verify(&self, header: &str, required: U256) -> KeeperResult<VerifiedPayment> {
        let header = header.trim();
        if header.starts_with("0x") && header.len() == 66 {
            let hash = B256::from_str(header).map_err(|e| {
                KeeperError::payment(PaymentCode::BadProof, format!("tx hash: {e}"))
            })?;
            self.verify_direct(hash, required).await
        } else {
            let raw = base64_decode(header).ok_or_else(|| {
                KeeperError::payment(PaymentCode::BadProof, "header is neither tx hash nor base64")
            })?;
            let payload: AuthorizationPayload = serde_json::from_slice(&raw).map_err(|e| {
                KeeperError::payment(PaymentCode::BadProof, format!("payload decode: {e}"))
            })?;
            self.verify_authorization(header, &raw, &payload, required)
                .await
        }
    }

    // ── Direct transfer ─────────────────────────────────────────────

    async fn verify_direct(&self, tx_hash: B256, required: U256) -> KeeperResult<VerifiedPayment> {
        let payment_id = direct_payment_id(tx_hash, self.chain.chain_id());

        if let Some(early) = self.short_circuit(&payment_id).await? {
            return Ok(early);
        }

        let receipt = self
            .chain
            .receipt(tx_hash)
            .await
            .map_err(KeeperError::from)?
            .ok_or_else(|| {
                KeeperError::payment(PaymentCode::VerificationFailed, "transaction not found")
            })?;

        if !receipt.succeeded() {
            return Err(KeeperError::payment(
                PaymentCode::VerificationFailed,
                "transfer transaction reverted",
            ));
        }

        let block = receipt.block_number.ok_or_else(|| {
            KeeperError::payment(PaymentCode::NotFinal, "receipt has no block number")
        })?;
        let head = self.chain.block_number().await.map_err(KeeperError::from)?;
        if head < block + self.confirmation_depth {
            return Err(KeeperError::payment(
                PaymentCode::NotFinal,
                format!(
                    "needs {} confirmations, has {}",
                    self.confirmation_depth,
                    head.saturating_sub(block)
                ),
            ));
        }

        // The transfer we admit must hit our stablecoin and our recipient.
        let mut matched: Option<(Address, U256)> = None;
        for log in &receipt.logs {
            if log.address != self.stablecoin {
                continue;
            }
            if log.topics.first() != Some(&IERC20::Transfer::SIGNATURE_HASH) {
                continue;
            }
            let Ok(event) = IERC20::Transfer::decode_raw_log(log.topics.iter().copied(), &log.data)
            else {
                continue;
            };
            if event.to == self.recipient {
                matched = Some((event.from, event.value));
                break;
            }
        }

        let (payer, amount) = matched.ok_or_else(|| {
            KeeperError::payment(
                PaymentCode::WrongRecipient,
                "no stablecoin transfer to the declared recipient in this transaction",
            )
        })?;

        if amount < required {
            return Err(KeeperError::payment(
                PaymentCode::AmountShort,
                format!("paid {amount}, required {required}"),
            ));
        }

        self.insert_verified(
            &payment_id,
            payer,
            amount,
            PaymentScheme::Direct,
            Some(format!("{tx_hash:#x}")),
        )
        .await?;

        info!(payment = %payment_id, payer = %format!("{payer:#x}"), "direct transfer verified");
        Ok(VerifiedPayment { payment_id, payer })
    }

    // ── Signed authorization ────────────────────────────────────────

    async fn verify_authorization(
        &self,
        header_b64: &str,
        raw_payload: &[u8],
        payload: &AuthorizationPayload,
        required: U256,
    ) -> KeeperResult<VerifiedPayment> {
        let payment_id = authorization_payment_id(raw_payload);

        if let Some(early) = self.short_circuit(&payment_id).await? {
            return Ok(early);
        }

        if payload.to != self.recipient {
            return Err(KeeperError::payment(
                PaymentCode::WrongRecipient,
                format!("authorization pays {:#x}", payload.to),
            ));
        }
        if payload.value < required {
            return Err(KeeperError::payment(
                PaymentCode::AmountShort,
                format!("authorized {}, required {required}", payload.value),
            ));
        }
        let now = chrono::Utc::now().timestamp();
        if now < payload.valid_after || now > payload.valid_before {
            return Err(KeeperError::payment(
                PaymentCode::Expired,
                "authorization outside its validity window",
            ));
        }

        // Recover the signer locally before paying the facilitator a call.
        let digest = self.authorization_digest(payload);
        let signature = Signature::from_raw(&payload.signature).map_err(|e| {
            KeeperError::payment(PaymentCode::BadProof, format!("signature bytes: {e}"))
        })?;
        let recovered = signature.recover_address_from_prehash(&digest).map_err(|e| {
            KeeperError::payment(PaymentCode::BadProof, format!("recovery: {e}"))
        })?;
        if recovered != payload.from {
            return Err(KeeperError::payment(
                PaymentCode::VerificationFailed,
                "signature does not recover to the payer",
            ));
        }

        let settlement = match self.facilitator.settle(header_b64).await? {
            SettleOutcome::Settled { tx_hash } => tx_hash,
            SettleOutcome::Rejected { reason } => {
                warn!(payment = %payment_id, %reason, "facilitator rejected authorization");
                return Err(KeeperError::payment(PaymentCode::VerificationFailed, reason));
            }
        };

        self.insert_verified(
            &payment_id,
            payload.from,
            payload.value,
            PaymentScheme::Authorization,
            Some(settlement),
        )
        .await?;

        info!(payment = %payment_id, payer = %format!("{:#x}", payload.from), "authorization settled");
        Ok(VerifiedPayment {
            payment_id,
            payer: payload.from,
        })
    }

    fn authorization_digest(&self, payload: &AuthorizationPayload) -> B256 {
        let message = TransferWithAuthorization {
            from: payload.from,
            to: payload.to,
            value: payload.value,
            validAfter: U256::from(payload.valid_after as u64),
            validBefore: U256::from(payload.valid_before as u64),
            nonce: payload.nonce,
        };
        let domain = Eip712Domain::new(
            Some("USD Coin".into()),
            Some("2".into()),
            Some(U256::from(self.chain.chain_id())),
            Some(self.stablecoin),
            None,
        );
        message.eip712_signing_hash(&domain)
    }

    // ── State machine over the payments table ───────────────────────

    /// Replays of an already-verified proof return the original result;
    /// replays of a consumed one are a hard 409.
    async fn short_circuit(&self, payment_id: &str) -> KeeperResult<Option<VerifiedPayment>> {
        self.expire_stale().await?;
        let Some(existing) = self.get(payment_id).await? else {
            return Ok(None);
        };
        match existing.state {
            PaymentState::Consumed => Err(KeeperError::payment(
                PaymentCode::AlreadyConsumed,
                payment_id.to_string(),
            )),
            PaymentState::Verified => Ok(Some(VerifiedPayment {
                payment_id: payment_id.to_string(),
                payer: existing.payer,
            })),
            // A failed or pending record gets re-verified from scratch.
            PaymentState::Failed | PaymentState::Pending => Ok(None),
        }
    }

    async fn insert_verified(
        &self,
        payment_id: &str,
        payer: Address,
        amount: U256,
        scheme: PaymentScheme,
        settlement_tx: Option<String>,
    ) -> KeeperResult<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO payments (id, payer, recipient, amount, chain_id, scheme, state,
                                   settlement_tx, created_at, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'verified', ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 state = 'verified', verified_at = ?8, settlement_tx = ?7
             WHERE payments.state IN ('pending', 'failed')",
            params![
                payment_id,
                format!("{payer:#x}"),
                format!("{:#x}", self.recipient),
                amount.to_string(),
                self.chain.chain_id(),
                scheme.as_str(),
                settlement_tx,
                now,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Atomic CAS: `verified → consumed`, linking the payment to one eigen.
    pub async fn consume(&self, payment_id: &str, eigen_id: &str) -> KeeperResult<()> {
        let conn = self.db.lock().await;
        let affected = conn
            .execute(
                "UPDATE payments SET state = 'consumed', eigen_id = ?2
                 WHERE id = ?1 AND state = 'verified'",
                params![payment_id, eigen_id],
            )
            .map_err(db_err)?;
        drop(conn);

        if affected == 1 {
            return Ok(());
        }
        match self.get(payment_id).await? {
            Some(p) if p.state == PaymentState::Consumed => Err(KeeperError::payment(
                PaymentCode::AlreadyConsumed,
                payment_id.to_string(),
            )),
            Some(p) => Err(KeeperError::payment(
                PaymentCode::VerificationFailed,
                format!("payment is {}", p.state.as_str()),
            )),
            None => Err(KeeperError::payment(
                PaymentCode::BadProof,
                "unknown payment",
            )),
        }
    }

    /// Give a verified-but-unconsumed payment back, e.g. when eigen
    /// creation failed after admission. The payer may retry fresh.
    pub async fn release(&self, payment_id: &str) -> KeeperResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE payments SET state = 'failed' WHERE id = ?1 AND state = 'verified'",
            [payment_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn expire_stale(&self) -> KeeperResult<()> {
        let cutoff = chrono::Utc::now().timestamp() - VERIFIED_TTL_SECS;
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE payments SET state = 'failed' WHERE state = 'verified' AND verified_at < ?1",
            [cutoff],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, payment_id: &str) -> KeeperResult<Option<PaymentRecord>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, payer, recipient, amount, chain_id, scheme, state, eigen_id,
                    settlement_tx, created_at, verified_at
             FROM payments WHERE id = ?1",
            [payment_id],
            |row| {
                let payer: String = row.get(1)?;
                let recipient: String = row.get(2)?;
                let amount: String = row.get(3)?;
                let scheme: String = row.get(5)?;
                let state: String = row.get(6)?;
                Ok(PaymentRecord {
                    id: row.get(0)?,
                    payer: Address::from_str(&payer).map_err(conv_err)?,
                    recipient: Address::from_str(&recipient).map_err(conv_err)?,
                    amount: U256::from_str(&amount).map_err(conv_err)?,
                    chain_id: row.get(4)?,
                    scheme: PaymentScheme::parse(&scheme).map_err(conv_err)?,
                    state: PaymentState::parse(&state).map_err(conv_err)?,
                    eigen_id: row.get(7)?,
                    settlement_tx: row.get(8)?,
                    created_at: row.get(9)?,
                    verified_at: row.get(10)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

// ── Payment ids ─────────────────────────────────────────────────────

pub fn direct_payment_id(tx_hash: B256, chain_id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tx_hash.as_slice());
    hasher.update(chain_id.to_be_bytes());
    alloy::primitives::hex::encode(hasher.finalize())
}

pub fn authorization_payment_id(raw_payload: &[u8]) -> String {
    alloy::primitives::hex::encode(Sha256::digest(raw_payload))
}

// ── base64 (standard alphabet, padding tolerated) ───────────────────

pub fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut lookup = [255u8; 256];
    for (i, &c) in alphabet.iter().enumerate() {
        lookup[c as usize] = i as u8;
    }

    let trimmed = input.trim_end_matches('=');
    let mut bytes = Vec::with_capacity(trimmed.len());
    for b in trimmed.bytes() {
        if lookup[b as usize] == 255 {
            return None;
        }
        bytes.push(b);
    }
    if bytes.is_empty() || bytes.len() % 4 == 1 {
        return None;
    }

    let mut result = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let mut n = 0u32;
        for (i, &b) in chunk.iter().enumerate() {
            n |= (lookup[b as usize] as u32) << (18 - 6 * i);
        }
        result.push((n >> 16) as u8);
        if chunk.len() > 2 {
            result.push((n >> 8) as u8);
        }
        if chunk.len() > 3 {
            result.push(n as u8);
        }
    }
    Some(result)
}

pub fn base64_encode(data: &[u8]) -> String {
    let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut s = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        s.push(alphabet[((n >> 18) & 63) as usize] as char);
        s.push(alphabet[((n >> 12) & 63) as usize] as char);
        if chunk.len() > 1 {
            s.push(alphabet[((n >> 6) & 63) as usize] as char);
        } else {
            s.push('=');
        }
        if chunk.len() > 2 {
            s.push(alphabet[(n & 63) as usize] as char);
        } else {
            s.push('=');
        }
    }
    s
}

fn db_err(e: rusqlite::Error) -> KeeperError {
    KeeperError::Upstream(format!("database: {e}"))
}

fn conv_err<E: std::fmt::Display>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{e}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let data = br#"{"from":"0x0000000000000000000000000000000000000001"}"#;
        let encoded = base64_encode(data);
        assert_eq!(base64_decode(&encoded).unwrap(), data.to_vec());
    }

    #[test]
    fn payment_ids_bind_chain_and_proof() {
        let hash = B256::repeat_byte(0xAB);
        let a = direct_payment_id(hash, 143);
        let b = direct_payment_id(hash, 8453);
        assert_ne!(a, b, "same tx on another chain is another payment");
        assert_eq!(a, direct_payment_id(hash, 143));
    }

    #[test]
    fn garbage_header_is_not_base64() {
        assert!(base64_decode("not//valid===x").is_none());
        assert!(base64_decode("").is_none());
    }
}
