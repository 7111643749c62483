use alloy::hex;
use alloy::primitives::Address;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default per-key rate limit (requests per minute) for freshly enrolled keys.
pub const DEFAULT_KEY_RATE_LIMIT: u32 = 300;

/// Stored API key. Only the SHA-256 of the full token is persisted; the
/// plaintext leaves the keeper exactly once, at creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub prefix: String,
    #[serde(skip_serializing)]
    pub hashed_secret: String,
    pub owner: Address,
    pub label: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    pub rate_limit: u32,
    pub revoked: bool,
}

/// Mint a fresh key. Returns (plaintext, record); the plaintext is
/// `esk_<prefix><secret>` where the secret is 32 random bytes hex-encoded.
pub fn generate(owner: Address, label: &str, now: i64) -> (String, ApiKeyRecord) {
    use rand::Rng;
    let prefix_bytes: [u8; 4] = rand::rng().random();
    let secret_bytes: [u8; 32] = rand::rng().random();

    let prefix = format!("esk_{}", hex::encode(prefix_bytes));
    let plaintext = format!("{prefix}{}", hex::encode(secret_bytes));

    let record = ApiKeyRecord {
        prefix: prefix.clone(),
        hashed_secret: hash_token(&plaintext),
        owner,
        label: label.to_string(),
        created_at: now,
        last_used_at: None,
        rate_limit: DEFAULT_KEY_RATE_LIMIT,
        revoked: false,
    };
    (plaintext, record)
}

/// SHA-256 of the full token, hex-encoded.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Split a presented token into its lookup prefix. The prefix is `esk_` plus
/// 8 hex chars; anything shorter is malformed.
pub fn token_prefix(token: &str) -> Option<&str> {
    if token.len() >= 12 && token.starts_with("esk_") {
        Some(&token[..12])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_hashes_back_to_record() {
        let owner = Address::repeat_byte(9);
        let (plaintext, record) = generate(owner, "ci", 1_700_000_000);
        assert!(plaintext.starts_with("esk_"));
        assert_eq!(token_prefix(&plaintext), Some(record.prefix.as_str()));
        assert_eq!(hash_token(&plaintext), record.hashed_secret);
    }

    #[test]
    fn malformed_tokens_have_no_prefix() {
        assert_eq!(token_prefix("short"), None);
        assert_eq!(token_prefix("abc_0011223344"), None);
    }
}
