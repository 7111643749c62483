use std::str::FromStr;

use alloy::primitives::{Address, Signature};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::middleware::ApiKeyAuth;
use crate::api::state::AppState;
use crate::model::apikey;

/// Enrolment signatures older (or newer) than this are rejected.
const TIMESTAMP_SKEW_SECS: i64 = 300;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolRequest {
    pub owner: String,
    pub timestamp: i64,
    /// EIP-191 personal signature over the fixed registration message.
    pub signature: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolResponse {
    /// The full key, returned exactly once.
    pub key: String,
    pub prefix: String,
    pub rate_limit: u32,
}

fn enrolment_message(owner: Address, timestamp: i64) -> String {
    format!("EigenSwarm Register\neigenId: agent-key\nowner: {owner:#x}\ntimestamp: {timestamp}")
}

/// `POST /api/agent/keys` — signed-message enrolment. The plaintext key is
/// in this response and nowhere else; only its hash is stored.
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<EnrolRequest>,
) -> Result<(StatusCode, Json<EnrolResponse>), ApiError> {
    let owner = Address::from_str(&req.owner)
        .map_err(|_| ApiError::bad_request("owner is not an address"))?;

    let now = chrono::Utc::now().timestamp();
    if (now - req.timestamp).abs() > TIMESTAMP_SKEW_SECS {
        return Err(ApiError::bad_request("timestamp outside the allowed window"));
    }

    let sig_raw = req.signature.strip_prefix("0x").unwrap_or(&req.signature);
    let sig_bytes = alloy::primitives::hex::decode(sig_raw)
        .map_err(|_| ApiError::bad_request("signature is not hex"))?;
    let signature = Signature::from_raw(&sig_bytes)
        .map_err(|_| ApiError::bad_request("signature is not 65 bytes"))?;

    let message = enrolment_message(owner, req.timestamp);
    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|_| ApiError::bad_request("signature does not recover"))?;
    if recovered != owner {
        return Err(ApiError::Forbidden("signature does not match owner".into()));
    }

    // One enrolment per (owner, timestamp): replays of the same signed
    // message are rejected even inside the time window.
    {
        let conn = state.db.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO enrol_nonces (owner, timestamp) VALUES (?1, ?2)",
            rusqlite::params![format!("{owner:#x}"), req.timestamp],
        );
        match inserted {
            Ok(1) => {}
            Ok(_) => {
                return Err(ApiError::Conflict {
                    code: "enrolment_replay",
                    message: "this signed message was already used".into(),
                    payment_id: None,
                });
            }
            Err(e) => return Err(ApiError::Internal(format!("nonce store: {e}"))),
        }
    }

    let label = req.label.unwrap_or_else(|| "agent".into());
    let (plaintext, record) = apikey::generate(owner, &label, now);
    {
        let conn = state.db.lock().await;
        conn.execute(
            "INSERT INTO api_keys (prefix, hashed_secret, owner, label, created_at, rate_limit, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            rusqlite::params![
                record.prefix,
                record.hashed_secret,
                format!("{owner:#x}"),
                record.label,
                record.created_at,
                record.rate_limit,
            ],
        )
        .map_err(|e| ApiError::Internal(format!("key store: {e}")))?;
    }

    info!(owner = %format!("{owner:#x}"), prefix = %record.prefix, "api key enrolled");
    Ok((
        StatusCode::CREATED,
        Json(EnrolResponse {
            key: plaintext,
            prefix: record.prefix,
            rate_limit: record.rate_limit,
        }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRow {
    pub prefix: String,
    pub label: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    pub rate_limit: u32,
    pub revoked: bool,
}

/// `GET /api/agent/keys`
pub async fn list(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<KeyRow>>, ApiError> {
    let conn = state.db.lock().await;
    let mut stmt = conn
        .prepare(
            "SELECT prefix, label, created_at, last_used_at, rate_limit, revoked
             FROM api_keys WHERE owner = ?1 ORDER BY created_at DESC",
        )
        .map_err(|e| ApiError::Internal(format!("{e}")))?;
    let rows = stmt
        .query_map([format!("{:#x}", auth.owner)], |r| {
            Ok(KeyRow {
                prefix: r.get(0)?,
                label: r.get(1)?,
                created_at: r.get(2)?,
                last_used_at: r.get(3)?,
                rate_limit: r.get(4)?,
                revoked: r.get(5)?,
            })
        })
        .map_err(|e| ApiError::Internal(format!("{e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::Internal(format!("{e}")))?;
    Ok(Json(rows))
}

/// `DELETE /api/agent/keys/{prefix}` — revocation, not deletion: the row
/// stays for audit, the key stops working.
pub async fn revoke(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db.lock().await;
    let affected = conn
        .execute(
            "UPDATE api_keys SET revoked = 1 WHERE prefix = ?1 AND owner = ?2",
            rusqlite::params![prefix, format!("{:#x}", auth.owner)],
        )
        .map_err(|e| ApiError::Internal(format!("{e}")))?;
    if affected == 0 {
        return Err(ApiError::NotFound(format!("no key '{prefix}'")));
    }
    Ok(Json(serde_json::json!({ "revoked": prefix })))
}
