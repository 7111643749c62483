use std::time::Duration;

use serde::Deserialize;

use crate::error::{KeeperError, KeeperResult};

/// Settlement outcome reported by the external facilitator.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Settled { tx_hash: String },
    Rejected { reason: String },
}

#[derive(Debug, Deserialize)]
struct FacilitatorResponse {
    ok: bool,
    #[serde(rename = "txHash")]
    tx_hash: Option<String>,
    reason: Option<String>,
}

/// HTTP client for the authorization-settlement facilitator. The keeper
/// ships it the base64 payload and trusts nothing beyond `{ok, txHash}`.
pub struct FacilitatorClient {
    http: reqwest::Client,
    url: String,
}

impl FacilitatorClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    pub async fn settle(&self, payload_b64: &str) -> KeeperResult<SettleOutcome> {
        let resp = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(30))
            .json(&serde_json::json!({ "payload": payload_b64 }))
            .send()
            .await
            .map_err(|e| KeeperError::upstream(format!("facilitator: {e}")))?;

        if !resp.status().is_success() {
            return Err(KeeperError::upstream(format!(
                "facilitator returned {}",
                resp.status()
            )));
        }

        let body: FacilitatorResponse = resp
            .json()
            .await
            .map_err(|e| KeeperError::upstream(format!("facilitator body: {e}")))?;

        if body.ok {
            match body.tx_hash {
                Some(tx_hash) => Ok(SettleOutcome::Settled { tx_hash }),
                None => Err(KeeperError::upstream(
                    "facilitator said ok without a settlement hash",
                )),
            }
        } else {
            Ok(SettleOutcome::Rejected {
                reason: body
                    .reason
                    .unwrap_or_else(|| "unspecified facilitator rejection".into()),
            })
        }
    }
}
