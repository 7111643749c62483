use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::error::ApiError;
use crate::api::middleware::ApiKeyAuth;
use crate::api::state::AppState;
use crate::model::eigen::{ConfigPatch, Eigen, EigenClass, EigenStatus};

use super::eigens::require_eigen;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    #[serde(default)]
    pub class: Option<EigenClass>,
    #[serde(flatten)]
    pub config: ConfigPatch,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResponse {
    pub eigen: Eigen,
    pub changed: bool,
}

/// `PATCH /api/agent/eigens/{id}` — bounded config patch, optionally with
/// an upward class change. A no-op patch writes nothing.
pub async fn patch(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PatchRequest>,
) -> Result<Json<PatchResponse>, ApiError> {
    let eigen = require_eigen(&state, &id).await?;
    if eigen.status.is_terminal() {
        return Err(ApiError::terminal_state(&id));
    }
    if eigen.status == EigenStatus::Liquidating {
        return Err(ApiError::Conflict {
            code: "liquidating",
            message: format!("eigen {id} is draining its position"),
            payment_id: None,
        });
    }

    let mut changed = false;
    if let Some(class) = req.class {
        state
            .lifecycle
            .upgrade_class(&id, auth.owner, class)
            .await?;
        changed = true;
    }

    let (eigen, config_changed) = state
        .lifecycle
        .adjust(&id, auth.owner, &req.config)
        .await?;
    Ok(Json(PatchResponse {
        eigen,
        changed: changed || config_changed,
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionBody {
    /// Top-up amount for `fund`, decimal wei.
    pub amount_wei: Option<String>,
}

/// `POST /api/agent/eigens/{id}/{action}` — the lifecycle verbs.
pub async fn action(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    body: Option<Json<ActionBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let eigen = require_eigen(&state, &id).await?;
    guard_action(&eigen, &action)?;

    match action.as_str() {
        "take-profit" => {
            let outcome = state.lifecycle.take_profit(&id, auth.owner).await?;
            Ok(Json(json!({
                "eigenId": id,
                "action": "take-profit",
                "amountWei": outcome.amount_wei.to_string(),
                "txHashes": hashes(&outcome.tx_hashes),
            })))
        }
        "liquidate" => {
            let eigen = state.lifecycle.liquidate(&id, auth.owner).await?;
            Ok(Json(json!({ "eigenId": id, "status": eigen.status })))
        }
        "terminate" => {
            let eigen = state.lifecycle.terminate(&id, auth.owner).await?;
            Ok(Json(json!({ "eigenId": id, "status": eigen.status })))
        }
        "withdraw" => {
            let outcome = state.lifecycle.withdraw_all(&id, auth.owner).await?;
            Ok(Json(json!({
                "eigenId": id,
                "action": "withdraw",
                "amountWei": outcome.amount_wei.to_string(),
                "txHashes": hashes(&outcome.tx_hashes),
            })))
        }
        "fund" => {
            crate::lifecycle::LifecycleController::assert_owner(&eigen, auth.owner)?;
            let amount = body
                .and_then(|Json(b)| b.amount_wei)
                .map(|raw| {
                    raw.parse::<alloy::primitives::U256>()
                        .map_err(|_| ApiError::bad_request("amountWei is not a decimal integer"))
                })
                .transpose()?
                .ok_or_else(|| ApiError::bad_request("fund requires amountWei"))?;
            let (funded, txs) = state.lifecycle.fund(&id, amount).await?;
            Ok(Json(json!({
                "eigenId": id,
                "status": funded.status,
                "fundedWei": amount.to_string(),
                "txHashes": txs.iter().map(|h| format!("{h:#x}")).collect::<Vec<_>>(),
            })))
        }
        "suspend" => {
            let eigen = state.lifecycle.suspend(&id, auth.owner).await?;
            Ok(Json(json!({ "eigenId": id, "status": eigen.status })))
        }
        "resume" => {
            let eigen = state.lifecycle.resume(&id, auth.owner).await?;
            Ok(Json(json!({ "eigenId": id, "status": eigen.status })))
        }
        other => Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
}

/// Status gate. Settlement verbs keep working exactly as far as the
/// status graph allows: terminate from `liquidated`, withdraw until
/// `closed`. A draining eigen accepts nothing but settlement verbs.
fn guard_action(eigen: &Eigen, action: &str) -> Result<(), ApiError> {
    let blocked = match action {
        "terminate" => matches!(eigen.status, EigenStatus::Terminated | EigenStatus::Closed),
        "withdraw" => eigen.status == EigenStatus::Closed,
        _ => eigen.status.is_terminal(),
    };
    if blocked {
        return Err(ApiError::terminal_state(&eigen.id));
    }

    if eigen.status == EigenStatus::Liquidating
        && !matches!(action, "terminate" | "liquidate" | "withdraw")
    {
        return Err(ApiError::Conflict {
            code: "liquidating",
            message: format!("eigen {} is draining its position", eigen.id),
            payment_id: None,
        });
    }
    Ok(())
}

fn hashes(list: &[alloy::primitives::B256]) -> Vec<String> {
    list.iter().map(|h| format!("{h:#x}")).collect()
}
