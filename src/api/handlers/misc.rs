use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::package;

/// `GET /api/pricing`
pub async fn pricing() -> Json<serde_json::Value> {
    Json(json!({ "packages": package::catalog() }))
}

/// `GET /api/health` — liveness plus the treasury view: chain head,
/// endpoint health, stablecoin balance at the payment recipient.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let head = state.chain.block_number().await.ok();
    let treasury = state
        .quote
        .erc20_balance(state.stablecoin, state.payment_recipient)
        .await
        .ok();

    let uptime = chrono::Utc::now().timestamp() - state.started_at;
    Json(json!({
        "ok": head.is_some(),
        "chainId": state.chain.chain_id(),
        "chainHead": head,
        "rpcEndpoints": state.chain.endpoint_count(),
        "activeEndpoint": state.chain.active_endpoint(),
        "treasuryStablecoin": treasury.map(|b| b.to_string()),
        "uptimeSecs": uptime,
    }))
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.registry.stats().await?;
    let running = state.scheduler.running_count().await;
    Ok(Json(json!({
        "eigens": stats,
        "schedulersRunning": running,
    })))
}
