use std::str::FromStr;

use alloy::primitives::Address;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::eigen::{Eigen, EigenStatus};
use crate::model::trade::TradeRecord;

#[derive(Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// `GET /api/eigens`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Eigen>>, ApiError> {
    let owner = query
        .owner
        .as_deref()
        .map(Address::from_str)
        .transpose()
        .map_err(|_| ApiError::bad_request("owner is not an address"))?;
    let status = query
        .status
        .as_deref()
        .map(EigenStatus::parse)
        .transpose()?;

    let eigens = state
        .registry
        .list(owner, status, query.limit.min(200), query.offset)
        .await?;
    Ok(Json(eigens))
}

/// `GET /api/eigens/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Eigen>, ApiError> {
    let eigen = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no eigen '{id}'")))?;
    Ok(Json(eigen))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// `GET /api/eigens/{id}/trades`
pub async fn trades(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<TradeRecord>>, ApiError> {
    require_eigen(&state, &id).await?;
    let trades = state
        .registry
        .trades(&id, page.limit.min(500), page.offset)
        .await?;
    Ok(Json(trades))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlResponse {
    pub eigen_id: String,
    pub realized_pnl_wei: String,
    pub unrealized_pnl_wei: String,
    pub gas_spent_wei: String,
    pub fee_accrued_wei: String,
    pub volume_produced_wei: String,
    pub trade_count: u64,
    pub buy_count: u64,
    pub sell_count: u64,
    /// Unrealized as a percent of cost basis.
    pub unrealized_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price_usd: Option<f64>,
    pub price_stale: bool,
}

/// `GET /api/eigens/{id}/pnl` — unrealized P&L is recomputed against the
/// oracle on every read.
pub async fn pnl(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PnlResponse>, ApiError> {
    let eigen = require_eigen(&state, &id).await?;
    let reading = state.oracle.read(&eigen.pool, eigen.token).await;
    let spot = reading.spot_wei.unwrap_or_default();

    let unrealized = eigen.unrealized_pnl_wei(spot);
    Ok(Json(PnlResponse {
        eigen_id: eigen.id.clone(),
        realized_pnl_wei: eigen.realized_pnl_wei.to_string(),
        unrealized_pnl_wei: unrealized.to_string(),
        gas_spent_wei: eigen.gas_spent_wei.to_string(),
        fee_accrued_wei: eigen.fee_accrued_wei.to_string(),
        volume_produced_wei: eigen.volume_produced_wei.to_string(),
        trade_count: eigen.trade_count,
        buy_count: eigen.buy_count,
        sell_count: eigen.sell_count,
        unrealized_pct: eigen.unrealized_pnl_pct(spot),
        mark_price_usd: reading.price_usd,
        price_stale: reading.stale,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRow {
    pub index: u32,
    pub address: Address,
}

/// `GET /api/eigens/{id}/wallets` — derivation records only, never keys.
pub async fn wallets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WalletRow>>, ApiError> {
    require_eigen(&state, &id).await?;
    let rows = state
        .registry
        .wallets(&id)
        .await?
        .into_iter()
        .map(|(index, address)| WalletRow { index, address })
        .collect();
    Ok(Json(rows))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub hour: i64,
    pub price_eth: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<f64>,
}

/// `GET /api/eigens/{id}/price-history`
pub async fn price_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<PricePoint>>, ApiError> {
    require_eigen(&state, &id).await?;
    let rows = state
        .registry
        .price_history(&id, page.limit.min(720))
        .await?
        .into_iter()
        .map(|(hour, price_eth, price_usd)| PricePoint {
            hour,
            price_eth,
            price_usd,
        })
        .collect();
    Ok(Json(rows))
}

pub async fn require_eigen(state: &AppState, id: &str) -> Result<Eigen, ApiError> {
    state
        .registry
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no eigen '{id}'")))
}
