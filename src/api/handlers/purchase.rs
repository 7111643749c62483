use alloy::primitives::{Address, U256};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::eigen::{EigenClass, EigenStatus};
use crate::model::package;
use crate::model::pool::PoolDescriptor;
use crate::payment::VerifiedPayment;

use super::tokens;

// ── Buy volume ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyVolumeRequest {
    pub token_address: Address,
    pub package_id: String,
    /// Explicit pool descriptor; resolved from protocol hints when absent.
    #[serde(default)]
    pub pool: Option<PoolDescriptor>,
    #[serde(default)]
    pub agent_identity: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSummary {
    pub funded: bool,
    pub tx_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyVolumeResponse {
    pub eigen_id: String,
    pub status: EigenStatus,
    pub payment_id: String,
    pub funding: FundingSummary,
}

/// `POST /api/agents/buy-volume` — the 402 handshake. Without an
/// `X-PAYMENT` header the requirements come back as a 402; with one, the
/// proof is verified, an eigen is created, funded, and only then is the
/// payment consumed, so any failure on the way releases the lock.
pub async fn buy_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BuyVolumeRequest>,
) -> Result<(StatusCode, Json<BuyVolumeResponse>), ApiError> {
    let package = package::find(&req.package_id)?;
    let required = U256::from(package.usd_minor);

    let verified = admit_payment(&state, &headers, required).await?;

    let pool = match req.pool {
        Some(pool) => pool,
        None => tokens::resolve_pool(&state, req.token_address)
            .await?
            .ok_or_else(|| {
                ApiError::bad_request(format!(
                    "no pool found for token {:#x}; supply a pool descriptor",
                    req.token_address
                ))
            })?,
    };

    let eigen = match state
        .lifecycle
        .create(
            verified.payer,
            req.agent_identity.clone(),
            req.token_address,
            pool,
            &package,
            EigenStatus::PendingFunding,
        )
        .await
    {
        Ok(eigen) => eigen,
        Err(e) => {
            let _ = state.payments.release(&verified.payment_id).await;
            return Err(e.into());
        }
    };

    let (funded, funding_txs) = match state.lifecycle.fund(&eigen.id, package.budget_wei).await {
        Ok(funded) => funded,
        Err(e) => {
            error!(eigen = %eigen.id, error = %e, "funding failed, payment released");
            let _ = state.payments.release(&verified.payment_id).await;
            return Err(e.into());
        }
    };

    state
        .payments
        .consume(&verified.payment_id, &eigen.id)
        .await?;

    info!(
        eigen = %eigen.id,
        package = package.id,
        payer = %format!("{:#x}", verified.payer),
        "volume package purchased"
    );

    Ok((
        StatusCode::CREATED,
        Json(BuyVolumeResponse {
            eigen_id: eigen.id,
            status: funded.status,
            payment_id: verified.payment_id,
            funding: FundingSummary {
                funded: funded.status == EigenStatus::Active,
                tx_count: funding_txs.len(),
            },
        }),
    ))
}

// ── Launch ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    pub package_id: String,
    #[serde(default)]
    pub class: Option<EigenClass>,
    #[serde(default)]
    pub wallet_count: Option<u32>,
    #[serde(default)]
    pub allocation: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub token_address: Address,
    pub eigen_id: String,
    pub pool_id: String,
    pub allocation: f64,
    pub tx_hashes: Vec<String>,
    pub status: EigenStatus,
}

/// `POST /api/launch` — same 402 flow, but the token does not exist yet:
/// the launchpad deploys it and the eigen starts against the fresh curve.
pub async fn launch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LaunchRequest>,
) -> Result<(StatusCode, Json<LaunchResponse>), ApiError> {
    let mut package = package::find(&req.package_id)?;
    if let Some(class) = req.class {
        package.class = class;
    }
    let required = U256::from(package.usd_minor);

    let verified = admit_payment(&state, &headers, required).await?;

    let metadata_uri = req.image.clone().unwrap_or_default();
    let (eigen, launched) = match state
        .lifecycle
        .launch(verified.payer, &req.name, &req.symbol, &metadata_uri, &package)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            let _ = state.payments.release(&verified.payment_id).await;
            return Err(e.into());
        }
    };

    let mut tx_hashes = vec![format!("{:#x}", launched.tx_hash)];

    let (funded, funding_txs) = match state.lifecycle.fund(&eigen.id, package.budget_wei).await {
        Ok(funded) => funded,
        Err(e) => {
            error!(eigen = %eigen.id, error = %e, "launch funding failed, payment released");
            let _ = state.payments.release(&verified.payment_id).await;
            return Err(e.into());
        }
    };
    tx_hashes.extend(funding_txs.iter().map(|h| format!("{h:#x}")));

    state
        .payments
        .consume(&verified.payment_id, &eigen.id)
        .await?;

    if let Some(count) = req.wallet_count {
        let patch = crate::model::eigen::ConfigPatch {
            wallet_count: Some(count),
            ..Default::default()
        };
        let _ = state.registry.update_config(&eigen.id, &patch).await;
    }

    Ok((
        StatusCode::CREATED,
        Json(LaunchResponse {
            token_address: launched.token,
            eigen_id: eigen.id,
            pool_id: format!("{:#x}", launched.pool_id),
            allocation: req.allocation.unwrap_or(0.0),
            tx_hashes,
            status: funded.status,
        }),
    ))
}

// ── Shared admission ────────────────────────────────────────────────

async fn admit_payment(
    state: &AppState,
    headers: &HeaderMap,
    required: U256,
) -> Result<VerifiedPayment, ApiError> {
    let Some(header) = headers.get("x-payment").and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::PaymentRequired(Box::new(
            state.payments.requirements(required),
        )));
    };
    Ok(state.payments.verify(header, required).await?)
}
