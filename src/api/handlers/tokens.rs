use alloy::primitives::aliases::U24;
use alloy::primitives::{Address, Bytes};
use alloy::sol;
use alloy::sol_types::SolCall;
use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::error::KeeperResult;
use crate::model::pool::{PoolDescriptor, PoolVersion};
use crate::quote::ICurveRouter;

sol! {
    interface IUniswapV3Factory {
        function getPool(address tokenA, address tokenB, uint24 fee) external view returns (address pool);
    }
}

const FEE_TIERS: [(u32, i32); 3] = [(500, 10), (3000, 60), (10_000, 200)];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolDescriptor>,
}

/// `GET /api/tokens/{address}/verify`
pub async fn verify(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let token: Address = address
        .parse()
        .map_err(|_| ApiError::bad_request("not an address"))?;

    let Ok((name, symbol, decimals)) = state.quote.token_metadata(token).await else {
        return Ok(Json(VerifyResponse {
            valid: false,
            name: None,
            symbol: None,
            decimals: None,
            pool: None,
        }));
    };

    let pool = resolve_pool(&state, token).await.unwrap_or(None);
    Ok(Json(VerifyResponse {
        valid: true,
        name: Some(name),
        symbol: Some(symbol),
        decimals: Some(decimals),
        pool,
    }))
}

/// Find the pool a bare token trades in: the bonding curve while the token
/// has not graduated, the v3 pair against wrapped native after.
pub async fn resolve_pool(state: &AppState, token: Address) -> KeeperResult<Option<PoolDescriptor>> {
    let hints = &state.hints;

    if let Some(curve) = hints.curve_router {
        let call = ICurveRouter::isGraduatedCall { token }.abi_encode();
        if let Ok(raw) = state.chain.call(curve, Bytes::from(call), None).await {
            if let Ok(graduated) = ICurveRouter::isGraduatedCall::abi_decode_returns(&raw) {
                if !graduated {
                    return Ok(Some(PoolDescriptor {
                        version: PoolVersion::BondingCurve,
                        pool: Some(curve),
                        pool_id: None,
                        token0: token,
                        token1: hints.wnative.unwrap_or(Address::ZERO),
                        fee: 0,
                        tick_spacing: None,
                        router: curve,
                    }));
                }
            }
        }
    }

    let (Some(factory), Some(wnative)) = (hints.v3_factory, hints.wnative) else {
        return Ok(None);
    };
    let router = hints.dex_router.unwrap_or(factory);

    for (fee, tick_spacing) in FEE_TIERS {
        let call = IUniswapV3Factory::getPoolCall {
            tokenA: token,
            tokenB: wnative,
            fee: U24::from(fee),
        }
        .abi_encode();
        let Ok(raw) = state.chain.call(factory, Bytes::from(call), None).await else {
            continue;
        };
        let Ok(pool) = IUniswapV3Factory::getPoolCall::abi_decode_returns(&raw) else {
            continue;
        };
        if pool == Address::ZERO {
            continue;
        }
        // Uniswap orders the pair by address.
        let (token0, token1) = if token < wnative {
            (token, wnative)
        } else {
            (wnative, token)
        };
        return Ok(Some(PoolDescriptor {
            version: PoolVersion::V3,
            pool: Some(pool),
            pool_id: None,
            token0,
            token1,
            fee,
            tick_spacing: Some(tick_spacing),
            router,
        }));
    }
    Ok(None)
}
