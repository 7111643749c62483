use std::net::SocketAddr;
use std::str::FromStr;

use alloy::primitives::Address;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::HeaderValue;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rusqlite::OptionalExtension;

use crate::model::apikey;

use super::error::ApiError;
use super::rate_limit::{DEFAULT_LIMIT, RouteClass};
use super::state::AppState;

/// Authenticated caller, resolved from `X-API-Key`. The stored hash is
/// compared against the full presented token; the prefix only narrows the
/// lookup.
pub struct ApiKeyAuth {
    pub owner: Address,
    pub prefix: String,
    pub rate_limit: u32,
}

impl FromRequestParts<AppState> for ApiKeyAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".into()))?;

        let prefix = apikey::token_prefix(token)
            .ok_or_else(|| ApiError::Unauthorized("malformed API key".into()))?;

        let row = {
            let conn = state.db.lock().await;
            conn.query_row(
                "SELECT hashed_secret, owner, rate_limit, revoked FROM api_keys WHERE prefix = ?1",
                [prefix],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, u32>(2)?,
                        r.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| ApiError::Internal(format!("key lookup: {e}")))?
        };

        let Some((hashed, owner, rate_limit, revoked)) = row else {
            return Err(ApiError::Unauthorized("unknown API key".into()));
        };
        if revoked {
            return Err(ApiError::Unauthorized("API key revoked".into()));
        }
        if apikey::hash_token(token) != hashed {
            return Err(ApiError::Unauthorized("invalid API key".into()));
        }

        let owner = Address::from_str(&owner)
            .map_err(|e| ApiError::Internal(format!("stored owner: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let conn = state.db.lock().await;
        let _ = conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE prefix = ?2",
            rusqlite::params![now, prefix],
        );

        Ok(ApiKeyAuth {
            owner,
            prefix: prefix.to_string(),
            rate_limit,
        })
    }
}

/// Per-(caller, route-class) limiting. Authenticated callers are keyed and
/// sized by their key; everyone else by IP at the default limit.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let class = RouteClass::of_path(req.uri().path());

    let key_prefix = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .and_then(apikey::token_prefix)
        .map(|p| p.to_string());

    let (caller, limit) = match key_prefix {
        Some(prefix) => match key_limit(&state, &prefix).await {
            Some(pair) => pair,
            None => (client_ip(&req), DEFAULT_LIMIT),
        },
        None => (client_ip(&req), DEFAULT_LIMIT),
    };

    match state.rate.check(&caller, class, limit).await {
        Ok((limit, remaining)) => {
            let mut response = next.run(req).await;
            set_limit_headers(&mut response, limit, remaining);
            response
        }
        Err(retry_after) => {
            let mut response = ApiError::RateLimited { retry_after }.into_response();
            set_limit_headers(&mut response, limit, 0);
            response
        }
    }
}

async fn key_limit(state: &AppState, prefix: &str) -> Option<(String, u32)> {
    let conn = state.db.lock().await;
    let limit: u32 = conn
        .query_row(
            "SELECT rate_limit FROM api_keys WHERE prefix = ?1 AND revoked = 0",
            [prefix],
            |r| r.get(0),
        )
        .optional()
        .ok()??;
    Some((format!("key:{prefix}"), limit))
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn set_limit_headers(response: &mut Response, limit: u32, remaining: u32) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
}
