use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::u256_to_f64;
use crate::model::pool::PoolDescriptor;
use crate::quote::QuoteEngine;
use crate::registry::Db;

/// An hourly table entry older than this is served with `stale = true`.
const STALE_AFTER_SECS: i64 = 2 * 3600;

const LLAMA_PRICES_URL: &str = "https://coins.llama.fi/prices/current";

/// What the oracle hands upstream. A missing piece yields `price: None`
/// with a reason; the caller decides whether to proceed.
#[derive(Debug, Clone)]
pub struct OracleReading {
    /// USD price per whole token, when computable.
    pub price_usd: Option<f64>,
    /// Spot price in quote-token wei per 10^18 raw token units.
    pub spot_wei: Option<U256>,
    pub stale: bool,
    pub reason: Option<String>,
}

impl OracleReading {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            price_usd: None,
            spot_wei: None,
            stale: false,
            reason: Some(reason.into()),
        }
    }
}

/// Fair reference price: pool spot × hourly quote-token→USD table. The
/// table refreshes asynchronously; staleness is tolerated and flagged.
pub struct PriceOracle {
    quote: Arc<QuoteEngine>,
    db: Db,
    chain_slug: &'static str,
}

impl PriceOracle {
    pub fn new(quote: Arc<QuoteEngine>, db: Db, chain_id: u64) -> Self {
        Self {
            quote,
            db,
            chain_slug: chain_slug(chain_id),
        }
    }

    pub async fn read(&self, pool: &PoolDescriptor, token: Address) -> OracleReading {
        let spot = match self.quote.spot_price(pool, token).await {
            Ok(spot) => spot,
            Err(e) => return OracleReading::unavailable(format!("spot price: {e}")),
        };

        let quote_token = pool.quote_token(token);
        let (usd, stale) = match self.usd_for(quote_token).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                return OracleReading {
                    price_usd: None,
                    spot_wei: Some(spot),
                    stale: false,
                    reason: Some(format!("no USD row for quote token {quote_token:#x}")),
                };
            }
            Err(e) => {
                return OracleReading {
                    price_usd: None,
                    spot_wei: Some(spot),
                    stale: false,
                    reason: Some(format!("usd table: {e}")),
                };
            }
        };

        // spot is wei-per-1e18-raw; as f64 whole-token terms that is /1e18.
        let spot_f = u256_to_f64(spot) / 1e18;
        OracleReading {
            price_usd: Some(spot_f * usd),
            spot_wei: Some(spot),
            stale,
            reason: None,
        }
    }

    /// Latest table row for a quote token, with its staleness flag.
    pub async fn usd_for(&self, quote_token: Address) -> KeeperResult<Option<(f64, bool)>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.lock().await;
        let row: Option<(i64, f64)> = conn
            .query_row(
                "SELECT hour, usd FROM quote_prices WHERE quote_token = ?1
                 ORDER BY hour DESC LIMIT 1",
                [format!("{quote_token:#x}")],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| KeeperError::Upstream(format!("database: {e}")))?;

        Ok(row.map(|(hour, usd)| (usd, now - hour > STALE_AFTER_SECS)))
    }

    pub async fn record_usd(&self, quote_token: Address, hour: i64, usd: f64) -> KeeperResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO quote_prices (quote_token, hour, usd) VALUES (?1, ?2, ?3)",
            params![format!("{quote_token:#x}"), hour, usd],
        )
        .map_err(|e| KeeperError::Upstream(format!("database: {e}")))?;
        Ok(())
    }

    /// Hourly refresh loop for the quote-token→USD table. Failures leave
    /// the previous rows in place; readers see them flagged stale.
    pub fn spawn_refresh(self: Arc<Self>, quote_tokens: Vec<Address>) {
        if quote_tokens.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let http = reqwest::Client::new();
            loop {
                for token in &quote_tokens {
                    match fetch_usd(&http, self.chain_slug, *token).await {
                        Ok(usd) => {
                            let hour = chrono::Utc::now().timestamp() / 3600 * 3600;
                            if let Err(e) = self.record_usd(*token, hour, usd).await {
                                warn!(token = %format!("{token:#x}"), error = %e, "usd row write failed");
                            } else {
                                debug!(token = %format!("{token:#x}"), usd, "usd table refreshed");
                            }
                        }
                        Err(e) => {
                            warn!(token = %format!("{token:#x}"), error = %e, "usd refresh failed, serving stale");
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }
}

#[derive(Debug, serde::Deserialize)]
struct LlamaPrices {
    coins: std::collections::HashMap<String, LlamaCoin>,
}

#[derive(Debug, serde::Deserialize)]
struct LlamaCoin {
    price: f64,
}

async fn fetch_usd(http: &reqwest::Client, slug: &str, token: Address) -> KeeperResult<f64> {
    let key = format!("{slug}:{token:#x}");
    let url = format!("{LLAMA_PRICES_URL}/{key}");
    let resp: LlamaPrices = http
        .get(&url)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| KeeperError::upstream(format!("price feed: {e}")))?
        .json()
        .await
        .map_err(|e| KeeperError::upstream(format!("price feed body: {e}")))?;

    resp.coins
        .get(&key)
        .map(|c| c.price)
        .ok_or_else(|| KeeperError::upstream(format!("price feed has no entry for {key}")))
}

fn chain_slug(chain_id: u64) -> &'static str {
    match chain_id {
        1 => "ethereum",
        8453 => "base",
        42161 => "arbitrum",
        10 => "optimism",
        143 => "monad",
        _ => "ethereum",
    }
}
