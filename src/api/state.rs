use std::sync::Arc;

use alloy::primitives::Address;

use crate::chain::ChainClient;
use crate::config::PoolHints;
use crate::lifecycle::LifecycleController;
use crate::oracle::PriceOracle;
use crate::payment::PaymentGateway;
use crate::quote::QuoteEngine;
use crate::registry::{Db, EigenRegistry};
use crate::scheduler::TradeScheduler;

use super::rate_limit::RateLimiter;

/// Shared handles for every request. All components are `Arc`s; the state
/// itself clones per request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EigenRegistry>,
    pub payments: Arc<PaymentGateway>,
    pub lifecycle: Arc<LifecycleController>,
    pub scheduler: Arc<TradeScheduler>,
    pub chain: Arc<ChainClient>,
    pub quote: Arc<QuoteEngine>,
    pub oracle: Arc<PriceOracle>,
    pub rate: Arc<RateLimiter>,
    pub db: Db,
    pub payment_recipient: Address,
    pub stablecoin: Address,
    pub hints: PoolHints,
    pub started_at: i64,
}
