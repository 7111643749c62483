pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chain::ChainClient;
use crate::config::KeeperConfig;
use crate::lifecycle::LifecycleController;
use crate::oracle::PriceOracle;
use crate::payment::PaymentGateway;
use crate::quote::QuoteEngine;
use crate::registry::{self, EigenRegistry};
use crate::scheduler::TradeScheduler;
use crate::scheduler::exec::Executor;

use rate_limit::RateLimiter;
use state::AppState;

/// Wire every component and serve the keeper. One process hosts the HTTP
/// surface, the scheduler tasks, and the background refreshers.
pub async fn serve(config: KeeperConfig) -> Result<()> {
    let db = registry::open(&config.database_path)?;
    let chain = Arc::new(
        ChainClient::new(config.rpc_endpoints.clone(), config.chain_id)
            .map_err(|e| anyhow::anyhow!("chain client: {e}"))?,
    );
    let registry = Arc::new(EigenRegistry::new(db.clone()));
    let quote = Arc::new(QuoteEngine::new(chain.clone()));
    let oracle = Arc::new(PriceOracle::new(
        quote.clone(),
        db.clone(),
        config.chain_id,
    ));
    let executor = Arc::new(Executor::new(chain.clone(), quote.clone(), oracle.clone()));
    let scheduler = Arc::new(TradeScheduler::new(
        registry.clone(),
        chain.clone(),
        executor.clone(),
        config.master_secret.clone(),
        config.stablecoin,
    ));
    let lifecycle = Arc::new(LifecycleController::new(
        registry.clone(),
        scheduler.clone(),
        executor.clone(),
        chain.clone(),
        config.master_secret.clone(),
        config.launchpad,
    ));
    let payments = Arc::new(PaymentGateway::new(
        db.clone(),
        chain.clone(),
        config.facilitator_url.clone(),
        config.payment_recipient,
        config.stablecoin,
        config.confirmation_depth,
    ));
    let rate = Arc::new(RateLimiter::new());
    rate.clone().spawn_sweep();

    // Quote-token USD table refresh; stale rows are flagged, not fatal.
    let mut usd_tokens = vec![config.stablecoin];
    if let Some(wnative) = config.hints.wnative {
        usd_tokens.push(wnative);
    }
    oracle.clone().spawn_refresh(usd_tokens);

    let resumed = scheduler.resume_all().await.unwrap_or(0);
    if resumed > 0 {
        info!(resumed, "scheduler tasks restored from the registry");
    }

    let state = AppState {
        registry,
        payments,
        lifecycle,
        scheduler,
        chain,
        quote,
        oracle,
        rate,
        db,
        payment_recipient: config.payment_recipient,
        stablecoin: config.stablecoin,
        hints: config.hints.clone(),
        started_at: chrono::Utc::now().timestamp(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Purchase surface (402 handshake)
        .route("/api/agents/buy-volume", post(handlers::purchase::buy_volume))
        .route("/api/launch", post(handlers::purchase::launch))
        // Token checks
        .route("/api/tokens/{address}/verify", get(handlers::tokens::verify))
        // Read-only eigen queries
        .route("/api/eigens", get(handlers::eigens::list))
        .route("/api/eigens/{id}", get(handlers::eigens::get))
        .route("/api/eigens/{id}/trades", get(handlers::eigens::trades))
        .route("/api/eigens/{id}/pnl", get(handlers::eigens::pnl))
        .route("/api/eigens/{id}/wallets", get(handlers::eigens::wallets))
        .route(
            "/api/eigens/{id}/price-history",
            get(handlers::eigens::price_history),
        )
        // API keys (signed-message enrolment)
        .route(
            "/api/agent/keys",
            get(handlers::keys::list).post(handlers::keys::create),
        )
        .route("/api/agent/keys/{prefix}", delete(handlers::keys::revoke))
        // Authenticated lifecycle surface
        .route("/api/agent/eigens/{id}", patch(handlers::actions::patch))
        .route(
            "/api/agent/eigens/{id}/{action}",
            post(handlers::actions::action),
        )
        // Operational
        .route("/api/pricing", get(handlers::misc::pricing))
        .route("/api/health", get(handlers::misc::health))
        .route("/api/stats", get(handlers::misc::stats))
        .layer(axum::middleware::from_fn_with_state::<
            _,
            AppState,
            (axum::extract::State<AppState>, axum::extract::Request),
        >(state.clone(), middleware::rate_limit))
        .layer(cors)
        .with_state(state);

    let addr = config.bind_addr.clone();
    println!("eigenswarm keeper listening on {addr}");
    println!("  Purchase: POST http://{addr}/api/agents/buy-volume");
    println!("  Launch:   POST http://{addr}/api/launch");
    println!("  Eigens:   GET  http://{addr}/api/eigens");
    println!("  Health:   GET  http://{addr}/api/health");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("running server")?;

    Ok(())
}
