pub mod exec;
pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::chain::types::LogFilter;
use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::{Eigen, EigenStatus, u256_to_f64};
use crate::model::pool::PoolVersion;
use crate::model::trade::{TradeKind, TradeStatus};
use crate::quote::Side;
use crate::registry::EigenRegistry;
use crate::wallet::WalletSet;

use exec::{ExecOutcome, Executor};
use plan::{LiquidationTrigger, PlanContext, PlannedAction, PlannedTrade, cadence_wait};

/// Identical consecutive reverts before the eigen is parked.
const REVERT_STREAK_LIMIT: u32 = 3;

/// Liquidation gives up and settles what it has after this many ticks with
/// nothing left above dust.
const LIQUIDATION_TICK_LIMIT: u32 = 10;

// ── Priority commands ───────────────────────────────────────────────

/// One higher-priority action injected by the lifecycle controller. The
/// runner handles it ahead of the next planned trade.
#[derive(Debug, Clone, Copy)]
pub enum PriorityAction {
    TakeProfit,
    Liquidate,
    Withdraw { to: Address },
}

#[derive(Debug, Default)]
pub struct PriorityOutcome {
    pub tx_hashes: Vec<B256>,
    pub amount_wei: U256,
}

struct PriorityCommand {
    action: PriorityAction,
    reply: oneshot::Sender<KeeperResult<PriorityOutcome>>,
}

struct EigenHandle {
    priority_tx: mpsc::Sender<PriorityCommand>,
    join: JoinHandle<()>,
}

// ── Scheduler facade ────────────────────────────────────────────────

/// Owns exactly one cooperative runner task per active eigen. Lifecycle
/// commands reach a running eigen through its priority channel; eigens
/// without a runner are served inline.
pub struct TradeScheduler {
    registry: Arc<EigenRegistry>,
    chain: Arc<ChainClient>,
    executor: Arc<Executor>,
    master_secret: String,
    stablecoin: Address,
    tasks: Mutex<HashMap<String, EigenHandle>>,
}

impl TradeScheduler {
    pub fn new(
        registry: Arc<EigenRegistry>,
        chain: Arc<ChainClient>,
        executor: Arc<Executor>,
        master_secret: String,
        stablecoin: Address,
    ) -> Self {
        Self {
            registry,
            chain,
            executor,
            master_secret,
            stablecoin,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn build_wallets(&self, eigen: &Eigen) -> KeeperResult<WalletSet> {
        let targets = vec![eigen.pool.router, eigen.token, self.stablecoin, eigen.owner];
        WalletSet::derive(
            &self.master_secret,
            &eigen.id,
            eigen.chain_id,
            eigen.config.wallet_count,
            targets,
        )
    }

    /// Spawn the runner for an eigen unless one is already alive.
    pub async fn ensure_running(self: &Arc<Self>, eigen_id: &str) -> KeeperResult<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(eigen_id) {
            if !handle.join.is_finished() {
                return Ok(());
            }
        }

        let eigen = self.registry.require(eigen_id).await?;
        let (priority_tx, priority_rx) = mpsc::channel(4);
        let runner = Runner::new(
            self.registry.clone(),
            self.chain.clone(),
            self.executor.clone(),
            self.build_wallets(&eigen)?,
            eigen.id.clone(),
        );
        let join = tokio::spawn(runner.run(priority_rx));
        tasks.insert(
            eigen_id.to_string(),
            EigenHandle { priority_tx, join },
        );
        info!(eigen = eigen_id, "scheduler task started");
        Ok(())
    }

    /// Respawn runners for everything that should be trading, after a
    /// restart.
    pub async fn resume_all(self: &Arc<Self>) -> KeeperResult<usize> {
        let mut started = 0;
        for status in [EigenStatus::Active, EigenStatus::Liquidating] {
            for id in self.registry.ids_with_status(status).await? {
                if self.ensure_running(&id).await.is_ok() {
                    started += 1;
                }
            }
        }
        Ok(started)
    }

    pub async fn running_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        tasks.values().filter(|h| !h.join.is_finished()).count()
    }

    /// Route a lifecycle action: through the runner when one is alive,
    /// inline otherwise.
    pub async fn submit_priority(
        self: &Arc<Self>,
        eigen_id: &str,
        action: PriorityAction,
    ) -> KeeperResult<PriorityOutcome> {
        let sender = {
            let tasks = self.tasks.lock().await;
            tasks
                .get(eigen_id)
                .filter(|h| !h.join.is_finished())
                .map(|h| h.priority_tx.clone())
        };

        if let Some(sender) = sender {
            let (reply_tx, reply_rx) = oneshot::channel();
            if sender
                .send(PriorityCommand {
                    action: action.clone(),
                    reply: reply_tx,
                })
                .await
                .is_ok()
            {
                return reply_rx
                    .await
                    .map_err(|_| KeeperError::upstream("scheduler dropped the command"))?;
            }
        }

        // No live runner: serve the action right here.
        let eigen = self.registry.require(eigen_id).await?;
        let wallets = self.build_wallets(&eigen)?;
        let mut runner = Runner::new(
            self.registry.clone(),
            self.chain.clone(),
            self.executor.clone(),
            wallets,
            eigen.id.clone(),
        );
        runner.handle_action(action).await
    }
}

// ── Per-eigen runner ────────────────────────────────────────────────

enum StepResult {
    Sleep(Duration),
    /// Status changed (or must change); re-read at the loop head now.
    Continue,
    /// Runner is done with this eigen.
    Exit,
}

struct Runner {
    registry: Arc<EigenRegistry>,
    chain: Arc<ChainClient>,
    executor: Arc<Executor>,
    wallets: WalletSet,
    id: String,
    rng: StdRng,
    rr: u32,
    revert_streak: Option<(String, u32)>,
    liquidation_ticks: u32,
    last_sample_hour: i64,
}

impl Runner {
    fn new(
        registry: Arc<EigenRegistry>,
        chain: Arc<ChainClient>,
        executor: Arc<Executor>,
        wallets: WalletSet,
        id: String,
    ) -> Self {
        // Seeded per eigen: planning is reproducible for a given id.
        let digest = Sha256::digest(id.as_bytes());
        let seed = u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"));
        Self {
            registry,
            chain,
            executor,
            wallets,
            id,
            rng: StdRng::seed_from_u64(seed),
            rr: 0,
            revert_streak: None,
            liquidation_ticks: 0,
            last_sample_hour: 0,
        }
    }

    async fn run(mut self, mut priority_rx: mpsc::Receiver<PriorityCommand>) {
        loop {
            // Priority actions jump the queue.
            while let Ok(cmd) = priority_rx.try_recv() {
                let result = self.handle_action(cmd.action).await;
                let _ = cmd.reply.send(result);
            }

            let eigen = match self.registry.get(&self.id).await {
                Ok(Some(eigen)) => eigen,
                Ok(None) => {
                    error!(eigen = %self.id, "eigen vanished from the registry");
                    return;
                }
                Err(e) => {
                    warn!(eigen = %self.id, error = %e, "registry read failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let step = match eigen.status {
                EigenStatus::Active => match self.step_active(&eigen).await {
                    Ok(step) => step,
                    Err(e) if e.is_recoverable() => {
                        warn!(eigen = %self.id, error = %e, "cycle failed, sleeping one cadence");
                        StepResult::Sleep(cadence_wait(&eigen, &mut self.rng))
                    }
                    Err(e) => {
                        error!(eigen = %self.id, error = %e, "invariant violation, suspending");
                        let _ = self
                            .registry
                            .transition(&self.id, EigenStatus::Active, EigenStatus::Suspended)
                            .await;
                        StepResult::Exit
                    }
                },
                EigenStatus::Liquidating => match self.step_liquidating(&eigen).await {
                    Ok(step) => step,
                    Err(e) => {
                        warn!(eigen = %self.id, error = %e, "liquidation step failed");
                        StepResult::Sleep(cadence_wait(&eigen, &mut self.rng))
                    }
                },
                // Suspended and pre-funding eigens have no runner; lifecycle
                // respawns on resume/fund. Terminal states are sinks.
                _ => StepResult::Exit,
            };

            match step {
                StepResult::Continue => {}
                StepResult::Exit => {
                    info!(eigen = %self.id, "scheduler task exiting");
                    return;
                }
                StepResult::Sleep(wait) => {
                    // Sleep is also the cancellation point for priority
                    // commands.
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        cmd = priority_rx.recv() => {
                            if let Some(cmd) = cmd {
                                let result = self.handle_action(cmd.action).await;
                                let _ = cmd.reply.send(result);
                            }
                        }
                    }
                }
            }
        }
    }

    // ── Active trading ──────────────────────────────────────────────

    async fn step_active(&mut self, eigen: &Eigen) -> KeeperResult<StepResult> {
        // An admin wallet-count extension lands mid-flight.
        if eigen.config.wallet_count > self.wallets.len() {
            self.wallets.extend_to(eigen.config.wallet_count)?;
            self.registry
                .put_wallets(&self.id, &self.wallets.addresses())
                .await?;
        }

        let now = chrono::Utc::now().timestamp();
        if eigen.volume_exhausted(now) {
            info!(eigen = %self.id, "volume target reached, liquidating");
            self.registry
                .transition(&self.id, EigenStatus::Active, EigenStatus::Liquidating)
                .await?;
            return Ok(StepResult::Continue);
        }

        let spot = self.executor.spot(eigen).await?;
        self.sample_price(eigen, spot, now).await;

        let external_buy_raw = if eigen.config.reactive_sell_mode {
            self.observe_external_buy(eigen).await.unwrap_or_default()
        } else {
            None
        };

        let ctx = PlanContext {
            eigen: eigen.clone(),
            spot_wei: spot,
            external_buy_raw,
        };

        match plan::plan_next(&ctx, &mut self.rng)? {
            PlannedAction::Wait(wait) => Ok(StepResult::Sleep(wait)),
            PlannedAction::StartLiquidation(trigger) => {
                info!(eigen = %self.id, ?trigger, "planner triggered liquidation");
                self.registry
                    .transition(&self.id, EigenStatus::Active, EigenStatus::Liquidating)
                    .await?;
                Ok(StepResult::Continue)
            }
            PlannedAction::Trade(trade) => {
                // Backpressure: an unservable reservation defers the cycle.
                if self.registry.reserve(&self.id, trade.reserve_wei).await.is_err() {
                    return Ok(StepResult::Sleep(cadence_wait(eigen, &mut self.rng)));
                }
                let suspended = self.execute_and_commit(eigen, &trade).await?;
                if suspended {
                    return Ok(StepResult::Exit);
                }
                Ok(StepResult::Sleep(cadence_wait(eigen, &mut self.rng)))
            }
        }
    }

    /// Returns true when a revert streak suspended the eigen.
    async fn execute_and_commit(
        &mut self,
        eigen: &Eigen,
        trade: &PlannedTrade,
    ) -> KeeperResult<bool> {
        let outcome = self
            .executor
            .execute(eigen, &self.wallets, trade, self.rr)
            .await;
        self.rr = (self.rr + 1) % self.wallets.len().max(1);

        match outcome {
            Ok(ExecOutcome::Settled(settlement)) => {
                self.registry
                    .commit_settlement(&self.id, trade.reserve_wei, &settlement)
                    .await?;
                if settlement.status == TradeStatus::Reverted {
                    let reason = settlement
                        .revert_reason
                        .unwrap_or_else(|| "reverted".into());
                    return self.bump_revert_streak(reason).await;
                }
                self.revert_streak = None;
                Ok(false)
            }
            Ok(ExecOutcome::Dropped { reason }) => {
                self.registry.release(&self.id, trade.reserve_wei).await?;
                info!(eigen = %self.id, %reason, "cycle dropped");
                self.bump_revert_streak(reason).await
            }
            Err(e) => {
                self.registry.release(&self.id, trade.reserve_wei).await?;
                Err(e)
            }
        }
    }

    async fn bump_revert_streak(&mut self, reason: String) -> KeeperResult<bool> {
        let count = match &self.revert_streak {
            Some((last, n)) if *last == reason => n + 1,
            _ => 1,
        };
        self.revert_streak = Some((reason.clone(), count));

        if count >= REVERT_STREAK_LIMIT {
            warn!(
                eigen = %self.id,
                %reason,
                count,
                "repeated identical failures, auto-suspending"
            );
            self.registry
                .transition(&self.id, EigenStatus::Active, EigenStatus::Suspended)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Liquidation drain ───────────────────────────────────────────

    async fn step_liquidating(&mut self, eigen: &Eigen) -> KeeperResult<StepResult> {
        if eigen.token_balance.is_zero() {
            self.registry
                .transition(&self.id, EigenStatus::Liquidating, EigenStatus::Liquidated)
                .await?;
            info!(eigen = %self.id, "position drained, liquidated");
            return Ok(StepResult::Exit);
        }

        self.liquidation_ticks += 1;
        if self.liquidation_ticks > LIQUIDATION_TICK_LIMIT {
            // What is left is stranded dust; settle rather than spin.
            warn!(
                eigen = %self.id,
                remaining = %eigen.token_balance,
                "liquidation tick limit reached, settling remainder as dust"
            );
            self.registry
                .transition(&self.id, EigenStatus::Liquidating, EigenStatus::Liquidated)
                .await?;
            return Ok(StepResult::Exit);
        }

        let trade = PlannedTrade {
            kind: TradeKind::Liquidate,
            side: Side::Sell,
            amount_in: eigen.token_balance,
            reserve_wei: U256::from(plan::GAS_HEADROOM_WEI),
            // Liquidation takes whatever the pool gives.
            limit_price_wei: U256::ZERO,
        };
        if self.registry.reserve(&self.id, trade.reserve_wei).await.is_err() {
            // Gas headroom not available as budget; try without a reserve.
            let trade = PlannedTrade {
                reserve_wei: U256::ZERO,
                ..trade
            };
            self.execute_and_commit_liquidation(eigen, &trade).await?;
            return Ok(StepResult::Sleep(Duration::from_secs(5)));
        }
        self.execute_and_commit_liquidation(eigen, &trade).await?;
        Ok(StepResult::Sleep(Duration::from_secs(5)))
    }

    async fn execute_and_commit_liquidation(
        &mut self,
        eigen: &Eigen,
        trade: &PlannedTrade,
    ) -> KeeperResult<()> {
        let outcome = self
            .executor
            .execute(eigen, &self.wallets, trade, self.rr)
            .await;
        self.rr = (self.rr + 1) % self.wallets.len().max(1);

        match outcome {
            Ok(ExecOutcome::Settled(settlement)) => {
                self.registry
                    .commit_settlement(&self.id, trade.reserve_wei, &settlement)
                    .await?;
                Ok(())
            }
            Ok(ExecOutcome::Dropped { reason }) => {
                if !trade.reserve_wei.is_zero() {
                    self.registry.release(&self.id, trade.reserve_wei).await?;
                }
                warn!(eigen = %self.id, %reason, "liquidation sell dropped");
                Ok(())
            }
            Err(e) => {
                if !trade.reserve_wei.is_zero() {
                    self.registry.release(&self.id, trade.reserve_wei).await?;
                }
                Err(e)
            }
        }
    }

    // ── Priority actions ────────────────────────────────────────────

    async fn handle_action(&mut self, action: PriorityAction) -> KeeperResult<PriorityOutcome> {
        let eigen = self.registry.require(&self.id).await?;
        match action {
            PriorityAction::TakeProfit => {
                if eigen.token_balance.is_zero() {
                    return Err(KeeperError::validation("nothing to take profit on"));
                }
                let trade = PlannedTrade {
                    kind: TradeKind::ProfitTake,
                    side: Side::Sell,
                    amount_in: eigen.token_balance,
                    reserve_wei: U256::ZERO,
                    limit_price_wei: U256::ZERO,
                };
                let outcome = self
                    .executor
                    .execute(&eigen, &self.wallets, &trade, self.rr)
                    .await?;
                match outcome {
                    ExecOutcome::Settled(s) => {
                        self.registry
                            .commit_settlement(&self.id, U256::ZERO, &s)
                            .await?;
                        Ok(PriorityOutcome {
                            tx_hashes: s.tx_hash.into_iter().collect(),
                            amount_wei: s.eth_amount_wei,
                        })
                    }
                    ExecOutcome::Dropped { reason } => Err(KeeperError::upstream(format!(
                        "take-profit not executable: {reason}"
                    ))),
                }
            }
            PriorityAction::Liquidate => {
                let from = eigen.status;
                if from != EigenStatus::Liquidating && !from.is_terminal() {
                    self.registry
                        .transition(&self.id, from, EigenStatus::Liquidating)
                        .await?;
                }
                self.liquidation_ticks = 0;
                Ok(PriorityOutcome::default())
            }
            PriorityAction::Withdraw { to } => {
                let (swept, tx_hashes) = self.executor.sweep_wallets(&self.wallets, to).await?;
                let debit = swept.min(eigen.balance_wei);
                if !debit.is_zero() {
                    self.registry.debit(&self.id, debit).await?;
                }
                info!(
                    eigen = %self.id,
                    to = %format!("{to:#x}"),
                    amount = %swept,
                    "withdrawal swept"
                );
                Ok(PriorityOutcome {
                    tx_hashes,
                    amount_wei: swept,
                })
            }
        }
    }

    // ── Observers ───────────────────────────────────────────────────

    /// Largest external buy on the pool within roughly the last cadence
    /// window, for reactive mode. Own sub-wallets are excluded.
    async fn observe_external_buy(&self, eigen: &Eigen) -> KeeperResult<Option<U256>> {
        let pool_addr = match (eigen.pool.version, eigen.pool.pool) {
            (PoolVersion::V4, _) | (_, None) => return Ok(None),
            (_, Some(addr)) => addr,
        };

        let head = self.chain.block_number().await?;
        let window = (eigen.config.cadence_secs() as u64).clamp(10, 600);
        let filter = LogFilter {
            from_block: head.saturating_sub(window),
            to_block: head,
            address: Some(eigen.token),
            topics: vec![
                Some(exec::IERC20::Transfer::SIGNATURE_HASH),
                Some(B256::left_padding_from(pool_addr.as_slice())),
            ],
        };
        let logs = self.chain.get_logs(&filter).await?;

        let own: Vec<Address> = self.wallets.addresses().into_iter().map(|(_, a)| a).collect();
        let mut best: Option<U256> = None;
        for log in logs {
            let Ok(event) =
                exec::IERC20::Transfer::decode_raw_log(log.topics.iter().copied(), &log.data)
            else {
                continue;
            };
            if own.contains(&event.to) {
                continue;
            }
            if best.map(|b| event.value > b).unwrap_or(true) {
                best = Some(event.value);
            }
        }
        Ok(best)
    }

    /// One mid-price sample per hour into the price history.
    async fn sample_price(&mut self, eigen: &Eigen, spot: U256, now: i64) {
        let hour = now / 3600 * 3600;
        if hour == self.last_sample_hour {
            return;
        }
        self.last_sample_hour = hour;

        let price_eth = u256_to_f64(spot) / 1e18;
        let reading = self.executor.oracle_read(eigen).await;
        if let Err(e) = self
            .registry
            .record_price(&self.id, hour, price_eth, reading.price_usd)
            .await
        {
            warn!(eigen = %self.id, error = %e, "price sample write failed");
        }
    }
}
