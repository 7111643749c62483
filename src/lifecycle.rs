use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::chain::types::CallRequest;
use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::{ConfigPatch, Eigen, EigenClass, EigenStatus};
use crate::model::package::Package;
use crate::model::pool::{PoolDescriptor, PoolVersion};
use crate::registry::EigenRegistry;
use crate::scheduler::exec::Executor;
use crate::scheduler::{PriorityAction, PriorityOutcome, TradeScheduler};
use crate::wallet::{TxParams, WalletSet};

/// Identity the treasury wallet derives under. Not an eigen id on purpose:
/// no eigen can ever collide with it.
const TREASURY_WALLET_ID: &str = "keeper-treasury";

/// How long `terminate` waits for the drain before handing back a
/// still-liquidating eigen.
const DRAIN_WAIT: Duration = Duration::from_secs(30);

sol! {
    interface ILaunchpad {
        function launch(string name, string symbol, string metadataUri) external payable returns (address token, bytes32 poolId);

        event TokenLaunched(address indexed token, bytes32 poolId, address curve);
    }
}

#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub token: Address,
    pub pool_id: B256,
    pub curve: Address,
    pub tx_hash: B256,
}

/// Admin surface over the registry and scheduler: every operation validates
/// ownership, drives the status machine, and (where the chain is involved)
/// funnels exactly one priority action through the scheduler.
pub struct LifecycleController {
    registry: Arc<EigenRegistry>,
    scheduler: Arc<TradeScheduler>,
    executor: Arc<Executor>,
    chain: Arc<ChainClient>,
    master_secret: String,
    launchpad: Option<Address>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<EigenRegistry>,
        scheduler: Arc<TradeScheduler>,
        executor: Arc<Executor>,
        chain: Arc<ChainClient>,
        master_secret: String,
        launchpad: Option<Address>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            executor,
            chain,
            master_secret,
            launchpad,
        }
    }

    pub fn assert_owner(eigen: &Eigen, caller: Address) -> KeeperResult<()> {
        if eigen.owner != caller {
            return Err(KeeperError::auth(format!(
                "caller {caller:#x} does not own {}",
                eigen.id
            )));
        }
        Ok(())
    }

    // ── Creation and funding ────────────────────────────────────────

    /// Create a fresh eigen and persist its wallet derivation records.
    /// Purchases start in `pending_funding`, launches in `pending_lp`.
    pub async fn create(
        &self,
        owner: Address,
        agent_identity: Option<String>,
        token: Address,
        pool: PoolDescriptor,
        package: &Package,
        initial_status: EigenStatus,
    ) -> KeeperResult<Eigen> {
        pool.validate()?;
        if !matches!(
            initial_status,
            EigenStatus::PendingFunding | EigenStatus::PendingLp
        ) {
            return Err(KeeperError::invariant("eigens are born pending"));
        }
        let now = chrono::Utc::now().timestamp();
        let eigen = Eigen {
            id: Eigen::new_id(),
            owner,
            agent_identity,
            chain_id: self.chain.chain_id(),
            token,
            pool,
            class: package.class,
            config: package.class.default_config(),
            deposited_wei: U256::ZERO,
            balance_wei: U256::ZERO,
            reserved_wei: U256::ZERO,
            token_balance: U256::ZERO,
            average_entry_wei: U256::ZERO,
            realized_pnl_wei: alloy::primitives::I256::ZERO,
            gas_spent_wei: U256::ZERO,
            fee_accrued_wei: U256::ZERO,
            volume_produced_wei: U256::ZERO,
            volume_cap_wei: package.volume_cap_wei,
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
            status: initial_status,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            expires_at: now + (package.duration_hours * 3600) as i64,
        };

        self.registry.create(&eigen).await?;
        let wallets = self.scheduler.build_wallets(&eigen)?;
        self.registry
            .put_wallets(&eigen.id, &wallets.addresses())
            .await?;
        info!(eigen = %eigen.id, owner = %format!("{owner:#x}"), "eigen created");
        Ok(eigen)
    }

    /// Seed the sub-wallets from the treasury, credit the ledger, and set
    /// the eigen trading. Idempotent on the status edge: a second funding
    /// of an active eigen is a plain top-up.
    pub async fn fund(&self, eigen_id: &str, amount: U256) -> KeeperResult<(Eigen, Vec<B256>)> {
        let eigen = self.registry.require(eigen_id).await?;
        if eigen.status.is_terminal() {
            return Err(KeeperError::validation("cannot fund a terminal eigen"));
        }

        let wallets = self.scheduler.build_wallets(&eigen)?;
        let targets: Vec<Address> = wallets.addresses().into_iter().map(|(_, a)| a).collect();
        let treasury = self.treasury_for(&targets)?;
        let hashes = self
            .executor
            .distribute_funding(&treasury, &targets, amount)
            .await?;
        info!(eigen = %eigen_id, %amount, txs = hashes.len(), "funding distributed");

        self.registry.fund(eigen_id, amount).await?;

        let funded = match eigen.status {
            EigenStatus::PendingFunding | EigenStatus::PendingLp => {
                self.registry
                    .transition(eigen_id, eigen.status, EigenStatus::Active)
                    .await?
            }
            _ => self.registry.require(eigen_id).await?,
        };

        if funded.status == EigenStatus::Active {
            self.scheduler.ensure_running(eigen_id).await?;
        }
        Ok((funded, hashes))
    }

    fn treasury_for(&self, targets: &[Address]) -> KeeperResult<WalletSet> {
        WalletSet::derive(
            &self.master_secret,
            TREASURY_WALLET_ID,
            self.chain.chain_id(),
            1,
            targets.to_vec(),
        )
    }

    /// The treasury's own funding address, surfaced for ops.
    pub fn treasury_address(&self) -> KeeperResult<Address> {
        crate::wallet::derive_address(&self.master_secret, TREASURY_WALLET_ID, 0)
    }

    // ── Config ──────────────────────────────────────────────────────

    pub async fn adjust(
        &self,
        eigen_id: &str,
        caller: Address,
        patch: &ConfigPatch,
    ) -> KeeperResult<(Eigen, bool)> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        self.registry.update_config(eigen_id, patch).await
    }

    pub async fn upgrade_class(
        &self,
        eigen_id: &str,
        caller: Address,
        class: EigenClass,
    ) -> KeeperResult<Eigen> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        self.registry.upgrade_class(eigen_id, class).await
    }

    // ── Pause and resume ────────────────────────────────────────────

    pub async fn suspend(&self, eigen_id: &str, caller: Address) -> KeeperResult<Eigen> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        self.registry
            .transition(eigen_id, EigenStatus::Active, EigenStatus::Suspended)
            .await
    }

    pub async fn resume(&self, eigen_id: &str, caller: Address) -> KeeperResult<Eigen> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        let resumed = self
            .registry
            .transition(eigen_id, EigenStatus::Suspended, EigenStatus::Active)
            .await?;
        self.scheduler.ensure_running(eigen_id).await?;
        Ok(resumed)
    }

    // ── Settlement operations ───────────────────────────────────────

    pub async fn take_profit(
        &self,
        eigen_id: &str,
        caller: Address,
    ) -> KeeperResult<PriorityOutcome> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        self.scheduler
            .submit_priority(eigen_id, PriorityAction::TakeProfit)
            .await
    }

    pub async fn liquidate(&self, eigen_id: &str, caller: Address) -> KeeperResult<Eigen> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        self.scheduler
            .submit_priority(eigen_id, PriorityAction::Liquidate)
            .await?;
        // The drain needs a live runner.
        self.scheduler.ensure_running(eigen_id).await?;
        self.registry.require(eigen_id).await
    }

    /// Liquidate, wait (bounded) for the drain, then settle to
    /// `terminated`. A drain that outlives the wait leaves the eigen
    /// `liquidating`; calling terminate again finishes the job.
    pub async fn terminate(&self, eigen_id: &str, caller: Address) -> KeeperResult<Eigen> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;

        match eigen.status {
            EigenStatus::Terminated | EigenStatus::Closed => {
                return Err(KeeperError::validation("already terminated"));
            }
            EigenStatus::Liquidated => {
                return self
                    .registry
                    .transition(eigen_id, EigenStatus::Liquidated, EigenStatus::Terminated)
                    .await;
            }
            EigenStatus::Liquidating => {}
            from => {
                self.registry
                    .transition(eigen_id, from, EigenStatus::Liquidating)
                    .await?;
            }
        }
        self.scheduler.ensure_running(eigen_id).await?;

        let deadline = tokio::time::Instant::now() + DRAIN_WAIT;
        loop {
            let current = self.registry.require(eigen_id).await?;
            match current.status {
                EigenStatus::Liquidated => {
                    return self
                        .registry
                        .transition(eigen_id, EigenStatus::Liquidated, EigenStatus::Terminated)
                        .await;
                }
                EigenStatus::Liquidating => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(eigen = %eigen_id, "drain still running, terminate deferred");
                        return Ok(current);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => return Ok(current),
            }
        }
    }

    /// Sweep free balance back to the owner. `terminated` eigens close on
    /// a full withdrawal.
    pub async fn withdraw_all(
        &self,
        eigen_id: &str,
        caller: Address,
    ) -> KeeperResult<PriorityOutcome> {
        let eigen = self.registry.require(eigen_id).await?;
        Self::assert_owner(&eigen, caller)?;
        if !eigen.reserved_wei.is_zero() {
            return Err(KeeperError::validation(
                "in-flight actions pending, retry shortly",
            ));
        }

        let outcome = self
            .scheduler
            .submit_priority(eigen_id, PriorityAction::Withdraw { to: eigen.owner })
            .await?;

        let after = self.registry.require(eigen_id).await?;
        if after.status == EigenStatus::Terminated {
            self.registry
                .transition(eigen_id, EigenStatus::Terminated, EigenStatus::Closed)
                .await?;
        }
        Ok(outcome)
    }

    // ── Launch mode ─────────────────────────────────────────────────

    /// Deploy a fresh token through the launchpad and wrap it in an eigen.
    /// The eigen starts in `pending_lp` and goes active once funded.
    pub async fn launch(
        &self,
        owner: Address,
        name: &str,
        symbol: &str,
        metadata_uri: &str,
        package: &Package,
    ) -> KeeperResult<(Eigen, LaunchResult)> {
        let launchpad = self.launchpad.ok_or_else(|| {
            KeeperError::validation("launch mode is not configured on this keeper")
        })?;
        if name.is_empty() || symbol.is_empty() || symbol.len() > 12 {
            return Err(KeeperError::validation("bad token name or symbol"));
        }

        let treasury = self.treasury_for(&[launchpad])?;
        let from = treasury.address(0)?;

        let calldata = ILaunchpad::launchCall {
            name: name.to_string(),
            symbol: symbol.to_string(),
            metadataUri: metadata_uri.to_string(),
        }
        .abi_encode();

        let call = CallRequest {
            from: Some(from),
            to: launchpad,
            value: None,
            data: Some(Bytes::from(calldata.clone())),
            gas: None,
        };
        let estimate = self.chain.estimate_gas(&call).await?;
        let (max_fee, priority) = self.executor.fees().await?;

        let mut slot = self.chain.nonces.lock(from).await;
        let nonce = match slot.current() {
            Some(n) => n,
            None => {
                let on_chain = self.chain.transaction_count(from).await?;
                slot.prime(on_chain)
            }
        };
        let signed = treasury.sign(&TxParams {
            wallet_index: 0,
            to: launchpad,
            value: U256::ZERO,
            data: Bytes::from(calldata),
            nonce,
            gas_limit: crate::chain::scaled_gas(estimate, true),
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        })?;
        let tx_hash = self.chain.send_raw(&signed.raw).await?;
        slot.advance(nonce);
        drop(slot);

        let receipt = self
            .chain
            .wait_receipt(tx_hash, Duration::from_secs(90))
            .await?;
        if !receipt.succeeded() {
            return Err(KeeperError::upstream("token launch reverted"));
        }

        let launched = receipt
            .logs
            .iter()
            .filter(|log| log.address == launchpad)
            .find_map(|log| {
                ILaunchpad::TokenLaunched::decode_raw_log(log.topics.iter().copied(), &log.data)
                    .ok()
            })
            .ok_or_else(|| KeeperError::upstream("launch receipt carries no TokenLaunched event"))?;

        let result = LaunchResult {
            token: launched.token,
            pool_id: launched.poolId,
            curve: launched.curve,
            tx_hash,
        };

        let pool = PoolDescriptor {
            version: PoolVersion::BondingCurve,
            pool: Some(result.curve),
            pool_id: Some(result.pool_id),
            token0: result.token,
            token1: Address::ZERO, // native quote side on the curve
            fee: 0,
            tick_spacing: None,
            router: result.curve,
        };

        let eigen = self
            .create(
                owner,
                None,
                result.token,
                pool,
                package,
                EigenStatus::PendingLp,
            )
            .await?;

        Ok((eigen, result))
    }
}
