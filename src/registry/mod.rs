pub mod db;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256, I256, U256};
use rusqlite::{OptionalExtension, Row, params};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::{ConfigPatch, Eigen, EigenClass, EigenStatus, PRICE_SCALE};
use crate::model::trade::{TradeKind, TradeRecord, TradeStatus};

pub use db::{Db, open, open_in_memory};

// ── Settlement input ────────────────────────────────────────────────

/// Everything a finished (or reverted) execution feeds back into the ledger.
/// Applied atomically together with the trade-log insert.
#[derive(Debug, Clone)]
pub struct TradeSettlement {
    pub kind: TradeKind,
    pub wallet_index: u32,
    /// ETH notional that moved (out for buys, in for sells).
    pub eth_amount_wei: U256,
    pub token_amount_raw: U256,
    /// Execution price, ETH per whole token, for the trade log.
    pub price_eth: f64,
    /// Execution price, wei per 10^18 raw units, for average-entry math.
    pub price_wei: U256,
    pub tx_hash: Option<B256>,
    pub status: TradeStatus,
    pub gas_cost_wei: U256,
    pub fee_wei: U256,
    pub revert_reason: Option<String>,
}

/// Aggregate counters for `/api/stats`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub eigens_total: u64,
    pub eigens_by_status: HashMap<String, u64>,
    pub trades_total: u64,
    #[serde(with = "crate::model::wei_string")]
    pub volume_total_wei: U256,
    #[serde(with = "crate::model::wei_string")]
    pub gas_total_wei: U256,
    #[serde(with = "crate::model::wei_string")]
    pub deposited_total_wei: U256,
}

// ── Registry ────────────────────────────────────────────────────────

/// Durable store of eigens, trades and wallet derivation records. All
/// mutations of a single eigen serialize through a per-id writer lock so the
/// budget ledger invariant holds at every commit:
///
///   balance + reserved + settled outflows == deposited + settled inflows
pub struct EigenRegistry {
    db: Db,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EigenRegistry {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }

    /// Acquire the single-writer lock for one eigen id.
    async fn writer(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.writers.lock().await;
            map.entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // ── Creation and reads ──────────────────────────────────────────

    pub async fn create(&self, eigen: &Eigen) -> KeeperResult<()> {
        eigen.config.validate()?;
        eigen.pool.validate()?;

        let config_json = serde_json::to_string(&eigen.config)
            .map_err(|e| KeeperError::invariant(format!("config encode: {e}")))?;
        let pool_json = serde_json::to_string(&eigen.pool)
            .map_err(|e| KeeperError::invariant(format!("pool encode: {e}")))?;

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO eigens (id, owner, agent_identity, chain_id, token, class, status,
                                 config_json, pool_json, deposited_wei, balance_wei, reserved_wei,
                                 token_balance, average_entry_wei, realized_pnl_wei, gas_spent_wei,
                                 fee_accrued_wei, volume_produced_wei, volume_cap_wei,
                                 trade_count, buy_count, sell_count,
                                 created_at, updated_at, terminated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                eigen.id,
                addr_str(eigen.owner),
                eigen.agent_identity,
                eigen.chain_id,
                addr_str(eigen.token),
                eigen.class.as_str(),
                eigen.status.as_str(),
                config_json,
                pool_json,
                eigen.deposited_wei.to_string(),
                eigen.balance_wei.to_string(),
                eigen.reserved_wei.to_string(),
                eigen.token_balance.to_string(),
                eigen.average_entry_wei.to_string(),
                eigen.realized_pnl_wei.to_string(),
                eigen.gas_spent_wei.to_string(),
                eigen.fee_accrued_wei.to_string(),
                eigen.volume_produced_wei.to_string(),
                eigen.volume_cap_wei.to_string(),
                eigen.trade_count,
                eigen.buy_count,
                eigen.sell_count,
                eigen.created_at,
                eigen.updated_at,
                eigen.terminated_at,
                eigen.expires_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> KeeperResult<Option<Eigen>> {
        let conn = self.db.lock().await;
        conn.query_row(
            &format!("SELECT {EIGEN_COLUMNS} FROM eigens WHERE id = ?1"),
            [id],
            row_to_eigen,
        )
        .optional()
        .map_err(db_err)
    }

    /// `get` for callers that know the id must exist.
    pub async fn require(&self, id: &str) -> KeeperResult<Eigen> {
        self.get(id)
            .await?
            .ok_or_else(|| KeeperError::validation(format!("unknown eigen '{id}'")))
    }

    pub async fn list(
        &self,
        owner: Option<Address>,
        status: Option<EigenStatus>,
        limit: u32,
        offset: u32,
    ) -> KeeperResult<Vec<Eigen>> {
        let conn = self.db.lock().await;
        let mut sql = format!("SELECT {EIGEN_COLUMNS} FROM eigens WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(owner) = owner {
            args.push(addr_str(owner));
            sql.push_str(&format!(" AND owner = ?{}", args.len()));
        }
        if let Some(status) = status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}"
        ));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_eigen)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub async fn ids_with_status(&self, status: EigenStatus) -> KeeperResult<Vec<String>> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM eigens WHERE status = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([status.as_str()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ── Status machine ──────────────────────────────────────────────

    /// CAS transition: fails when the eigen is not currently in `from` or
    /// the edge is not in the status graph.
    pub async fn transition(
        &self,
        id: &str,
        from: EigenStatus,
        to: EigenStatus,
    ) -> KeeperResult<Eigen> {
        if !from.can_transition(to) {
            return Err(KeeperError::validation(format!(
                "illegal transition {from} -> {to}"
            )));
        }

        let _writer = self.writer(id).await;
        let now = chrono::Utc::now().timestamp();
        let terminated_at = matches!(to, EigenStatus::Terminated).then_some(now);

        let conn = self.db.lock().await;
        let affected = conn
            .execute(
                "UPDATE eigens SET status = ?1, updated_at = ?2,
                        terminated_at = COALESCE(?3, terminated_at)
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), now, terminated_at, id, from.as_str()],
            )
            .map_err(db_err)?;

        if affected == 0 {
            let current: Option<String> = conn
                .query_row("SELECT status FROM eigens WHERE id = ?1", [id], |r| r.get(0))
                .optional()
                .map_err(db_err)?;
            return Err(match current {
                None => KeeperError::validation(format!("unknown eigen '{id}'")),
                Some(s) => KeeperError::validation(format!(
                    "transition {from} -> {to} rejected: eigen is {s}"
                )),
            });
        }

        conn.query_row(
            &format!("SELECT {EIGEN_COLUMNS} FROM eigens WHERE id = ?1"),
            [id],
            row_to_eigen,
        )
        .map_err(db_err)
    }

    // ── Config writes ───────────────────────────────────────────────

    /// Apply a bounded patch. A no-op patch writes nothing, including
    /// `updated_at`.
    pub async fn update_config(&self, id: &str, patch: &ConfigPatch) -> KeeperResult<(Eigen, bool)> {
        let _writer = self.writer(id).await;
        let current = self.require(id).await?;
        let (next, changed) = patch.apply(&current.config)?;
        if !changed {
            return Ok((current, false));
        }

        let config_json = serde_json::to_string(&next)
            .map_err(|e| KeeperError::invariant(format!("config encode: {e}")))?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE eigens SET config_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![config_json, now, id],
        )
        .map_err(db_err)?;
        drop(conn);

        let updated = self.require(id).await?;
        Ok((updated, true))
    }

    /// Class upgrades are one-way and only while trading.
    pub async fn upgrade_class(&self, id: &str, class: EigenClass) -> KeeperResult<Eigen> {
        let _writer = self.writer(id).await;
        let current = self.require(id).await?;
        if current.status != EigenStatus::Active {
            return Err(KeeperError::validation(
                "class change requires an active eigen",
            ));
        }
        if class.rank() <= current.class.rank() {
            return Err(KeeperError::validation(format!(
                "class change {} -> {} is not an upgrade",
                current.class, class
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE eigens SET class = ?1, updated_at = ?2 WHERE id = ?3",
            params![class.as_str(), now, id],
        )
        .map_err(db_err)?;
        drop(conn);
        self.require(id).await
    }

    // ── Budget ledger ───────────────────────────────────────────────

    /// Record a settled deposit: deposited and free balance both grow.
    pub async fn fund(&self, id: &str, amount: U256) -> KeeperResult<Eigen> {
        let _writer = self.writer(id).await;
        let eigen = self.require(id).await?;
        self.write_ledger(
            &eigen.id,
            eigen.deposited_wei + amount,
            eigen.balance_wei + amount,
            eigen.reserved_wei,
        )
        .await?;
        self.require(id).await
    }

    /// Move free balance into the in-flight reservation.
    pub async fn reserve(&self, id: &str, amount: U256) -> KeeperResult<()> {
        let _writer = self.writer(id).await;
        let eigen = self.require(id).await?;
        if eigen.balance_wei < amount {
            return Err(KeeperError::validation(format!(
                "insufficient balance: have {}, need {amount}",
                eigen.balance_wei
            )));
        }
        self.write_ledger(
            id,
            eigen.deposited_wei,
            eigen.balance_wei - amount,
            eigen.reserved_wei + amount,
        )
        .await
    }

    /// Return an unused reservation to the free balance.
    pub async fn release(&self, id: &str, amount: U256) -> KeeperResult<()> {
        let _writer = self.writer(id).await;
        let eigen = self.require(id).await?;
        if eigen.reserved_wei < amount {
            return Err(KeeperError::invariant(format!(
                "release {amount} exceeds reserved {}",
                eigen.reserved_wei
            )));
        }
        self.write_ledger(
            id,
            eigen.deposited_wei,
            eigen.balance_wei + amount,
            eigen.reserved_wei - amount,
        )
        .await
    }

    /// Deduct a settled outflow (withdrawal) from the free balance.
    pub async fn debit(&self, id: &str, amount: U256) -> KeeperResult<()> {
        let _writer = self.writer(id).await;
        let eigen = self.require(id).await?;
        if eigen.balance_wei < amount {
            return Err(KeeperError::validation(format!(
                "insufficient balance: have {}, need {amount}",
                eigen.balance_wei
            )));
        }
        self.write_ledger(
            id,
            eigen.deposited_wei,
            eigen.balance_wei - amount,
            eigen.reserved_wei,
        )
        .await
    }

    async fn write_ledger(
        &self,
        id: &str,
        deposited: U256,
        balance: U256,
        reserved: U256,
    ) -> KeeperResult<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE eigens SET deposited_wei = ?1, balance_wei = ?2, reserved_wei = ?3,
                    updated_at = ?4 WHERE id = ?5",
            params![
                deposited.to_string(),
                balance.to_string(),
                reserved.to_string(),
                now,
                id
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ── Trade settlement ────────────────────────────────────────────

    /// Atomically release the reservation, apply the settlement to the
    /// budget and position, and append the trade row.
    ///
    /// Returns the realized P&L delta of this settlement.
    pub async fn commit_settlement(
        &self,
        id: &str,
        reserved: U256,
        s: &TradeSettlement,
    ) -> KeeperResult<I256> {
        let _writer = self.writer(id).await;
        let eigen = self.require(id).await?;
        if eigen.reserved_wei < reserved {
            return Err(KeeperError::invariant(format!(
                "settlement releases {reserved} but only {} is reserved",
                eigen.reserved_wei
            )));
        }

        let mut balance = eigen.balance_wei + reserved;
        let reserved_left = eigen.reserved_wei - reserved;
        let mut token_balance = eigen.token_balance;
        let mut average_entry = eigen.average_entry_wei;
        let mut realized_delta = I256::ZERO;
        let mut volume = eigen.volume_produced_wei;
        let scale = U256::from(PRICE_SCALE);

        let confirmed = s.status == TradeStatus::Confirmed;
        if confirmed {
            if s.kind.is_sell_side() {
                if token_balance < s.token_amount_raw {
                    return Err(KeeperError::invariant(format!(
                        "sell of {} exceeds position {token_balance}",
                        s.token_amount_raw
                    )));
                }
                token_balance -= s.token_amount_raw;
                balance += s.eth_amount_wei;

                // Weighted-average accounting: selling realizes the spread
                // to the average entry and leaves the entry price alone.
                let proceeds = I256::try_from(s.token_amount_raw * s.price_wei / scale)
                    .unwrap_or(I256::MAX);
                let cost = I256::try_from(s.token_amount_raw * average_entry / scale)
                    .unwrap_or(I256::MAX);
                realized_delta = proceeds - cost;
                if token_balance.is_zero() {
                    average_entry = U256::ZERO;
                }
            } else {
                let spend = s.eth_amount_wei + s.gas_cost_wei + s.fee_wei;
                if balance < spend {
                    return Err(KeeperError::invariant(format!(
                        "buy settlement spends {spend} with only {balance} available"
                    )));
                }
                let old_cost = token_balance * average_entry / scale;
                let add_cost = s.token_amount_raw * s.price_wei / scale;
                token_balance += s.token_amount_raw;
                if !token_balance.is_zero() {
                    average_entry = (old_cost + add_cost) * scale / token_balance;
                }
            }

            // Gas and fees come out of the free balance for both sides.
            let overhead = s.gas_cost_wei + s.fee_wei;
            if s.kind.is_sell_side() {
                if balance < overhead {
                    return Err(KeeperError::invariant(
                        "sell overhead exceeds available balance",
                    ));
                }
                balance -= overhead;
            } else {
                balance -= s.eth_amount_wei + s.gas_cost_wei + s.fee_wei;
            }
            volume += s.eth_amount_wei;
        } else if !s.gas_cost_wei.is_zero() {
            // A revert that still consumed gas is charged to the budget.
            if balance < s.gas_cost_wei {
                return Err(KeeperError::invariant(
                    "revert gas exceeds available balance",
                ));
            }
            balance -= s.gas_cost_wei;
        }

        let now = chrono::Utc::now().timestamp();
        let trade = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            eigen_id: id.to_string(),
            kind: s.kind,
            eth_amount_wei: s.eth_amount_wei,
            token_amount_raw: s.token_amount_raw,
            price_eth: s.price_eth,
            tx_hash: s.tx_hash,
            status: s.status,
            gas_cost_wei: s.gas_cost_wei,
            realized_pnl_delta_wei: realized_delta,
            wallet_index: s.wallet_index,
            revert_reason: s.revert_reason.clone(),
            created_at: now,
        };

        let realized_total = eigen.realized_pnl_wei + realized_delta;
        let (buy_inc, sell_inc) = if confirmed {
            if s.kind.is_sell_side() { (0u64, 1u64) } else { (1, 0) }
        } else {
            (0, 0)
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "UPDATE eigens SET balance_wei = ?1, reserved_wei = ?2, token_balance = ?3,
                    average_entry_wei = ?4, realized_pnl_wei = ?5,
                    gas_spent_wei = ?6, fee_accrued_wei = ?7, volume_produced_wei = ?8,
                    trade_count = trade_count + 1,
                    buy_count = buy_count + ?9, sell_count = sell_count + ?10,
                    updated_at = ?11
             WHERE id = ?12",
            params![
                balance.to_string(),
                reserved_left.to_string(),
                token_balance.to_string(),
                average_entry.to_string(),
                realized_total.to_string(),
                (eigen.gas_spent_wei + s.gas_cost_wei).to_string(),
                (eigen.fee_accrued_wei + s.fee_wei).to_string(),
                volume.to_string(),
                buy_inc,
                sell_inc,
                now,
                id
            ],
        )
        .map_err(db_err)?;
        insert_trade(&tx, &trade)?;
        tx.commit().map_err(db_err)?;

        Ok(realized_delta)
    }

    // ── Trade log reads ─────────────────────────────────────────────

    pub async fn trades(&self, eigen_id: &str, limit: u32, offset: u32) -> KeeperResult<Vec<TradeRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, eigen_id, kind, eth_amount_wei, token_amount_raw, price_eth,
                        tx_hash, status, gas_cost_wei, realized_pnl_delta_wei, wallet_index,
                        revert_reason, created_at
                 FROM trades WHERE eigen_id = ?1
                 ORDER BY rowid DESC LIMIT ?2 OFFSET ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![eigen_id, limit, offset], row_to_trade)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ── Wallet derivation records ───────────────────────────────────

    pub async fn put_wallets(&self, eigen_id: &str, wallets: &[(u32, Address)]) -> KeeperResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        for (idx, address) in wallets {
            tx.execute(
                "INSERT OR REPLACE INTO eigen_wallets (eigen_id, idx, address) VALUES (?1, ?2, ?3)",
                params![eigen_id, idx, addr_str(*address)],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub async fn wallets(&self, eigen_id: &str) -> KeeperResult<Vec<(u32, Address)>> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare("SELECT idx, address FROM eigen_wallets WHERE eigen_id = ?1 ORDER BY idx")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([eigen_id], |row| {
                let idx: u32 = row.get(0)?;
                let addr: String = row.get(1)?;
                Ok((idx, addr))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(idx, addr)| {
                Address::from_str(&addr)
                    .map(|a| (idx, a))
                    .map_err(|e| KeeperError::invariant(format!("stored wallet address: {e}")))
            })
            .collect()
    }

    // ── Price history ───────────────────────────────────────────────

    pub async fn record_price(
        &self,
        eigen_id: &str,
        hour: i64,
        price_eth: f64,
        price_usd: Option<f64>,
    ) -> KeeperResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO price_history (eigen_id, hour, price_eth, price_usd)
             VALUES (?1, ?2, ?3, ?4)",
            params![eigen_id, hour, price_eth, price_usd],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn price_history(
        &self,
        eigen_id: &str,
        limit: u32,
    ) -> KeeperResult<Vec<(i64, f64, Option<f64>)>> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT hour, price_eth, price_usd FROM price_history
                 WHERE eigen_id = ?1 ORDER BY hour DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![eigen_id, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ── Aggregate stats ─────────────────────────────────────────────

    pub async fn stats(&self) -> KeeperResult<RegistryStats> {
        let conn = self.db.lock().await;

        let mut by_status = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM eigens GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            by_status.insert(status, count);
        }

        let trades_total: u64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .map_err(db_err)?;

        let mut volume = U256::ZERO;
        let mut gas = U256::ZERO;
        let mut deposited = U256::ZERO;
        let mut stmt = conn
            .prepare("SELECT volume_produced_wei, gas_spent_wei, deposited_wei FROM eigens")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;
        for row in rows {
            let (v, g, d) = row.map_err(db_err)?;
            volume += parse_u256(&v)?;
            gas += parse_u256(&g)?;
            deposited += parse_u256(&d)?;
        }

        Ok(RegistryStats {
            eigens_total: by_status.values().sum(),
            eigens_by_status: by_status,
            trades_total,
            volume_total_wei: volume,
            gas_total_wei: gas,
            deposited_total_wei: deposited,
        })
    }

    /// Ledger conservation check for one eigen, recomputed from the trade
    /// log. Returns (expected_balance, actual_balance).
    pub async fn reconcile(&self, id: &str) -> KeeperResult<(U256, U256)> {
        let eigen = self.require(id).await?;
        let trades = self.trades(id, u32::MAX, 0).await?;

        let mut expected = eigen.deposited_wei;
        for t in &trades {
            match t.status {
                TradeStatus::Confirmed => {
                    if t.kind.is_sell_side() {
                        expected += t.eth_amount_wei;
                        expected = expected
                            .checked_sub(t.gas_cost_wei)
                            .ok_or_else(|| KeeperError::invariant("ledger underflow"))?;
                    } else {
                        expected = expected
                            .checked_sub(t.eth_amount_wei + t.gas_cost_wei)
                            .ok_or_else(|| KeeperError::invariant("ledger underflow"))?;
                    }
                }
                TradeStatus::Reverted => {
                    expected = expected
                        .checked_sub(t.gas_cost_wei)
                        .ok_or_else(|| KeeperError::invariant("ledger underflow"))?;
                }
                TradeStatus::Submitted => {}
            }
        }
        // Fees accrued but not yet claimed stay inside the budget.
        expected = expected
            .checked_sub(eigen.fee_accrued_wei)
            .ok_or_else(|| KeeperError::invariant("ledger underflow"))?;

        Ok((expected, eigen.balance_wei + eigen.reserved_wei))
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const EIGEN_COLUMNS: &str = "id, owner, agent_identity, chain_id, token, class, status, \
     config_json, pool_json, deposited_wei, balance_wei, reserved_wei, token_balance, \
     average_entry_wei, realized_pnl_wei, gas_spent_wei, fee_accrued_wei, \
     volume_produced_wei, volume_cap_wei, trade_count, buy_count, sell_count, \
     created_at, updated_at, terminated_at, expires_at";

fn row_to_eigen(row: &Row<'_>) -> rusqlite::Result<Eigen> {
    let owner: String = row.get(1)?;
    let token: String = row.get(4)?;
    let class: String = row.get(5)?;
    let status: String = row.get(6)?;
    let config_json: String = row.get(7)?;
    let pool_json: String = row.get(8)?;

    Ok(Eigen {
        id: row.get(0)?,
        owner: Address::from_str(&owner).map_err(bad_column)?,
        agent_identity: row.get(2)?,
        chain_id: row.get(3)?,
        token: Address::from_str(&token).map_err(bad_column)?,
        class: EigenClass::parse(&class).map_err(bad_column)?,
        status: EigenStatus::parse(&status).map_err(bad_column)?,
        config: serde_json::from_str(&config_json).map_err(bad_column)?,
        pool: serde_json::from_str(&pool_json).map_err(bad_column)?,
        deposited_wei: col_u256(row, 9)?,
        balance_wei: col_u256(row, 10)?,
        reserved_wei: col_u256(row, 11)?,
        token_balance: col_u256(row, 12)?,
        average_entry_wei: col_u256(row, 13)?,
        realized_pnl_wei: col_i256(row, 14)?,
        gas_spent_wei: col_u256(row, 15)?,
        fee_accrued_wei: col_u256(row, 16)?,
        volume_produced_wei: col_u256(row, 17)?,
        volume_cap_wei: col_u256(row, 18)?,
        trade_count: row.get(19)?,
        buy_count: row.get(20)?,
        sell_count: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
        terminated_at: row.get(24)?,
        expires_at: row.get(25)?,
    })
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let kind: String = row.get(2)?;
    let tx_hash: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(TradeRecord {
        id: row.get(0)?,
        eigen_id: row.get(1)?,
        kind: TradeKind::parse(&kind).map_err(bad_column)?,
        eth_amount_wei: col_u256(row, 3)?,
        token_amount_raw: col_u256(row, 4)?,
        price_eth: row.get(5)?,
        tx_hash: tx_hash
            .map(|h| B256::from_str(&h).map_err(bad_column))
            .transpose()?,
        status: TradeStatus::parse(&status).map_err(bad_column)?,
        gas_cost_wei: col_u256(row, 8)?,
        realized_pnl_delta_wei: col_i256(row, 9)?,
        wallet_index: row.get(10)?,
        revert_reason: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn insert_trade(tx: &rusqlite::Transaction<'_>, t: &TradeRecord) -> KeeperResult<()> {
    tx.execute(
        "INSERT INTO trades (id, eigen_id, kind, eth_amount_wei, token_amount_raw, price_eth,
                             tx_hash, status, gas_cost_wei, realized_pnl_delta_wei,
                             wallet_index, revert_reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            t.id,
            t.eigen_id,
            t.kind.as_str(),
            t.eth_amount_wei.to_string(),
            t.token_amount_raw.to_string(),
            t.price_eth,
            t.tx_hash.map(|h| format!("{h:#x}")),
            t.status.as_str(),
            t.gas_cost_wei.to_string(),
            t.realized_pnl_delta_wei.to_string(),
            t.wallet_index,
            t.revert_reason,
            t.created_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn col_u256(row: &Row<'_>, idx: usize) -> rusqlite::Result<U256> {
    let raw: String = row.get(idx)?;
    U256::from_str(&raw).map_err(bad_column)
}

fn col_i256(row: &Row<'_>, idx: usize) -> rusqlite::Result<I256> {
    let raw: String = row.get(idx)?;
    I256::from_str(&raw).map_err(bad_column)
}

fn parse_u256(raw: &str) -> KeeperResult<U256> {
    U256::from_str(raw).map_err(|e| KeeperError::invariant(format!("stored wei value: {e}")))
}

pub fn addr_str(a: Address) -> String {
    format!("{a:#x}")
}

fn db_err(e: rusqlite::Error) -> KeeperError {
    KeeperError::Upstream(format!("database: {e}"))
}

fn bad_column<E: std::fmt::Display>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{e}").into(),
    )
}
