use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the keeper database: WAL mode, foreign keys, and the
/// full schema applied idempotently.
pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating db directory")?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests and `reconcile --dry-run` style tooling.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS eigens (
            id                  TEXT PRIMARY KEY,
            owner               TEXT NOT NULL,
            agent_identity      TEXT,
            chain_id            INTEGER NOT NULL,
            token               TEXT NOT NULL,
            class               TEXT NOT NULL,
            status              TEXT NOT NULL,
            config_json         TEXT NOT NULL,
            pool_json           TEXT NOT NULL,
            deposited_wei       TEXT NOT NULL DEFAULT '0',
            balance_wei         TEXT NOT NULL DEFAULT '0',
            reserved_wei        TEXT NOT NULL DEFAULT '0',
            token_balance       TEXT NOT NULL DEFAULT '0',
            average_entry_wei   TEXT NOT NULL DEFAULT '0',
            realized_pnl_wei    TEXT NOT NULL DEFAULT '0',
            gas_spent_wei       TEXT NOT NULL DEFAULT '0',
            fee_accrued_wei     TEXT NOT NULL DEFAULT '0',
            volume_produced_wei TEXT NOT NULL DEFAULT '0',
            volume_cap_wei      TEXT NOT NULL DEFAULT '0',
            trade_count         INTEGER NOT NULL DEFAULT 0,
            buy_count           INTEGER NOT NULL DEFAULT 0,
            sell_count          INTEGER NOT NULL DEFAULT 0,
            created_at          INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL,
            terminated_at       INTEGER,
            expires_at          INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_eigens_owner ON eigens(owner);
        CREATE INDEX IF NOT EXISTS idx_eigens_status ON eigens(status);

        CREATE TABLE IF NOT EXISTS eigen_wallets (
            eigen_id  TEXT NOT NULL REFERENCES eigens(id) ON DELETE CASCADE,
            idx       INTEGER NOT NULL,
            address   TEXT NOT NULL,
            PRIMARY KEY (eigen_id, idx)
        );

        CREATE TABLE IF NOT EXISTS trades (
            id                     TEXT PRIMARY KEY,
            eigen_id               TEXT NOT NULL REFERENCES eigens(id) ON DELETE CASCADE,
            kind                   TEXT NOT NULL,
            eth_amount_wei         TEXT NOT NULL,
            token_amount_raw       TEXT NOT NULL,
            price_eth              REAL NOT NULL,
            tx_hash                TEXT,
            status                 TEXT NOT NULL,
            gas_cost_wei           TEXT NOT NULL DEFAULT '0',
            realized_pnl_delta_wei TEXT NOT NULL DEFAULT '0',
            wallet_index           INTEGER NOT NULL DEFAULT 0,
            revert_reason          TEXT,
            created_at             INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_eigen ON trades(eigen_id);
        CREATE INDEX IF NOT EXISTS idx_trades_created ON trades(created_at);

        CREATE TABLE IF NOT EXISTS payments (
            id            TEXT PRIMARY KEY,
            payer         TEXT NOT NULL,
            recipient     TEXT NOT NULL,
            amount        TEXT NOT NULL,
            chain_id      INTEGER NOT NULL,
            scheme        TEXT NOT NULL,
            state         TEXT NOT NULL,
            eigen_id      TEXT,
            settlement_tx TEXT,
            created_at    INTEGER NOT NULL,
            verified_at   INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer);

        CREATE TABLE IF NOT EXISTS api_keys (
            prefix        TEXT PRIMARY KEY,
            hashed_secret TEXT NOT NULL,
            owner         TEXT NOT NULL,
            label         TEXT NOT NULL,
            created_at    INTEGER NOT NULL,
            last_used_at  INTEGER,
            rate_limit    INTEGER NOT NULL,
            revoked       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS enrol_nonces (
            owner     TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (owner, timestamp)
        );

        CREATE TABLE IF NOT EXISTS quote_prices (
            quote_token TEXT NOT NULL,
            hour        INTEGER NOT NULL,
            usd         REAL NOT NULL,
            PRIMARY KEY (quote_token, hour)
        );

        CREATE TABLE IF NOT EXISTS price_history (
            eigen_id  TEXT NOT NULL REFERENCES eigens(id) ON DELETE CASCADE,
            hour      INTEGER NOT NULL,
            price_eth REAL NOT NULL,
            price_usd REAL,
            PRIMARY KEY (eigen_id, hour)
        );

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
