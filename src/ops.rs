use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::model::eigen::EigenStatus;
use crate::registry::{self, EigenRegistry};
use crate::wallet;

/// `eigenswarm migrate` — open the database, apply the schema, exit.
pub fn migrate(database_path: &Path) -> Result<()> {
    registry::open(database_path)
        .with_context(|| format!("migrating {}", database_path.display()))?;
    println!("schema up to date at {}", database_path.display());
    Ok(())
}

/// `eigenswarm rotate-keeper-key` — print the old → new address migration
/// table for every recorded sub-wallet. Never writes anything: the actual
/// fund movement is an operator job, and the keeper refuses to plan one
/// while any eigen could still trade.
pub async fn rotate_keeper_key(
    database_path: &Path,
    old_secret: &str,
    new_secret: &str,
) -> Result<()> {
    if old_secret == new_secret {
        bail!("new secret is identical to the current one");
    }

    let db = registry::open(database_path)?;
    let registry = EigenRegistry::new(db);

    for status in [
        EigenStatus::PendingFunding,
        EigenStatus::PendingLp,
        EigenStatus::Active,
        EigenStatus::Suspended,
        EigenStatus::Liquidating,
    ] {
        let live = registry.ids_with_status(status).await?;
        if !live.is_empty() {
            bail!(
                "{} eigen(s) are {}; rotation requires every eigen terminal",
                live.len(),
                status
            );
        }
    }

    let mut rows = 0usize;
    for status in [
        EigenStatus::Liquidated,
        EigenStatus::Terminated,
        EigenStatus::Closed,
    ] {
        for id in registry.ids_with_status(status).await? {
            for (index, old_addr) in registry.wallets(&id).await? {
                let expected = wallet::derive_address(old_secret, &id, index)?;
                let fresh = wallet::derive_address(new_secret, &id, index)?;
                let note = if expected == old_addr { "" } else { "  (record mismatch!)" };
                println!("{id} #{index}: {old_addr:#x} -> {fresh:#x}{note}");
                rows += 1;
            }
        }
    }

    if rows == 0 {
        println!("no wallet records on file; nothing to migrate");
    } else {
        println!("{rows} wallet(s) planned. Sweep balances before switching the secret.");
    }
    Ok(())
}

/// `eigenswarm reconcile <id>` — ledger conservation check from the trade
/// log.
pub async fn reconcile(database_path: &Path, eigen_id: &str) -> Result<()> {
    let db = registry::open(database_path)?;
    let registry = EigenRegistry::new(db);

    let (expected, actual) = registry
        .reconcile(eigen_id)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!("eigen {eigen_id}");
    println!("  expected (deposits + inflows - outflows - fees): {expected}");
    println!("  actual   (balance + reserved):                   {actual}");
    if expected == actual {
        println!("  ledger conserved");
    } else {
        let (bigger, smaller, sign) = if expected > actual {
            (expected, actual, "-")
        } else {
            (actual, expected, "+")
        };
        println!("  DRIFT: {sign}{}", bigger - smaller);
    }
    Ok(())
}
