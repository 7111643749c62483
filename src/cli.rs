use clap::{Parser, Subcommand};

/// EigenSwarm keeper — the always-on backend that admits volume-package
/// purchases and operates the market-making eigens they fund.
#[derive(Parser)]
#[command(name = "eigenswarm", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the keeper: HTTP surface, schedulers, background refreshers
    Serve,

    /// Apply database migrations and exit
    Migrate,

    /// Plan a master-secret rotation: prints the old → new address map for
    /// every recorded sub-wallet. Refuses while any eigen is still live.
    /// The replacement secret is read from NEW_KEEPER_MASTER_SECRET.
    RotateKeeperKey,

    /// Recompute one eigen's ledger from its trade log and report drift
    Reconcile {
        /// Eigen id (ES-xxxxxx)
        eigen_id: String,
    },
}
