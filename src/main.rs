use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;

use eigenswarm::{config::KeeperConfig, ops, telemetry};

mod cli;

const EXIT_USAGE: u8 = 64;
const EXIT_CONFIG: u8 = 65;
const EXIT_RUNTIME: u8 = 70;

fn main() -> ExitCode {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match cli.command {
        cli::Command::Serve => {
            let config = match KeeperConfig::from_env() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            telemetry::init(&config.log_level);

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("runtime: {e}");
                    return ExitCode::from(EXIT_RUNTIME);
                }
            };
            match rt.block_on(eigenswarm::api::serve(config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("keeper failed: {e:#}");
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }

        cli::Command::Migrate => with_database(|path| ops::migrate(&path)),

        cli::Command::RotateKeeperKey => {
            let old_secret = match require_env("KEEPER_MASTER_SECRET") {
                Ok(v) => v,
                Err(code) => return code,
            };
            let new_secret = match require_env("NEW_KEEPER_MASTER_SECRET") {
                Ok(v) => v,
                Err(code) => return code,
            };
            with_database(|path| {
                block_on(ops::rotate_keeper_key(&path, &old_secret, &new_secret))
            })
        }

        cli::Command::Reconcile { eigen_id } => {
            with_database(|path| block_on(ops::reconcile(&path, &eigen_id)))
        }
    }
}

fn with_database(f: impl FnOnce(PathBuf) -> anyhow::Result<()>) -> ExitCode {
    let path = match require_env("DATABASE_PATH") {
        Ok(v) => PathBuf::from(v),
        Err(code) => return code,
    };
    match f(path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn require_env(name: &str) -> Result<String, ExitCode> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => {
            eprintln!("configuration error: missing env: {name}");
            Err(ExitCode::from(EXIT_CONFIG))
        }
    }
}

fn block_on(fut: impl std::future::Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    tokio::runtime::Runtime::new()?.block_on(fut)
}
