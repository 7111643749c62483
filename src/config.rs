use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use alloy::primitives::Address;

/// Everything the keeper reads from the environment at startup. Secrets
/// (master secret, facilitator URL) never touch the database.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub rpc_endpoints: Vec<String>,
    pub chain_id: u64,
    pub master_secret: String,
    pub facilitator_url: String,
    pub database_path: PathBuf,
    pub payment_recipient: Address,
    pub stablecoin: Address,
    pub log_level: String,
    pub bind_addr: String,
    pub confirmation_depth: u64,
    pub launchpad: Option<Address>,
    pub hints: PoolHints,
}

/// Optional protocol addresses used to resolve a pool for a bare token
/// address. A keeper without them requires explicit pool descriptors.
#[derive(Debug, Clone, Default)]
pub struct PoolHints {
    pub wnative: Option<Address>,
    pub v3_factory: Option<Address>,
    pub curve_router: Option<Address>,
    pub dex_router: Option<Address>,
}

/// Startup configuration failure; the binary exits 65 on it.
#[derive(Debug)]
pub struct ConfigError {
    pub missing: Vec<&'static str>,
    pub invalid: Vec<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.missing.is_empty() {
            write!(f, "missing env: {}", self.missing.join(", "))?;
        }
        if !self.invalid.is_empty() {
            if !self.missing.is_empty() {
                write!(f, "; ")?;
            }
            write!(f, "invalid env: {}", self.invalid.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

impl KeeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let mut required = |name: &'static str| -> String {
            match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => v,
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let rpc_raw = required("RPC_ENDPOINTS");
        let chain_raw = required("CHAIN_ID");
        let master_secret = required("KEEPER_MASTER_SECRET");
        let facilitator_url = required("FACILITATOR_URL");
        let database_raw = required("DATABASE_PATH");
        let recipient_raw = required("PAYMENT_RECIPIENT");
        let stablecoin_raw = required("STABLECOIN_ADDRESS");

        let rpc_endpoints: Vec<String> = rpc_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if rpc_endpoints.is_empty() && !rpc_raw.is_empty() {
            invalid.push("RPC_ENDPOINTS: no usable endpoint".into());
        }

        let chain_id = chain_raw.parse::<u64>().unwrap_or_else(|_| {
            if !chain_raw.is_empty() {
                invalid.push(format!("CHAIN_ID: '{chain_raw}' is not a number"));
            }
            0
        });

        let payment_recipient = parse_addr(&recipient_raw, "PAYMENT_RECIPIENT", &mut invalid);
        let stablecoin = parse_addr(&stablecoin_raw, "STABLECOIN_ADDRESS", &mut invalid);

        let mut optional_addr = |name: &'static str| -> Option<Address> {
            match std::env::var(name) {
                Ok(raw) if !raw.trim().is_empty() => {
                    Some(parse_addr(&raw, name, &mut invalid))
                }
                _ => None,
            }
        };

        let launchpad = optional_addr("LAUNCHPAD_ADDRESS");
        let hints = PoolHints {
            wnative: optional_addr("WNATIVE_ADDRESS"),
            v3_factory: optional_addr("V3_FACTORY_ADDRESS"),
            curve_router: optional_addr("CURVE_ROUTER_ADDRESS"),
            dex_router: optional_addr("DEX_ROUTER_ADDRESS"),
        };

        let confirmation_depth = std::env::var("CONFIRMATION_DEPTH")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());

        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ConfigError { missing, invalid });
        }

        Ok(Self {
            rpc_endpoints,
            chain_id,
            master_secret,
            facilitator_url,
            database_path: PathBuf::from(database_raw),
            payment_recipient,
            stablecoin,
            log_level,
            bind_addr,
            confirmation_depth,
            launchpad,
            hints,
        })
    }
}

fn parse_addr(raw: &str, name: &str, invalid: &mut Vec<String>) -> Address {
    if raw.is_empty() {
        return Address::ZERO;
    }
    Address::from_str(raw).unwrap_or_else(|_| {
        invalid.push(format!("{name}: '{raw}' is not an address"));
        Address::ZERO
    })
}
