use alloy::primitives::U256;
use serde::Serialize;

use crate::error::{KeeperError, KeeperResult};
use crate::model::eigen::EigenClass;

/// A priced volume package: pay `usd_minor` of stablecoin, receive
/// `volume_cap_wei` of generated volume over `duration_hours`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: &'static str,
    pub name: &'static str,
    /// Stablecoin minor units (6 decimals).
    pub usd_minor: u64,
    #[serde(with = "super::wei_string")]
    pub volume_cap_wei: U256,
    /// ETH budget the treasury seeds the eigen's sub-wallets with.
    #[serde(with = "super::wei_string")]
    pub budget_wei: U256,
    pub duration_hours: u64,
    pub class: EigenClass,
}

const fn eth(milli: u64) -> u64 {
    milli * 1_000_000_000_000_000
}

/// The published pricing table.
pub fn catalog() -> Vec<Package> {
    vec![
        Package {
            id: "micro",
            name: "Micro",
            usd_minor: 1_000_000, // 1 USDC
            volume_cap_wei: U256::from(eth(50)), // 0.05 ETH
            budget_wei: U256::from(eth(20)),
            duration_hours: 24,
            class: EigenClass::Lite,
        },
        Package {
            id: "starter",
            name: "Starter",
            usd_minor: 10_000_000,
            volume_cap_wei: U256::from(eth(500)),
            budget_wei: U256::from(eth(100)),
            duration_hours: 48,
            class: EigenClass::Core,
        },
        Package {
            id: "growth",
            name: "Growth",
            usd_minor: 50_000_000,
            volume_cap_wei: U256::from(eth(3_000)),
            budget_wei: U256::from(eth(500)),
            duration_hours: 72,
            class: EigenClass::Pro,
        },
        Package {
            id: "whale",
            name: "Whale",
            usd_minor: 200_000_000,
            volume_cap_wei: U256::from(eth(15_000)),
            budget_wei: U256::from(eth(2_000)),
            duration_hours: 168,
            class: EigenClass::Ultra,
        },
    ]
}

pub fn find(id: &str) -> KeeperResult<Package> {
    catalog()
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| KeeperError::validation(format!("unknown package '{id}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micro_package_matches_published_pricing() {
        let p = find("micro").unwrap();
        assert_eq!(p.usd_minor, 1_000_000);
        assert_eq!(p.volume_cap_wei, U256::from(50_000_000_000_000_000u64));
        assert_eq!(p.duration_hours, 24);
    }

    #[test]
    fn unknown_package_is_a_validation_error() {
        assert!(find("mega").is_err());
    }
}
