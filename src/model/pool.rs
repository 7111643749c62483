use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};

/// Pool protocol family. Bonding-curve pools may graduate to a DEX; the
/// quote engine re-selects the router on every quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolVersion {
    V3,
    V4,
    BondingCurve,
}

impl PoolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolVersion::V3 => "v3",
            PoolVersion::V4 => "v4",
            PoolVersion::BondingCurve => "bonding-curve",
        }
    }
}

/// Everything the keeper needs to know about the target pool. Treated as
/// input: when a required field is absent the descriptor is rejected at
/// validation time rather than guessed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDescriptor {
    pub version: PoolVersion,
    /// Pool contract for v3 and bonding-curve pools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<Address>,
    /// Pool id for v4 pools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<B256>,
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_spacing: Option<i32>,
    /// Router (or v4 hook) the protocol routes through.
    pub router: Address,
}

impl PoolDescriptor {
    pub fn validate(&self) -> KeeperResult<()> {
        match self.version {
            PoolVersion::V3 | PoolVersion::BondingCurve => {
                if self.pool.is_none() {
                    return Err(KeeperError::validation(format!(
                        "{} pool descriptor requires a pool address",
                        self.version.as_str()
                    )));
                }
            }
            PoolVersion::V4 => {
                if self.pool_id.is_none() {
                    return Err(KeeperError::validation(
                        "v4 pool descriptor requires a poolId",
                    ));
                }
                if self.tick_spacing.is_none() {
                    return Err(KeeperError::validation(
                        "v4 pool descriptor requires tickSpacing",
                    ));
                }
            }
        }
        if self.token0 == self.token1 {
            return Err(KeeperError::validation("token0 and token1 are identical"));
        }
        Ok(())
    }

    /// Whether `token` sits on the token0 side of the pair.
    pub fn token_is_token0(&self, token: Address) -> bool {
        self.token0 == token
    }

    /// The quote-side asset of the pair, from the target token's view.
    pub fn quote_token(&self, token: Address) -> Address {
        if self.token_is_token0(token) {
            self.token1
        } else {
            self.token0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn v3_descriptor() -> PoolDescriptor {
        PoolDescriptor {
            version: PoolVersion::V3,
            pool: Some(addr(0x11)),
            pool_id: None,
            token0: addr(1),
            token1: addr(2),
            fee: 3000,
            tick_spacing: Some(60),
            router: addr(0x22),
        }
    }

    #[test]
    fn v3_requires_pool_address() {
        let mut d = v3_descriptor();
        assert!(d.validate().is_ok());
        d.pool = None;
        assert!(d.validate().is_err());
    }

    #[test]
    fn v4_requires_pool_id_and_spacing() {
        let mut d = v3_descriptor();
        d.version = PoolVersion::V4;
        assert!(d.validate().is_err());
        d.pool_id = Some(B256::repeat_byte(7));
        assert!(d.validate().is_err());
        d.tick_spacing = Some(10);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn quote_side_resolution() {
        let d = v3_descriptor();
        assert_eq!(d.quote_token(addr(1)), addr(2));
        assert_eq!(d.quote_token(addr(2)), addr(1));
    }
}
