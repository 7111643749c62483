pub mod apikey;
pub mod eigen;
pub mod package;
pub mod payment;
pub mod pool;
pub mod trade;

pub use eigen::{Eigen, EigenClass, EigenConfig, EigenStatus};

/// Wei-scale integers cross the HTTP boundary and the database as decimal
/// strings, never as JSON numbers or hex quantities.
pub mod wei_string {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(d)?;
        U256::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Signed wei values (realized P&L) as decimal strings.
pub mod signed_wei_string {
    use std::str::FromStr;

    use alloy::primitives::I256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &I256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<I256, D::Error> {
        let raw = String::deserialize(d)?;
        I256::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
