use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures below the keeper taxonomy: the executor inspects `Rpc` payloads
/// to decode reverts before deciding between `Upstream` and `Revert`.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        /// Revert data when the provider surfaces it (eth_call).
        data: Option<Bytes>,
    },

    #[error("timed out after {0} s")]
    Timeout(u64),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ChainError {
    /// Whether the failure is worth a retry on the same endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_) | ChainError::Timeout(_))
    }
}

impl From<ChainError> for crate::error::KeeperError {
    fn from(e: ChainError) -> Self {
        crate::error::KeeperError::Upstream(e.to_string())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// eth_call / eth_estimateGas request object.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_quantity")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_quantity_u64")]
    pub gas: Option<u64>,
}

fn opt_quantity<S: serde::Serializer>(v: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("{v:#x}")),
        None => s.serialize_none(),
    }
}

fn opt_quantity_u64<S: serde::Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("{v:#x}")),
        None => s.serialize_none(),
    }
}

/// eth_getLogs filter. Block bounds are inclusive.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<Address>,
    pub topics: Vec<Option<B256>>,
}

impl LogFilter {
    pub fn to_params(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("fromBlock".into(), format!("{:#x}", self.from_block).into());
        obj.insert("toBlock".into(), format!("{:#x}", self.to_block).into());
        if let Some(address) = self.address {
            obj.insert("address".into(), format!("{address:#x}").into());
        }
        if !self.topics.is_empty() {
            let topics: Vec<serde_json::Value> = self
                .topics
                .iter()
                .map(|t| match t {
                    Some(t) => serde_json::Value::String(format!("{t:#x}")),
                    None => serde_json::Value::Null,
                })
                .collect();
            obj.insert("topics".into(), topics.into());
        }
        serde_json::Value::Array(vec![serde_json::Value::Object(obj)])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default, deserialize_with = "opt_hex_u64")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    #[serde(deserialize_with = "hex_u64")]
    pub status: u64,
    pub transaction_hash: B256,
    #[serde(default, deserialize_with = "opt_hex_u64")]
    pub block_number: Option<u64>,
    #[serde(deserialize_with = "hex_u64")]
    pub gas_used: u64,
    #[serde(default, deserialize_with = "opt_hex_u256")]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }

    /// Total gas cost in wei, zero when the provider omits the price.
    pub fn gas_cost_wei(&self) -> U256 {
        self.effective_gas_price.unwrap_or(U256::ZERO) * U256::from(self.gas_used)
    }
}

// ── Quantity decoding ───────────────────────────────────────────────

pub fn parse_hex_u64(raw: &str) -> Result<u64, ChainError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(stripped, 16)
        .map_err(|e| ChainError::Decode(format!("quantity '{raw}': {e}")))
}

pub fn parse_hex_u256(raw: &str) -> Result<U256, ChainError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    U256::from_str_radix(stripped, 16)
        .map_err(|e| ChainError::Decode(format!("quantity '{raw}': {e}")))
}

fn hex_u64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(d)?;
    parse_hex_u64(&raw).map_err(serde::de::Error::custom)
}

fn opt_hex_u64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    raw.map(|s| parse_hex_u64(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn opt_hex_u256<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    raw.map(|s| parse_hex_u256(&s).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_round_trip() {
        assert_eq!(parse_hex_u64("0x1a").unwrap(), 26);
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn receipt_decodes_provider_shape() {
        let raw = serde_json::json!({
            "status": "0x1",
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x10",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "logs": []
        });
        let receipt: RpcReceipt = serde_json::from_value(raw).unwrap();
        assert!(receipt.succeeded());
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(
            receipt.gas_cost_wei(),
            U256::from(21_000u64) * U256::from(1_000_000_000u64)
        );
    }
}
