pub mod nonce;
pub mod types;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256, hex};
use tracing::{debug, warn};

use nonce::NonceTracker;
use types::{
    CallRequest, ChainError, JsonRpcRequest, JsonRpcResponse, LogFilter, RpcLog, RpcReceipt,
    parse_hex_u256, parse_hex_u64,
};

/// Providers cap eth_getLogs ranges; the widest window observed in the wild
/// that still succeeds everywhere we run.
const LOG_WINDOW: u64 = 49_000;

/// Attempts per logical RPC call before the error surfaces.
const MAX_ATTEMPTS: u32 = 3;

/// Consecutive failures on one endpoint before rotating away from it.
const ROTATE_AFTER: u32 = 3;

/// Known-expensive entrypoints never go out with less gas than this.
pub const GAS_FLOOR_EXPENSIVE: u64 = 2_000_000;

/// Scale an eth_estimateGas result the way every caller here does.
pub fn scaled_gas(estimate: u64, expensive: bool) -> u64 {
    let scaled = estimate.saturating_mul(13) / 10;
    if expensive {
        scaled.max(GAS_FLOOR_EXPENSIVE)
    } else {
        scaled
    }
}

/// Thin adapter over a set of JSON-RPC endpoints. Reads may be reordered by
/// callers; writes for one sub-wallet serialize through the nonce tracker.
pub struct ChainClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    active: AtomicUsize,
    consecutive_failures: AtomicU32,
    next_id: AtomicU64,
    chain_id: u64,
    /// JSON-RPC error substrings that mean "try the next endpoint".
    rotate_patterns: Vec<String>,
    pub nonces: NonceTracker,
}

impl ChainClient {
    pub fn new(endpoints: Vec<String>, chain_id: u64) -> Result<Self, ChainError> {
        if endpoints.is_empty() {
            return Err(ChainError::Transport("no RPC endpoints configured".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoints,
            active: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            chain_id,
            rotate_patterns: vec!["rate".into(), "block range".into(), "limit".into()],
            nonces: NonceTracker::new(),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn active_endpoint(&self) -> &str {
        &self.endpoints[self.active.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn rotate(&self) {
        let from = self.active.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        warn!(
            from = %self.endpoints[from],
            to = %self.active_endpoint(),
            "rotating rpc endpoint"
        );
    }

    fn record_failure(&self) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= ROTATE_AFTER {
            self.rotate();
        }
    }

    fn should_rotate_on(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.rotate_patterns.iter().any(|p| lower.contains(p))
    }

    // ── Core request path ───────────────────────────────────────────

    async fn send_one(&self, req: &JsonRpcRequest) -> Result<serde_json::Value, ChainError> {
        let endpoint = self.active_endpoint().to_string();
        let response = self
            .http
            .post(&endpoint)
            .json(req)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
                data: extract_revert_data(err.data.as_ref()),
            });
        }
        parsed
            .result
            .ok_or_else(|| ChainError::Decode("response carries neither result nor error".into()))
    }

    /// One logical call: transient errors back off with jitter, rate/range
    /// errors rotate the endpoint, anything else surfaces immediately.
    pub async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let mut attempt = 0u32;
        loop {
            match self.send_one(&req).await {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    self.record_failure();
                    let backoff = backoff_with_jitter(attempt);
                    debug!(method, attempt, ?backoff, error = %e, "transient rpc failure");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(ChainError::Rpc { code, message, .. })
                    if self.should_rotate_on(&message) && attempt + 1 < MAX_ATTEMPTS =>
                {
                    debug!(method, code, %message, "provider pushed back, rotating");
                    self.rotate();
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.record_failure();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Batch form, results in input order. Providers without batch support
    /// get the same calls sequentially.
    pub async fn batch(
        &self,
        calls: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<Result<serde_json::Value, ChainError>>, ChainError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<JsonRpcRequest> = calls
            .iter()
            .map(|(method, params)| JsonRpcRequest {
                jsonrpc: "2.0",
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                method: method.clone(),
                params: params.clone(),
            })
            .collect();

        match self.send_batch(&requests).await {
            Ok(results) => Ok(results),
            Err(e) => {
                debug!(error = %e, "batch rejected, falling back to sequential");
                let mut out = Vec::with_capacity(calls.len());
                for (method, params) in calls {
                    out.push(self.rpc(&method, params).await);
                }
                Ok(out)
            }
        }
    }

    async fn send_batch(
        &self,
        requests: &[JsonRpcRequest],
    ) -> Result<Vec<Result<serde_json::Value, ChainError>>, ChainError> {
        let endpoint = self.active_endpoint().to_string();
        let response = self
            .http
            .post(&endpoint)
            .json(requests)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(e.to_string()))?;

        // A single error object instead of an array is how most providers
        // reject batching.
        let serde_json::Value::Array(items) = body else {
            return Err(ChainError::Rpc {
                code: -32600,
                message: "batch not supported".into(),
                data: None,
            });
        };

        let mut by_id = std::collections::HashMap::new();
        for item in items {
            let parsed: JsonRpcResponse =
                serde_json::from_value(item).map_err(|e| ChainError::Decode(e.to_string()))?;
            if let Some(id) = parsed.id {
                by_id.insert(id, parsed);
            }
        }

        Ok(requests
            .iter()
            .map(|req| match by_id.remove(&req.id) {
                Some(JsonRpcResponse { error: Some(err), .. }) => Err(ChainError::Rpc {
                    code: err.code,
                    message: err.message,
                    data: extract_revert_data(err.data.as_ref()),
                }),
                Some(JsonRpcResponse { result: Some(v), .. }) => Ok(v),
                _ => Err(ChainError::Decode(format!("no response for id {}", req.id))),
            })
            .collect())
    }

    // ── Read methods ────────────────────────────────────────────────

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let v = self.rpc("eth_blockNumber", serde_json::json!([])).await?;
        parse_hex_u64(as_str(&v)?)
    }

    /// Base fee of the latest block; the only fee source this client has.
    pub async fn base_fee(&self) -> Result<U256, ChainError> {
        let v = self
            .rpc("eth_getBlockByNumber", serde_json::json!(["latest", false]))
            .await?;
        let base = v
            .get("baseFeePerGas")
            .and_then(|b| b.as_str())
            .ok_or_else(|| ChainError::Decode("block without baseFeePerGas".into()))?;
        parse_hex_u256(base)
    }

    /// Read-only contract call. Never signs.
    pub async fn call(
        &self,
        to: Address,
        data: Bytes,
        block: Option<u64>,
    ) -> Result<Bytes, ChainError> {
        let call = CallRequest {
            to,
            data: Some(data),
            ..Default::default()
        };
        let tag = block
            .map(|b| format!("{b:#x}"))
            .unwrap_or_else(|| "latest".into());
        let v = self
            .rpc("eth_call", serde_json::json!([call, tag]))
            .await?;
        parse_bytes(&v)
    }

    /// Simulate a state-changing call from a concrete sender.
    pub async fn simulate(&self, call: &CallRequest) -> Result<Bytes, ChainError> {
        let v = self
            .rpc("eth_call", serde_json::json!([call, "latest"]))
            .await?;
        parse_bytes(&v)
    }

    pub async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        let v = self
            .rpc("eth_estimateGas", serde_json::json!([call]))
            .await?;
        parse_hex_u64(as_str(&v)?)
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        let v = self
            .rpc(
                "eth_getBalance",
                serde_json::json!([format!("{address:#x}"), "latest"]),
            )
            .await?;
        parse_hex_u256(as_str(&v)?)
    }

    /// Pending-tag nonce, used only to prime the local tracker.
    pub async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let v = self
            .rpc(
                "eth_getTransactionCount",
                serde_json::json!([format!("{address:#x}"), "pending"]),
            )
            .await?;
        parse_hex_u64(as_str(&v)?)
    }

    /// eth_getLogs with the provider's block window respected: wide ranges
    /// are split into contiguous sub-ranges and concatenated in order.
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError> {
        let mut out = Vec::new();
        let mut from = filter.from_block;
        while from <= filter.to_block {
            let to = filter.to_block.min(from + LOG_WINDOW - 1);
            let window = LogFilter {
                from_block: from,
                to_block: to,
                address: filter.address,
                topics: filter.topics.clone(),
            };
            let v = self.rpc("eth_getLogs", window.to_params()).await?;
            let logs: Vec<RpcLog> =
                serde_json::from_value(v).map_err(|e| ChainError::Decode(e.to_string()))?;
            out.extend(logs);
            from = to + 1;
        }
        Ok(out)
    }

    // ── Write methods ───────────────────────────────────────────────

    pub async fn send_raw(&self, raw: &[u8]) -> Result<B256, ChainError> {
        let v = self
            .rpc(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        let s = as_str(&v)?;
        s.parse::<B256>()
            .map_err(|e| ChainError::Decode(format!("tx hash '{s}': {e}")))
    }

    pub async fn receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, ChainError> {
        let v = self
            .rpc(
                "eth_getTransactionReceipt",
                serde_json::json!([format!("{hash:#x}")]),
            )
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        serde_json::from_value(v)
            .map(Some)
            .map_err(|e| ChainError::Decode(e.to_string()))
    }

    /// Poll for a receipt until `timeout`. The returned receipt still has to
    /// be checked for on-chain revert by the caller.
    pub async fn wait_receipt(
        &self,
        hash: B256,
        timeout: Duration,
    ) -> Result<RpcReceipt, ChainError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(receipt) = self.receipt(hash).await? {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn classify_reqwest(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout(20)
    } else {
        ChainError::Transport(e.to_string())
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    use rand::Rng;
    let base = 400u64 * (1 << attempt.min(4));
    let jitter: u64 = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn as_str(v: &serde_json::Value) -> Result<&str, ChainError> {
    v.as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected string, got {v}")))
}

fn parse_bytes(v: &serde_json::Value) -> Result<Bytes, ChainError> {
    let s = as_str(v)?;
    s.parse::<Bytes>()
        .map_err(|e| ChainError::Decode(format!("bytes '{s}': {e}")))
}

/// Revert data hides in different places depending on the provider.
fn extract_revert_data(data: Option<&serde_json::Value>) -> Option<Bytes> {
    let data = data?;
    let raw = match data {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map
            .get("data")
            .or_else(|| map.get("originalError").and_then(|o| o.get("data")))
            .and_then(|d| d.as_str()),
        _ => None,
    }?;
    raw.parse::<Bytes>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_scaling_and_floor() {
        assert_eq!(scaled_gas(100_000, false), 130_000);
        assert_eq!(scaled_gas(100_000, true), GAS_FLOOR_EXPENSIVE);
        assert_eq!(scaled_gas(3_000_000, true), 3_900_000);
    }

    #[test]
    fn revert_data_extraction_shapes() {
        let plain = serde_json::json!("0x08c379a0");
        assert!(extract_revert_data(Some(&plain)).is_some());

        let nested = serde_json::json!({ "data": "0x08c379a0" });
        assert!(extract_revert_data(Some(&nested)).is_some());

        let geth = serde_json::json!({ "originalError": { "data": "0x08c379a0" } });
        assert!(extract_revert_data(Some(&geth)).is_some());

        assert!(extract_revert_data(Some(&serde_json::json!(42))).is_none());
    }

    #[test]
    fn log_filter_splitting_preserves_bounds() {
        let filter = LogFilter {
            from_block: 0,
            to_block: 120_000,
            address: None,
            topics: vec![],
        };
        // Three windows: [0, 48999], [49000, 97999], [98000, 120000].
        let mut from = filter.from_block;
        let mut windows = Vec::new();
        while from <= filter.to_block {
            let to = filter.to_block.min(from + LOG_WINDOW - 1);
            windows.push((from, to));
            from = to + 1;
        }
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (0, 48_999));
        assert_eq!(windows[2], (98_000, 120_000));
    }
}
