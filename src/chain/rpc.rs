use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::abi::{self, RawLog, PAYOUT_EXECUTED_TOPIC, POLICY_PURCHASED_TOPIC};
use super::{Confirmation, ConfirmationStatus, LedgerClient, LedgerEvent, SignedSettlement};
use crate::error::{AppResult, LedgerError};

/// JSON-RPC client for the insurance pool contract.
///
/// Reads (heights, logs, receipts) go to the node; signed settlements and
/// nonce lookups go to the relayer.
pub struct RpcLedgerClient {
    http: reqwest::Client,
    rpc_url: String,
    relayer_url: String,
    contract_address: String,
    token_decimals: u32,
    receipt_poll: Duration,
    request_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(
        rpc_url: &str,
        relayer_url: &str,
        contract_address: &str,
        token_decimals: u32,
        receipt_poll: Duration,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            relayer_url: relayer_url.to_string(),
            contract_address: contract_address.to_lowercase(),
            token_decimals,
            receipt_poll,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, url: &str, method: &str, params: Value) -> AppResult<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response: Value = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LedgerError::rpc(method, e.to_string()))?
            .json()
            .await
            .map_err(|e| LedgerError::rpc(method, e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(LedgerError::rpc(method, error.to_string()).into());
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::rpc(method, "response has no result").into())
    }

    async fn block_time(&self, height: u64) -> AppResult<DateTime<Utc>> {
        let block = self
            .call(
                &self.rpc_url,
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", height), false]),
            )
            .await?;
        Ok(timestamp_from_block(&block)?)
    }
}

fn timestamp_from_block(block: &Value) -> Result<DateTime<Utc>, LedgerError> {
    let raw = block
        .get("timestamp")
        .and_then(|t| t.as_str())
        .ok_or_else(|| LedgerError::Decode("Block has no timestamp".to_string()))?;
    let seconds = i64::try_from(abi::parse_quantity(raw)?)
        .map_err(|_| LedgerError::Decode(format!("Block timestamp {} out of range", raw)))?;
    abi::unix_time(seconds)
}

fn parse_quantity_value(method: &str, value: &Value) -> Result<u64, LedgerError> {
    match value {
        Value::String(s) => abi::parse_quantity(s),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| LedgerError::rpc(method, format!("invalid number {}", n))),
        other => Err(LedgerError::rpc(method, format!("unexpected result {}", other))),
    }
}

/// `None` while the transaction is still pending
fn confirmation_from_receipt(receipt: &Value) -> Result<Option<Confirmation>, LedgerError> {
    if receipt.is_null() {
        return Ok(None);
    }

    let status = receipt
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| LedgerError::Decode("Receipt has no status".to_string()))?;
    let block_number = receipt
        .get("blockNumber")
        .and_then(|b| b.as_str())
        .ok_or_else(|| LedgerError::Decode("Receipt has no block number".to_string()))?;

    let status = if abi::parse_quantity(status)? == 1 {
        ConfirmationStatus::Success
    } else {
        ConfirmationStatus::Failure
    };

    Ok(Some(Confirmation {
        status,
        finalized_height: abi::parse_quantity(block_number)?,
    }))
}

fn decode_logs(logs: &[Value], contract: &str, decimals: u32) -> Vec<LedgerEvent> {
    let mut events = Vec::with_capacity(logs.len());

    for log in logs {
        let raw: RawLog = match serde_json::from_value(log.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Skipping log with unexpected shape");
                continue;
            }
        };
        if !raw.address.eq_ignore_ascii_case(contract) {
            warn!(address = %raw.address, "Skipping log from another contract");
            continue;
        }
        if raw.removed {
            debug!(tx = %raw.transaction_hash, "Skipping removed log");
            continue;
        }
        match abi::decode_log(&raw, decimals) {
            Ok(event) => events.push(event),
            Err(e) => warn!(tx = %raw.transaction_hash, error = %e, "Skipping undecodable log"),
        }
    }

    events.sort_by_key(|e| (e.block_height, e.log_index));
    events
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    fn contract_id(&self) -> &str {
        &self.contract_address
    }

    async fn current_height(&self) -> AppResult<u64> {
        let result = self.call(&self.rpc_url, "eth_blockNumber", json!([])).await?;
        Ok(parse_quantity_value("eth_blockNumber", &result)?)
    }

    async fn fetch_events(&self, from_height: u64, to_height: u64) -> AppResult<Vec<LedgerEvent>> {
        let params = json!([{
            "address": self.contract_address,
            "topics": [[POLICY_PURCHASED_TOPIC, PAYOUT_EXECUTED_TOPIC]],
            "fromBlock": format!("0x{:x}", from_height),
            "toBlock": format!("0x{:x}", to_height),
        }]);

        let result = self.call(&self.rpc_url, "eth_getLogs", params).await?;
        let logs = result
            .as_array()
            .ok_or_else(|| LedgerError::rpc("eth_getLogs", "result is not an array"))?;

        let mut events = decode_logs(logs, &self.contract_address, self.token_decimals);

        // Most nodes omit blockTimestamp from logs; purchase times come from the block
        let mut block_times: HashMap<u64, DateTime<Utc>> = HashMap::new();
        for event in events.iter_mut().filter(|e| e.block_time.is_none()) {
            let time = match block_times.get(&event.block_height) {
                Some(time) => *time,
                None => {
                    let time = self.block_time(event.block_height).await?;
                    block_times.insert(event.block_height, time);
                    time
                }
            };
            event.block_time = Some(time);
        }

        debug!(from_height, to_height, logs = logs.len(), events = events.len(), "Fetched ledger logs");
        Ok(events)
    }

    async fn signer_nonce(&self, signer: &str) -> AppResult<u64> {
        let result = self
            .call(&self.relayer_url, "relay_getNonce", json!([signer]))
            .await?;
        Ok(parse_quantity_value("relay_getNonce", &result)?)
    }

    async fn submit_settlement(&self, settlement: &SignedSettlement) -> AppResult<String> {
        let result = self
            .call(&self.relayer_url, "relay_submitSettlement", json!([settlement]))
            .await
            .map_err(|e| LedgerError::Submission(e.to_string()))?;

        let settlement_ref = result
            .as_str()
            .ok_or_else(|| LedgerError::Submission(format!("unexpected relayer result {}", result)))?
            .to_lowercase();

        info!("📤 Settlement submitted: {} (nonce {})", settlement_ref, settlement.nonce);
        Ok(settlement_ref)
    }

    async fn wait_for_confirmation(
        &self,
        settlement_ref: &str,
        timeout: Duration,
    ) -> AppResult<Confirmation> {
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .call(&self.rpc_url, "eth_getTransactionReceipt", json!([settlement_ref]))
                .await
            {
                Ok(receipt) => {
                    if let Some(confirmation) = confirmation_from_receipt(&receipt)? {
                        return Ok(confirmation);
                    }
                }
                Err(e) => {
                    // Keep polling until the deadline
                    debug!(settlement_ref, error = %e, "Receipt lookup failed");
                }
            }

            if Instant::now() >= deadline {
                return Err(LedgerError::ConfirmationTimeout(settlement_ref.to_string()).into());
            }

            tokio::time::sleep(self.receipt_poll).await;
        }
    }
}
