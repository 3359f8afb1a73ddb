//! Test doubles and fixtures

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::{
    Confirmation, ConfirmationStatus, LedgerClient, LedgerEvent, LedgerEventKind, SignedSettlement,
};
use crate::error::{AppResult, LedgerError};
use crate::store::models::{NewCandle, NewPolicy};

pub const CONTRACT: &str = "0xpool";

/// 2024-01-01T00:00:00Z plus `secs`
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

pub fn candle_at(
    symbol: &str,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
) -> NewCandle {
    NewCandle {
        symbol: symbol.to_string(),
        timestamp,
        open,
        high,
        low,
        close,
        volume: dec!(1),
    }
}

pub fn policy_fixture(
    purchase_ref: &str,
    ledger_policy_id: i64,
    holder: &str,
    purchase_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
) -> NewPolicy {
    NewPolicy {
        purchase_ref: purchase_ref.to_string(),
        ledger_policy_id,
        holder_address: holder.to_string(),
        premium: dec!(10),
        coverage_amount: dec!(100),
        purchase_time,
        expiry_time,
        purchase_height: ledger_policy_id * 10,
    }
}

pub fn holder(n: u8) -> String {
    format!("0x{}", format!("{:02x}", n).repeat(20))
}

pub fn purchase_event(
    ledger_policy_id: i64,
    holder: &str,
    coverage: Decimal,
    expiry_time: DateTime<Utc>,
    block_height: u64,
) -> LedgerEvent {
    LedgerEvent {
        kind: LedgerEventKind::Purchase {
            premium: coverage / dec!(10),
            expiry_time,
        },
        holder: holder.to_string(),
        policy_ref: Some(ledger_policy_id),
        amount: coverage,
        tx_ref: format!("0xpurchase{}", ledger_policy_id),
        log_index: 0,
        block_height,
        block_time: Some(ts(0)),
    }
}

pub fn settlement_event(
    policy_ref: Option<i64>,
    holder: &str,
    amount: Decimal,
    tx_ref: &str,
    block_height: u64,
) -> LedgerEvent {
    LedgerEvent {
        kind: LedgerEventKind::Settlement,
        holder: holder.to_string(),
        policy_ref,
        amount,
        tx_ref: tx_ref.to_string(),
        log_index: 0,
        block_height,
        block_time: None,
    }
}

#[derive(Default)]
struct LedgerState {
    height: u64,
    events: Vec<LedgerEvent>,
    coverage: HashMap<i64, Decimal>,
    next_nonce: u64,
    submitted: Vec<SignedSettlement>,
    pending: HashMap<String, SignedSettlement>,
    rejected_holders: HashSet<String>,
    failing_holders: HashSet<String>,
    fail_next_submission: bool,
    fail_fetch_at: Option<u64>,
    fetch_ranges: Vec<(u64, u64)>,
    hang_confirmations: bool,
    submission_counter: u64,
}

/// Programmable in-process ledger.
///
/// A confirmed settlement appends its own settlement log at the current
/// height, the way the contract emits `PayoutExecuted`.
pub struct ScriptedLedger {
    state: Mutex<LedgerState>,
}

impl ScriptedLedger {
    pub fn new(height: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                height,
                ..Default::default()
            }),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn push_event(&self, event: LedgerEvent) {
        let mut state = self.state.lock().unwrap();
        if let (LedgerEventKind::Purchase { .. }, Some(id)) = (&event.kind, event.policy_ref) {
            state.coverage.insert(id, event.amount);
        }
        state.events.push(event);
    }

    pub fn set_next_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().next_nonce = nonce;
    }

    pub fn submitted_nonces(&self) -> Vec<u64> {
        self.state.lock().unwrap().submitted.iter().map(|s| s.nonce).collect()
    }

    pub fn submitted(&self) -> Vec<SignedSettlement> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Settlements for `holder` are included but revert
    pub fn reject_holder(&self, holder: &str) {
        self.state.lock().unwrap().rejected_holders.insert(holder.to_lowercase());
    }

    /// Submissions for `holder` never reach the ledger
    pub fn fail_submissions_for(&self, holder: &str) {
        self.state.lock().unwrap().failing_holders.insert(holder.to_lowercase());
    }

    pub fn fail_next_submission(&self) {
        self.state.lock().unwrap().fail_next_submission = true;
    }

    /// The next fetch whose range contains `height` fails, once
    pub fn fail_fetch_at(&self, height: u64) {
        self.state.lock().unwrap().fail_fetch_at = Some(height);
    }

    pub fn fetch_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().fetch_ranges.clone()
    }

    pub fn hang_confirmations(&self) {
        self.state.lock().unwrap().hang_confirmations = true;
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    fn contract_id(&self) -> &str {
        CONTRACT
    }

    async fn current_height(&self) -> AppResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn fetch_events(&self, from_height: u64, to_height: u64) -> AppResult<Vec<LedgerEvent>> {
        let mut state = self.state.lock().unwrap();
        state.fetch_ranges.push((from_height, to_height));
        if let Some(height) = state.fail_fetch_at {
            if (from_height..=to_height).contains(&height) {
                state.fail_fetch_at = None;
                return Err(LedgerError::rpc("eth_getLogs", "query timeout").into());
            }
        }

        let mut events: Vec<LedgerEvent> = state
            .events
            .iter()
            .filter(|e| e.block_height >= from_height && e.block_height <= to_height)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_height, e.log_index));
        Ok(events)
    }

    async fn signer_nonce(&self, _signer: &str) -> AppResult<u64> {
        Ok(self.state.lock().unwrap().next_nonce)
    }

    async fn submit_settlement(&self, settlement: &SignedSettlement) -> AppResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_submission {
            state.fail_next_submission = false;
            return Err(LedgerError::Submission("connection refused".into()).into());
        }
        if state.failing_holders.contains(&settlement.holder) {
            return Err(LedgerError::Submission("relayer unavailable".into()).into());
        }
        if settlement.nonce != state.next_nonce {
            return Err(LedgerError::Submission(format!(
                "nonce mismatch: expected {}, got {}",
                state.next_nonce, settlement.nonce
            ))
            .into());
        }

        state.next_nonce += 1;
        state.submission_counter += 1;
        let settlement_ref = format!("0x{:064x}", state.submission_counter);
        state.submitted.push(settlement.clone());
        state.pending.insert(settlement_ref.clone(), settlement.clone());
        Ok(settlement_ref)
    }

    async fn wait_for_confirmation(
        &self,
        settlement_ref: &str,
        timeout: Duration,
    ) -> AppResult<Confirmation> {
        let hang = self.state.lock().unwrap().hang_confirmations;
        if hang {
            tokio::time::sleep(timeout + Duration::from_secs(3600)).await;
        }

        let mut state = self.state.lock().unwrap();
        let settlement = state
            .pending
            .remove(settlement_ref)
            .ok_or_else(|| LedgerError::ConfirmationTimeout(settlement_ref.to_string()))?;
        let height = state.height;

        if state.rejected_holders.contains(&settlement.holder) {
            return Ok(Confirmation {
                status: ConfirmationStatus::Failure,
                finalized_height: height,
            });
        }

        let amount = state
            .coverage
            .get(&settlement.policy_ref)
            .copied()
            .unwrap_or(Decimal::ZERO);
        state.events.push(settlement_event(
            Some(settlement.policy_ref),
            &settlement.holder,
            amount,
            settlement_ref,
            height,
        ));

        Ok(Confirmation {
            status: ConfirmationStatus::Success,
            finalized_height: height,
        })
    }
}
