pub mod abi;
pub mod rpc;
pub mod signer;

pub use rpc::RpcLedgerClient;
pub use signer::{SettlementRequest, SettlementSigner, SignedSettlement};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppResult;

/// Decoded contract log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEventKind {
    Purchase {
        premium: Decimal,
        expiry_time: DateTime<Utc>,
    },
    Settlement,
}

/// One purchase or settlement observed on the ledger.
///
/// `amount` is the coverage amount for a purchase and the paid amount for a
/// settlement, both already scaled out of base units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub holder: String,
    pub policy_ref: Option<i64>,
    pub amount: Decimal,
    pub tx_ref: String,
    pub log_index: u64,
    pub block_height: u64,
    pub block_time: Option<DateTime<Utc>>,
}

impl LedgerEvent {
    /// Settlement-independent key of a purchase
    pub fn purchase_ref(&self) -> String {
        format!("{}:{}", self.tx_ref, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub status: ConfirmationStatus,
    pub finalized_height: u64,
}

impl Confirmation {
    pub fn succeeded(&self) -> bool {
        self.status == ConfirmationStatus::Success
    }
}

/// External ledger collaborator
///
/// INVARIANTS:
/// - `fetch_events` is inclusive on both ends and returns logs ordered by
///   (block height, log index)
/// - `submit_settlement` returns the ledger's unique transaction reference
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Identifier the reconciliation checkpoint is keyed by
    fn contract_id(&self) -> &str;

    async fn current_height(&self) -> AppResult<u64>;

    async fn fetch_events(&self, from_height: u64, to_height: u64) -> AppResult<Vec<LedgerEvent>>;

    /// Next nonce the ledger expects from `signer`
    async fn signer_nonce(&self, signer: &str) -> AppResult<u64>;

    async fn submit_settlement(&self, settlement: &SignedSettlement) -> AppResult<String>;

    /// Blocks until the settlement is included or `timeout` elapses
    async fn wait_for_confirmation(
        &self,
        settlement_ref: &str,
        timeout: Duration,
    ) -> AppResult<Confirmation>;
}
