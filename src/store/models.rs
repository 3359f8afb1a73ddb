use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// OHLC candle as delivered by the price feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

/// Stored candle. Immutable once written, unique per (symbol, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Candle {
    pub id: i64,
    pub symbol: String,
    #[sqlx(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWickEvent {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub candle_id: i64,
    pub body_ratio: Decimal,
    pub range_ratio: Decimal,
}

/// A detected wick. Exactly one per source candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WickEvent {
    pub id: i64,
    pub symbol: String,
    #[sqlx(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub candle_id: i64,
    pub body_ratio: Decimal,
    pub range_ratio: Decimal,
    pub detected_at: DateTime<Utc>,
}

impl WickEvent {
    /// Reference carried by the settlement call back to this detection
    pub fn detection_ref(&self) -> String {
        format!("wick-{}-{}", self.id, self.timestamp.format("%Y%m%d%H%M%S"))
    }
}

/// Policy status enum
///
/// active -> claimed on a confirmed settlement, active -> expired by the optional sweep.
/// Nothing leaves `claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "policy_status", rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Expired,
    Claimed,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Expired => "expired",
            PolicyStatus::Claimed => "claimed",
        };
        write!(f, "{}", s)
    }
}

/// Policy as mirrored from a ledger purchase event
#[derive(Debug, Clone, PartialEq)]
pub struct NewPolicy {
    /// `<txHash>:<logIndex>` of the purchase log
    pub purchase_ref: String,
    pub ledger_policy_id: i64,
    pub holder_address: String,
    pub premium: Decimal,
    pub coverage_amount: Decimal,
    pub purchase_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub purchase_height: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Policy {
    pub id: Uuid,
    pub purchase_ref: String,
    pub ledger_policy_id: i64,
    pub holder_address: String,
    pub premium: Decimal,
    pub coverage_amount: Decimal,
    pub purchase_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub purchase_height: i64,
    pub status: PolicyStatus,
    pub settlement_ref: Option<String>,
}

impl Policy {
    /// Active, bought at or before `as_of` and not expired at `as_of`
    pub fn is_eligible_at(&self, as_of: DateTime<Utc>) -> bool {
        self.status == PolicyStatus::Active
            && self.purchase_time <= as_of
            && self.expiry_time > as_of
    }
}

/// Which pipeline component wrote a payout row first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_source", rename_all = "lowercase")]
pub enum PayoutSource {
    Executor,
    Reconciler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayout {
    pub policy_id: Option<Uuid>,
    pub holder_address: String,
    pub amount: Decimal,
    pub event_id: Option<i64>,
    pub settlement_ref: String,
    pub block_height: Option<i64>,
    pub source: PayoutSource,
}

/// Payout record, at most one per `settlement_ref`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payout {
    pub id: Uuid,
    /// None when the owning policy is not known locally
    pub policy_id: Option<Uuid>,
    pub holder_address: String,
    pub amount: Decimal,
    pub event_id: Option<i64>,
    pub settlement_ref: String,
    pub block_height: Option<i64>,
    pub source: PayoutSource,
    pub executed_at: DateTime<Utc>,
}

/// Aggregate counts for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct SystemStats {
    pub total_candles: i64,
    pub total_events: i64,
    pub total_policies: i64,
    pub active_policies: i64,
    pub total_payouts: i64,
    pub unlinked_payouts: i64,
}
