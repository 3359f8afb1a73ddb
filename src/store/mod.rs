pub mod memory;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use models::*;

/// Local state store - the durable mirror every component reads and writes through.
///
/// INVARIANT: writes that both the executor and the reconciler can attempt
/// (payout insert, policy claim) are idempotent at this layer: unique-key
/// insert-or-ignore and conditional updates. Callers never check-then-insert.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ========== CANDLES ==========

    /// Insert-or-ignore on (symbol, timestamp). Returns true when a row was written.
    async fn insert_candle(&self, candle: &NewCandle) -> AppResult<bool>;

    async fn latest_candle(&self, symbol: &str) -> AppResult<Option<Candle>>;

    /// Newest first
    async fn recent_candles(&self, symbol: &str, limit: i64) -> AppResult<Vec<Candle>>;

    /// Candles with id greater than `after_id`, ascending id
    async fn candles_after(&self, symbol: &str, after_id: i64, limit: i64) -> AppResult<Vec<Candle>>;

    /// Inclusive range, ascending timestamp
    async fn candles_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Candle>>;

    // ========== WICK EVENTS ==========

    /// Insert-or-ignore on the source candle. Returns the stored row and whether
    /// this call created it.
    async fn record_wick_event(&self, event: &NewWickEvent) -> AppResult<(WickEvent, bool)>;

    /// Highest candle id with a wick event for `symbol`, 0 if none
    async fn latest_detected_candle_id(&self, symbol: &str) -> AppResult<i64>;

    async fn recent_wick_events(&self, limit: i64) -> AppResult<Vec<WickEvent>>;

    // ========== POLICIES ==========

    /// Insert-or-ignore on `purchase_ref`. Never overwrites an existing policy.
    async fn insert_policy_if_absent(&self, policy: &NewPolicy) -> AppResult<bool>;

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>>;

    /// Active policies whose coverage window `[purchase_time, expiry_time)` contains `as_of`
    async fn eligible_policies(&self, as_of: DateTime<Utc>) -> AppResult<Vec<Policy>>;

    async fn find_policy_by_ledger_id(&self, ledger_policy_id: i64) -> AppResult<Option<Policy>>;

    /// Most recently purchased active policy for a holder
    async fn latest_active_policy_for_holder(&self, holder: &str) -> AppResult<Option<Policy>>;

    /// Compare-and-set active -> claimed. True only when this call performed the
    /// transition.
    ///
    /// A policy already claimed without a settlement ref (set outside this
    /// process, e.g. by an operator) gets `settlement_ref` backfilled. An
    /// existing ref is never replaced.
    async fn claim_policy(&self, id: Uuid, settlement_ref: &str) -> AppResult<bool>;

    /// active -> expired for policies whose expiry is at or before `cutoff`
    async fn expire_lapsed_policies(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    // ========== PAYOUTS ==========

    /// Insert-or-ignore on `settlement_ref`. Returns true when a row was written.
    async fn insert_payout_if_absent(&self, payout: &NewPayout) -> AppResult<bool>;

    async fn payout_by_settlement_ref(&self, settlement_ref: &str) -> AppResult<Option<Payout>>;

    async fn recent_payouts(&self, limit: i64) -> AppResult<Vec<Payout>>;

    /// Payouts whose policy could not be resolved locally
    async fn unlinked_payouts(&self, limit: i64) -> AppResult<Vec<Payout>>;

    // ========== RECONCILIATION CHECKPOINT ==========

    async fn checkpoint(&self, ledger_contract_id: &str) -> AppResult<Option<u64>>;

    /// Stored height becomes max(stored, height)
    async fn advance_checkpoint(&self, ledger_contract_id: &str, height: u64) -> AppResult<()>;

    // ========== REPORTING ==========

    async fn stats(&self) -> AppResult<SystemStats>;
}
