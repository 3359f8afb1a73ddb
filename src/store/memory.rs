use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::StateStore;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Tables {
    candles: Vec<Candle>,
    wick_events: Vec<WickEvent>,
    policies: HashMap<Uuid, Policy>,
    payouts: Vec<Payout>,
    checkpoints: HashMap<String, u64>,
    next_candle_id: i64,
    next_event_id: i64,
    #[cfg(test)]
    failing_payout_refs: std::collections::HashSet<String>,
}

/// In-process store with the same uniqueness and compare-and-set semantics as
/// the Postgres schema. Every write holds the single table lock.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Payout inserts for `settlement_ref` fail until cleared
    pub async fn fail_payout_writes_for(&self, settlement_ref: &str) {
        let mut tables = self.tables.write().await;
        tables.failing_payout_refs.insert(settlement_ref.to_string());
    }

    pub async fn clear_write_failures(&self) {
        self.tables.write().await.failing_payout_refs.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K, limit: i64) -> Vec<T> {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows.truncate(limit.max(0) as usize);
    rows
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_candle(&self, candle: &NewCandle) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .candles
            .iter()
            .any(|c| c.symbol == candle.symbol && c.timestamp == candle.timestamp)
        {
            return Ok(false);
        }

        tables.next_candle_id += 1;
        let id = tables.next_candle_id;
        tables.candles.push(Candle {
            id,
            symbol: candle.symbol.clone(),
            timestamp: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        });
        Ok(true)
    }

    async fn latest_candle(&self, symbol: &str) -> AppResult<Option<Candle>> {
        let tables = self.tables.read().await;
        Ok(tables
            .candles
            .iter()
            .filter(|c| c.symbol == symbol)
            .max_by_key(|c| c.timestamp)
            .cloned())
    }

    async fn recent_candles(&self, symbol: &str, limit: i64) -> AppResult<Vec<Candle>> {
        let tables = self.tables.read().await;
        let rows = tables
            .candles
            .iter()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect();
        Ok(newest_first(rows, |c: &Candle| c.timestamp, limit))
    }

    async fn candles_after(&self, symbol: &str, after_id: i64, limit: i64) -> AppResult<Vec<Candle>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Candle> = tables
            .candles
            .iter()
            .filter(|c| c.symbol == symbol && c.id > after_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.id);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn candles_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Candle>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Candle> = tables
            .candles
            .iter()
            .filter(|c| c.symbol == symbol && c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.timestamp);
        Ok(rows)
    }

    async fn record_wick_event(&self, event: &NewWickEvent) -> AppResult<(WickEvent, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .wick_events
            .iter()
            .find(|e| e.candle_id == event.candle_id)
        {
            return Ok((existing.clone(), false));
        }
        if !tables.candles.iter().any(|c| c.id == event.candle_id) {
            return Err(AppError::NotFound(format!("Candle {} not found", event.candle_id)));
        }

        tables.next_event_id += 1;
        let created = WickEvent {
            id: tables.next_event_id,
            symbol: event.symbol.clone(),
            timestamp: event.timestamp,
            candle_id: event.candle_id,
            body_ratio: event.body_ratio,
            range_ratio: event.range_ratio,
            detected_at: Utc::now(),
        };
        tables.wick_events.push(created.clone());
        Ok((created, true))
    }

    async fn latest_detected_candle_id(&self, symbol: &str) -> AppResult<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .wick_events
            .iter()
            .filter(|e| e.symbol == symbol)
            .map(|e| e.candle_id)
            .max()
            .unwrap_or(0))
    }

    async fn recent_wick_events(&self, limit: i64) -> AppResult<Vec<WickEvent>> {
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables.wick_events.clone(),
            |e: &WickEvent| (e.detected_at, e.id),
            limit,
        ))
    }

    async fn insert_policy_if_absent(&self, policy: &NewPolicy) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.policies.values().any(|p| {
            p.purchase_ref == policy.purchase_ref || p.ledger_policy_id == policy.ledger_policy_id
        }) {
            return Ok(false);
        }

        let id = Uuid::new_v4();
        tables.policies.insert(
            id,
            Policy {
                id,
                purchase_ref: policy.purchase_ref.clone(),
                ledger_policy_id: policy.ledger_policy_id,
                holder_address: policy.holder_address.to_lowercase(),
                premium: policy.premium,
                coverage_amount: policy.coverage_amount,
                purchase_time: policy.purchase_time,
                expiry_time: policy.expiry_time,
                purchase_height: policy.purchase_height,
                status: PolicyStatus::Active,
                settlement_ref: None,
            },
        );
        Ok(true)
    }

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>> {
        let tables = self.tables.read().await;
        Ok(tables.policies.get(&id).cloned())
    }

    async fn eligible_policies(&self, as_of: DateTime<Utc>) -> AppResult<Vec<Policy>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Policy> = tables
            .policies
            .values()
            .filter(|p| p.is_eligible_at(as_of))
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.purchase_height, p.ledger_policy_id));
        Ok(rows)
    }

    async fn find_policy_by_ledger_id(&self, ledger_policy_id: i64) -> AppResult<Option<Policy>> {
        let tables = self.tables.read().await;
        Ok(tables
            .policies
            .values()
            .find(|p| p.ledger_policy_id == ledger_policy_id)
            .cloned())
    }

    async fn latest_active_policy_for_holder(&self, holder: &str) -> AppResult<Option<Policy>> {
        let holder = holder.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .policies
            .values()
            .filter(|p| p.holder_address == holder && p.status == PolicyStatus::Active)
            .max_by_key(|p| (p.purchase_height, p.ledger_policy_id))
            .cloned())
    }

    async fn claim_policy(&self, id: Uuid, settlement_ref: &str) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(policy) = tables.policies.get_mut(&id) else {
            return Ok(false);
        };

        match policy.status {
            PolicyStatus::Active => {
                policy.status = PolicyStatus::Claimed;
                policy.settlement_ref = Some(settlement_ref.to_string());
                Ok(true)
            }
            PolicyStatus::Claimed if policy.settlement_ref.is_none() => {
                policy.settlement_ref = Some(settlement_ref.to_string());
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn expire_lapsed_policies(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut tables = self.tables.write().await;
        let mut expired = 0;
        for policy in tables.policies.values_mut() {
            if policy.status == PolicyStatus::Active && policy.expiry_time <= cutoff {
                policy.status = PolicyStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn insert_payout_if_absent(&self, payout: &NewPayout) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        #[cfg(test)]
        if tables.failing_payout_refs.contains(&payout.settlement_ref) {
            return Err(AppError::Internal("injected payout write failure".to_string()));
        }
        if tables
            .payouts
            .iter()
            .any(|p| p.settlement_ref == payout.settlement_ref)
        {
            return Ok(false);
        }

        tables.payouts.push(Payout {
            id: Uuid::new_v4(),
            policy_id: payout.policy_id,
            holder_address: payout.holder_address.to_lowercase(),
            amount: payout.amount,
            event_id: payout.event_id,
            settlement_ref: payout.settlement_ref.clone(),
            block_height: payout.block_height,
            source: payout.source,
            executed_at: Utc::now(),
        });
        Ok(true)
    }

    async fn payout_by_settlement_ref(&self, settlement_ref: &str) -> AppResult<Option<Payout>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payouts
            .iter()
            .find(|p| p.settlement_ref == settlement_ref)
            .cloned())
    }

    async fn recent_payouts(&self, limit: i64) -> AppResult<Vec<Payout>> {
        let tables = self.tables.read().await;
        Ok(newest_first(tables.payouts.clone(), |p: &Payout| p.executed_at, limit))
    }

    async fn unlinked_payouts(&self, limit: i64) -> AppResult<Vec<Payout>> {
        let tables = self.tables.read().await;
        let rows = tables
            .payouts
            .iter()
            .filter(|p| p.policy_id.is_none())
            .cloned()
            .collect();
        Ok(newest_first(rows, |p: &Payout| p.executed_at, limit))
    }

    async fn checkpoint(&self, ledger_contract_id: &str) -> AppResult<Option<u64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .checkpoints
            .get(&ledger_contract_id.to_lowercase())
            .copied())
    }

    async fn advance_checkpoint(&self, ledger_contract_id: &str, height: u64) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .checkpoints
            .entry(ledger_contract_id.to_lowercase())
            .or_insert(height);
        *stored = (*stored).max(height);
        Ok(())
    }

    async fn stats(&self) -> AppResult<SystemStats> {
        let tables = self.tables.read().await;
        let now = Utc::now();
        Ok(SystemStats {
            total_candles: tables.candles.len() as i64,
            total_events: tables.wick_events.len() as i64,
            total_policies: tables.policies.len() as i64,
            active_policies: tables
                .policies
                .values()
                .filter(|p| p.is_eligible_at(now))
                .count() as i64,
            total_payouts: tables.payouts.len() as i64,
            unlinked_payouts: tables
                .payouts
                .iter()
                .filter(|p| p.policy_id.is_none())
                .count() as i64,
        })
    }
}
