use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::StateStore;
use crate::error::{AppError, AppResult};

const CANDLE_COLUMNS: &str = "id, symbol, ts, open, high, low, close, volume";
const WICK_COLUMNS: &str = "id, symbol, ts, candle_id, body_ratio, range_ratio, detected_at";
const POLICY_COLUMNS: &str = "id, purchase_ref, ledger_policy_id, holder_address, premium, \
     coverage_amount, purchase_time, expiry_time, purchase_height, status, settlement_ref";
const PAYOUT_COLUMNS: &str = "id, policy_id, holder_address, amount, event_id, settlement_ref, \
     block_height, source, executed_at";

/// Postgres-backed store - THE durable source of local state
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn height_to_db(height: u64) -> AppResult<i64> {
    i64::try_from(height)
        .map_err(|_| AppError::InvalidInput(format!("Block height {} out of range", height)))
}

#[async_trait]
impl StateStore for PgStore {
    // ========== CANDLE OPERATIONS ==========

    async fn insert_candle(&self, candle: &NewCandle) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO candles (symbol, ts, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (symbol, ts) DO NOTHING
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.timestamp)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_candle(&self, symbol: &str) -> AppResult<Option<Candle>> {
        let candle = sqlx::query_as::<_, Candle>(&format!(
            "SELECT {} FROM candles WHERE symbol = $1 ORDER BY ts DESC LIMIT 1",
            CANDLE_COLUMNS
        ))
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(candle)
    }

    async fn recent_candles(&self, symbol: &str, limit: i64) -> AppResult<Vec<Candle>> {
        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT {} FROM candles WHERE symbol = $1 ORDER BY ts DESC LIMIT $2",
            CANDLE_COLUMNS
        ))
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(candles)
    }

    async fn candles_after(&self, symbol: &str, after_id: i64, limit: i64) -> AppResult<Vec<Candle>> {
        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT {} FROM candles WHERE symbol = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
            CANDLE_COLUMNS
        ))
        .bind(symbol)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(candles)
    }

    async fn candles_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Candle>> {
        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT {} FROM candles WHERE symbol = $1 AND ts BETWEEN $2 AND $3 ORDER BY ts ASC",
            CANDLE_COLUMNS
        ))
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(candles)
    }

    // ========== WICK EVENT OPERATIONS ==========

    async fn record_wick_event(&self, event: &NewWickEvent) -> AppResult<(WickEvent, bool)> {
        let inserted = sqlx::query_as::<_, WickEvent>(&format!(
            r#"
            INSERT INTO wick_events (symbol, ts, candle_id, body_ratio, range_ratio)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (candle_id) DO NOTHING
            RETURNING {}
            "#,
            WICK_COLUMNS
        ))
        .bind(&event.symbol)
        .bind(event.timestamp)
        .bind(event.candle_id)
        .bind(event.body_ratio)
        .bind(event.range_ratio)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(created) = inserted {
            return Ok((created, true));
        }

        // Lost the race or re-evaluated: the row that won is the event
        let existing = sqlx::query_as::<_, WickEvent>(&format!(
            "SELECT {} FROM wick_events WHERE candle_id = $1",
            WICK_COLUMNS
        ))
        .bind(event.candle_id)
        .fetch_one(&self.pool)
        .await?;

        debug!(candle_id = event.candle_id, event_id = existing.id, "Wick event already recorded");
        Ok((existing, false))
    }

    async fn latest_detected_candle_id(&self, symbol: &str) -> AppResult<i64> {
        let id = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(candle_id) FROM wick_events WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        Ok(id.unwrap_or(0))
    }

    async fn recent_wick_events(&self, limit: i64) -> AppResult<Vec<WickEvent>> {
        let events = sqlx::query_as::<_, WickEvent>(&format!(
            "SELECT {} FROM wick_events ORDER BY detected_at DESC, id DESC LIMIT $1",
            WICK_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    // ========== POLICY OPERATIONS ==========

    async fn insert_policy_if_absent(&self, policy: &NewPolicy) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO policies (
                purchase_ref, ledger_policy_id, holder_address, premium, coverage_amount,
                purchase_time, expiry_time, purchase_height, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&policy.purchase_ref)
        .bind(policy.ledger_policy_id)
        .bind(policy.holder_address.to_lowercase())
        .bind(policy.premium)
        .bind(policy.coverage_amount)
        .bind(policy.purchase_time)
        .bind(policy.expiry_time)
        .bind(policy.purchase_height)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {} FROM policies WHERE id = $1",
            POLICY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(policy)
    }

    async fn eligible_policies(&self, as_of: DateTime<Utc>) -> AppResult<Vec<Policy>> {
        let policies = sqlx::query_as::<_, Policy>(&format!(
            r#"
            SELECT {} FROM policies
            WHERE status = 'active' AND purchase_time <= $1 AND expiry_time > $1
            ORDER BY purchase_height ASC, ledger_policy_id ASC
            "#,
            POLICY_COLUMNS
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(policies)
    }

    async fn find_policy_by_ledger_id(&self, ledger_policy_id: i64) -> AppResult<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {} FROM policies WHERE ledger_policy_id = $1",
            POLICY_COLUMNS
        ))
        .bind(ledger_policy_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(policy)
    }

    async fn latest_active_policy_for_holder(&self, holder: &str) -> AppResult<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            r#"
            SELECT {} FROM policies
            WHERE holder_address = $1 AND status = 'active'
            ORDER BY purchase_height DESC, ledger_policy_id DESC
            LIMIT 1
            "#,
            POLICY_COLUMNS
        ))
        .bind(holder.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(policy)
    }

    async fn claim_policy(&self, id: Uuid, settlement_ref: &str) -> AppResult<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE policies
            SET status = 'claimed', settlement_ref = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(settlement_ref)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(true);
        }

        let backfilled = sqlx::query(
            r#"
            UPDATE policies
            SET settlement_ref = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND settlement_ref IS NULL
            "#,
        )
        .bind(id)
        .bind(settlement_ref)
        .execute(&self.pool)
        .await?;

        if backfilled.rows_affected() == 1 {
            info!(policy_id = %id, settlement_ref, "Backfilled settlement reference");
        }

        Ok(false)
    }

    async fn expire_lapsed_policies(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE policies
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'active' AND expiry_time <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== PAYOUT OPERATIONS ==========

    async fn insert_payout_if_absent(&self, payout: &NewPayout) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payouts (
                policy_id, holder_address, amount, event_id, settlement_ref, block_height, source
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (settlement_ref) DO NOTHING
            "#,
        )
        .bind(payout.policy_id)
        .bind(payout.holder_address.to_lowercase())
        .bind(payout.amount)
        .bind(payout.event_id)
        .bind(&payout.settlement_ref)
        .bind(payout.block_height)
        .bind(payout.source)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn payout_by_settlement_ref(&self, settlement_ref: &str) -> AppResult<Option<Payout>> {
        let payout = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts WHERE settlement_ref = $1",
            PAYOUT_COLUMNS
        ))
        .bind(settlement_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payout)
    }

    async fn recent_payouts(&self, limit: i64) -> AppResult<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts ORDER BY executed_at DESC LIMIT $1",
            PAYOUT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn unlinked_payouts(&self, limit: i64) -> AppResult<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts WHERE policy_id IS NULL ORDER BY executed_at DESC LIMIT $1",
            PAYOUT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    // ========== CHECKPOINT OPERATIONS ==========

    async fn checkpoint(&self, ledger_contract_id: &str) -> AppResult<Option<u64>> {
        let height = sqlx::query_scalar::<_, i64>(
            "SELECT last_synced_height FROM sync_checkpoints WHERE ledger_contract_id = $1",
        )
        .bind(ledger_contract_id.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(height.map(|h| h.max(0) as u64))
    }

    async fn advance_checkpoint(&self, ledger_contract_id: &str, height: u64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (ledger_contract_id, last_synced_height, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (ledger_contract_id) DO UPDATE
            SET last_synced_height = GREATEST(sync_checkpoints.last_synced_height, EXCLUDED.last_synced_height),
                updated_at = NOW()
            "#,
        )
        .bind(ledger_contract_id.to_lowercase())
        .bind(height_to_db(height)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== REPORTING ==========

    async fn stats(&self) -> AppResult<SystemStats> {
        let stats = sqlx::query_as::<_, SystemStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM candles) AS total_candles,
                (SELECT COUNT(*) FROM wick_events) AS total_events,
                (SELECT COUNT(*) FROM policies) AS total_policies,
                (SELECT COUNT(*) FROM policies WHERE status = 'active' AND purchase_time <= NOW() AND expiry_time > NOW()) AS active_policies,
                (SELECT COUNT(*) FROM payouts) AS total_payouts,
                (SELECT COUNT(*) FROM payouts WHERE policy_id IS NULL) AS unlinked_payouts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }
}
