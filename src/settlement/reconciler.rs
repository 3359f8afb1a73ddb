use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{LedgerClient, LedgerEvent, LedgerEventKind};
use crate::error::{AppError, AppResult};
use crate::store::models::{NewPayout, NewPolicy, PayoutSource};
use crate::store::StateStore;

/// What one `poll` covered. The range is `(from_height, to_height]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub from_height: u64,
    pub to_height: u64,
    pub purchases: usize,
    pub settlements: usize,
    pub failed_entries: usize,
    pub skipped_entries: usize,
    /// Checkpoint moved to `to_height`
    pub advanced: bool,
}

enum Merged {
    Purchase,
    Settlement,
    Skipped,
}

/// Mirrors purchase and settlement logs into the local store.
///
/// INVARIANTS:
/// - every merge is insert-or-ignore or compare-and-set, so refetching a range is harmless
/// - the checkpoint is the commit point: it advances only after the whole range merged cleanly
pub struct LedgerReconciler {
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn LedgerClient>,
    lookback_blocks: u64,
    chunk_size: u64,
}

impl LedgerReconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn LedgerClient>,
        lookback_blocks: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            lookback_blocks,
            chunk_size: chunk_size.max(1),
        }
    }

    #[instrument(skip(self), fields(contract = %self.ledger.contract_id()))]
    pub async fn poll(&self) -> AppResult<SyncReport> {
        let contract = self.ledger.contract_id().to_string();
        let current = self.ledger.current_height().await?;

        let last_synced = match self.store.checkpoint(&contract).await? {
            Some(height) => height,
            None => {
                // Persist the seed first so a failing first tick retries the same window
                let seed = current.saturating_sub(self.lookback_blocks);
                self.store.advance_checkpoint(&contract, seed).await?;
                info!("🌱 Seeded checkpoint for {} at block {}", contract, seed);
                seed
            }
        };

        if current <= last_synced {
            debug!(current, last_synced, "Ledger has no new blocks");
            return Ok(SyncReport {
                from_height: last_synced,
                to_height: last_synced,
                ..Default::default()
            });
        }

        let mut report = self.merge_range(last_synced + 1, current).await?;
        report.from_height = last_synced;

        if report.failed_entries > 0 {
            warn!(
                "⚠️ {} entries failed in blocks {}..={}, checkpoint stays at {}",
                report.failed_entries,
                last_synced + 1,
                current,
                last_synced
            );
            return Ok(report);
        }

        self.store.advance_checkpoint(&contract, current).await?;
        report.advanced = true;

        info!(
            "🔄 Synced blocks {}..={}: {} purchases, {} settlements",
            last_synced + 1,
            current,
            report.purchases,
            report.settlements
        );
        Ok(report)
    }

    /// Fetch and merge `[from_height, to_height]` in chunks. Does not touch the
    /// checkpoint. A chunk fetch failure aborts with an error; per-entry
    /// failures are counted and the rest of the range is still merged.
    pub async fn merge_range(&self, from_height: u64, to_height: u64) -> AppResult<SyncReport> {
        let mut report = SyncReport {
            from_height: from_height.saturating_sub(1),
            to_height,
            ..Default::default()
        };

        let mut chunk_start = from_height;
        while chunk_start <= to_height {
            let chunk_end = chunk_start
                .saturating_add(self.chunk_size - 1)
                .min(to_height);

            let events = self.ledger.fetch_events(chunk_start, chunk_end).await?;
            debug!(chunk_start, chunk_end, events = events.len(), "Merging chunk");

            for event in &events {
                match self.merge_event(event).await {
                    Ok(Merged::Purchase) => report.purchases += 1,
                    Ok(Merged::Settlement) => report.settlements += 1,
                    Ok(Merged::Skipped) => report.skipped_entries += 1,
                    Err(e) => {
                        error!(
                            tx = %event.tx_ref,
                            block = event.block_height,
                            "❌ Failed to merge ledger event: {}",
                            e
                        );
                        report.failed_entries += 1;
                    }
                }
            }

            if chunk_end == u64::MAX {
                break;
            }
            chunk_start = chunk_end + 1;
        }

        Ok(report)
    }

    async fn merge_event(&self, event: &LedgerEvent) -> AppResult<Merged> {
        match &event.kind {
            LedgerEventKind::Purchase {
                premium,
                expiry_time,
            } => {
                let Some(ledger_policy_id) = event.policy_ref else {
                    warn!(tx = %event.tx_ref, "Purchase log without policy id, skipping");
                    return Ok(Merged::Skipped);
                };

                let created = self
                    .store
                    .insert_policy_if_absent(&NewPolicy {
                        purchase_ref: event.purchase_ref(),
                        ledger_policy_id,
                        holder_address: event.holder.clone(),
                        premium: *premium,
                        coverage_amount: event.amount,
                        // No block time known: coverage starts when it was observed
                        purchase_time: event.block_time.unwrap_or_else(Utc::now),
                        expiry_time: *expiry_time,
                        purchase_height: i64::try_from(event.block_height).map_err(|_| {
                            AppError::InvalidInput(format!("Block height {} out of range", event.block_height))
                        })?,
                    })
                    .await?;

                if created {
                    info!(
                        "📝 Policy {} purchased by {}: coverage {}",
                        ledger_policy_id, event.holder, event.amount
                    );
                }
                Ok(Merged::Purchase)
            }
            LedgerEventKind::Settlement => {
                self.merge_settlement(event).await?;
                Ok(Merged::Settlement)
            }
        }
    }

    async fn merge_settlement(&self, event: &LedgerEvent) -> AppResult<()> {
        // A direct policy reference wins. Without one, the most recent active
        // policy of the holder is assumed, which can mis-link overlapping policies.
        let policy = match event.policy_ref {
            Some(ledger_policy_id) => self.store.find_policy_by_ledger_id(ledger_policy_id).await?,
            None => self.store.latest_active_policy_for_holder(&event.holder).await?,
        };

        let recorded = self
            .store
            .insert_payout_if_absent(&NewPayout {
                policy_id: policy.as_ref().map(|p| p.id),
                holder_address: event.holder.clone(),
                amount: event.amount,
                event_id: None,
                settlement_ref: event.tx_ref.clone(),
                block_height: i64::try_from(event.block_height).ok(),
                source: PayoutSource::Reconciler,
            })
            .await?;

        match policy {
            Some(policy) => {
                let claimed = self.store.claim_policy(policy.id, &event.tx_ref).await?;
                if recorded || claimed {
                    info!(
                        "💰 Settlement {} observed for policy {} (payout recorded: {}, claimed: {})",
                        event.tx_ref, policy.ledger_policy_id, recorded, claimed
                    );
                }
            }
            None => {
                warn!(
                    tx = %event.tx_ref,
                    holder = %event.holder,
                    policy_ref = ?event.policy_ref,
                    "Settlement does not match any local policy, payout left unlinked"
                );
            }
        }

        Ok(())
    }
}
