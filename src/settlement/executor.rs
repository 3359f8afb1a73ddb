use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chain::{LedgerClient, SettlementRequest, SettlementSigner};
use crate::error::{AppResult, LedgerError};
use crate::store::models::{NewPayout, PayoutSource, Policy, PolicyStatus, WickEvent};
use crate::store::StateStore;

/// Result of settling one policy for one event
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    /// Confirmed on the ledger. The flags are false when the reconciler got
    /// there first.
    Settled {
        policy_id: Uuid,
        settlement_ref: String,
        payout_recorded: bool,
        policy_claimed: bool,
    },
    /// Included but the ledger reported failure
    Rejected {
        policy_id: Uuid,
        settlement_ref: String,
    },
    /// Never confirmed: signing, submission, timeout or store failure
    Failed { policy_id: Uuid, reason: String },
    /// No longer active when its turn came
    Skipped { policy_id: Uuid, status: PolicyStatus },
}

impl PolicyOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, PolicyOutcome::Settled { .. })
    }
}

/// Pays every eligible policy once per wick event.
///
/// INVARIANTS:
/// - one policy's failure never aborts the rest of the batch
/// - payout insert and policy claim are idempotent, the reconciler may race both
/// - confirmation waits are bounded by `confirmation_timeout`
pub struct SettlementExecutor {
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<SettlementSigner>,
    confirmation_timeout: Duration,
}

impl SettlementExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<SettlementSigner>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            signer,
            confirmation_timeout,
        }
    }

    #[instrument(skip(self, event), fields(event_id = event.id, symbol = %event.symbol))]
    pub async fn execute(&self, event: &WickEvent) -> AppResult<Vec<PolicyOutcome>> {
        // Eligibility is judged at the wick's time, not at processing time
        let policies = self.store.eligible_policies(event.timestamp).await?;
        if policies.is_empty() {
            info!("No eligible policies for wick event {}", event.id);
            return Ok(Vec::new());
        }

        let detection_ref = event.detection_ref();
        info!(
            "💸 Settling {} eligible policies for {}",
            policies.len(),
            detection_ref
        );

        let mut outcomes = Vec::with_capacity(policies.len());
        for policy in &policies {
            let outcome = match self.settle_policy(event, policy, &detection_ref).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        policy_id = %policy.id,
                        ledger_policy_id = policy.ledger_policy_id,
                        transient = e.is_transient(),
                        "❌ Settlement failed: {}",
                        e
                    );
                    PolicyOutcome::Failed {
                        policy_id: policy.id,
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let settled = outcomes.iter().filter(|o| o.is_settled()).count();
        info!(
            "✓ Wick event {} processed: {}/{} policies settled",
            event.id,
            settled,
            outcomes.len()
        );

        Ok(outcomes)
    }

    async fn settle_policy(
        &self,
        event: &WickEvent,
        policy: &Policy,
        detection_ref: &str,
    ) -> AppResult<PolicyOutcome> {
        // The reconciler may have claimed it since the eligible set was read
        if let Some(current) = self.store.get_policy(policy.id).await? {
            if current.status != PolicyStatus::Active {
                debug!("Policy {} is {}, skipping", policy.id, current.status);
                return Ok(PolicyOutcome::Skipped {
                    policy_id: policy.id,
                    status: current.status,
                });
            }
        }

        let request = SettlementRequest {
            holder: policy.holder_address.clone(),
            policy_ref: policy.ledger_policy_id,
            amount: policy.coverage_amount,
            detection_ref: detection_ref.to_string(),
        };

        let settlement_ref = self.signer.submit(self.ledger.as_ref(), &request).await?;

        let confirmation = match tokio::time::timeout(
            self.confirmation_timeout,
            self.ledger
                .wait_for_confirmation(&settlement_ref, self.confirmation_timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(LedgerError::ConfirmationTimeout(settlement_ref).into()),
        };

        if !confirmation.succeeded() {
            warn!(
                policy_id = %policy.id,
                settlement_ref = %settlement_ref,
                "⚠️ Settlement rejected by ledger"
            );
            return Ok(PolicyOutcome::Rejected {
                policy_id: policy.id,
                settlement_ref,
            });
        }

        let payout_recorded = self
            .store
            .insert_payout_if_absent(&NewPayout {
                policy_id: Some(policy.id),
                holder_address: policy.holder_address.clone(),
                amount: policy.coverage_amount,
                event_id: Some(event.id),
                settlement_ref: settlement_ref.clone(),
                block_height: i64::try_from(confirmation.finalized_height).ok(),
                source: PayoutSource::Executor,
            })
            .await?;
        let policy_claimed = self.store.claim_policy(policy.id, &settlement_ref).await?;

        info!(
            "✅ Paid {} to {} for policy {} ({})",
            policy.coverage_amount, policy.holder_address, policy.ledger_policy_id, settlement_ref
        );

        Ok(PolicyOutcome::Settled {
            policy_id: policy.id,
            settlement_ref,
            payout_recorded,
            policy_claimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::NewWickEvent;
    use crate::store::MemoryStore;
    use crate::testing::{candle_at, holder, policy_fixture, purchase_event, ts, ScriptedLedger};
    use rust_decimal_macros::dec;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<ScriptedLedger>,
        executor: SettlementExecutor,
    }

    fn harness(timeout: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(ScriptedLedger::new(1_000));
        let signer = Arc::new(SettlementSigner::from_hex_seed(SEED).unwrap());
        let executor = SettlementExecutor::new(store.clone(), ledger.clone(), signer, timeout);
        Harness {
            store,
            ledger,
            executor,
        }
    }

    async fn add_policy(h: &Harness, ledger_id: i64, owner: &str, expiry_secs: i64) -> Policy {
        let fixture = policy_fixture(
            &format!("0xpurchase{}:0", ledger_id),
            ledger_id,
            owner,
            ts(0),
            ts(expiry_secs),
        );
        h.ledger.push_event(purchase_event(
            ledger_id,
            owner,
            fixture.coverage_amount,
            fixture.expiry_time,
            fixture.purchase_height as u64,
        ));
        h.store.insert_policy_if_absent(&fixture).await.unwrap();
        h.store.find_policy_by_ledger_id(ledger_id).await.unwrap().unwrap()
    }

    async fn wick_at(h: &Harness, secs: i64) -> WickEvent {
        h.store
            .insert_candle(&candle_at("BTCUSDT", ts(secs), dec!(44000), dec!(48000), dec!(39500), dec!(43900)))
            .await
            .unwrap();
        let candle = h.store.latest_candle("BTCUSDT").await.unwrap().unwrap();
        let (event, _) = h
            .store
            .record_wick_event(&NewWickEvent {
                symbol: candle.symbol.clone(),
                timestamp: candle.timestamp,
                candle_id: candle.id,
                body_ratio: dec!(0.0118),
                range_ratio: dec!(0.1936),
            })
            .await
            .unwrap();
        event
    }

    #[tokio::test]
    async fn test_one_rejection_does_not_block_the_other_policy() {
        let h = harness(Duration::from_secs(5));
        let paid = add_policy(&h, 1, &holder(1), 86_400).await;
        let rejected = add_policy(&h, 2, &holder(2), 86_400).await;
        h.ledger.reject_holder(&holder(2));

        let event = wick_at(&h, 60).await;
        let outcomes = h.executor.execute(&event).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|o| o.is_settled()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, PolicyOutcome::Rejected { policy_id, .. } if *policy_id == rejected.id)));

        let payouts = h.store.recent_payouts(10).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].policy_id, Some(paid.id));
        assert_eq!(payouts[0].event_id, Some(event.id));
        assert_eq!(payouts[0].amount, dec!(100));

        let paid_now = h.store.get_policy(paid.id).await.unwrap().unwrap();
        assert_eq!(paid_now.status, PolicyStatus::Claimed);
        assert_eq!(paid_now.settlement_ref.as_deref(), Some(payouts[0].settlement_ref.as_str()));
        let rejected_now = h.store.get_policy(rejected.id).await.unwrap().unwrap();
        assert_eq!(rejected_now.status, PolicyStatus::Active);
    }

    #[tokio::test]
    async fn test_submission_failure_is_isolated() {
        let h = harness(Duration::from_secs(5));
        add_policy(&h, 1, &holder(1), 86_400).await;
        add_policy(&h, 2, &holder(2), 86_400).await;
        h.ledger.fail_submissions_for(&holder(1));

        let event = wick_at(&h, 60).await;
        let outcomes = h.executor.execute(&event).await.unwrap();

        assert!(matches!(outcomes[0], PolicyOutcome::Failed { .. }));
        assert!(outcomes[1].is_settled());
        assert_eq!(h.store.recent_payouts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_carries_detection_reference() {
        let h = harness(Duration::from_secs(5));
        add_policy(&h, 3, &holder(3), 86_400).await;

        let event = wick_at(&h, 60).await;
        h.executor.execute(&event).await.unwrap();

        let submitted = h.ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].policy_ref, 3);
        let calldata = hex::decode(submitted[0].calldata.trim_start_matches("0x")).unwrap();
        let detection_ref = event.detection_ref();
        assert!(calldata
            .windows(detection_ref.len())
            .any(|w| w == detection_ref.as_bytes()));
    }

    #[tokio::test]
    async fn test_eligibility_uses_event_time() {
        let h = harness(Duration::from_secs(5));
        // Expired before the wick
        add_policy(&h, 1, &holder(1), 30).await;
        // Expired by now, but covered the wick
        let covered = add_policy(&h, 2, &holder(2), 120).await;

        let event = wick_at(&h, 60).await;
        let outcomes = h.executor.execute(&event).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], PolicyOutcome::Settled { policy_id, .. } if *policy_id == covered.id));
    }

    #[tokio::test]
    async fn test_policy_bought_after_the_wick_is_not_paid() {
        let h = harness(Duration::from_secs(5));
        let late = policy_fixture("0xpurchase1:0", 1, &holder(1), ts(86_400), ts(172_800));
        h.store.insert_policy_if_absent(&late).await.unwrap();

        // Recorded wick from before the purchase, e.g. a backfilled file
        let event = wick_at(&h, 60).await;
        let outcomes = h.executor.execute(&event).await.unwrap();

        assert!(outcomes.is_empty());
        assert!(h.ledger.submitted().is_empty());
        let policy = h.store.find_policy_by_ledger_id(1).await.unwrap().unwrap();
        assert_eq!(policy.status, PolicyStatus::Active);

        // Bought exactly at the wick counts as covered
        let at_wick = policy_fixture("0xpurchase2:0", 2, &holder(2), ts(120), ts(86_400));
        h.store.insert_policy_if_absent(&at_wick).await.unwrap();
        let later = wick_at(&h, 120).await;
        let outcomes = h.executor.execute(&later).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_settled());
    }

    #[tokio::test]
    async fn test_claimed_policies_are_not_paid_twice() {
        let h = harness(Duration::from_secs(5));
        add_policy(&h, 1, &holder(1), 86_400).await;

        let first = wick_at(&h, 60).await;
        assert_eq!(h.executor.execute(&first).await.unwrap().len(), 1);

        let second = wick_at(&h, 120).await;
        assert!(h.executor.execute(&second).await.unwrap().is_empty());
        assert_eq!(h.ledger.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_policy_claimed_meanwhile_is_skipped() {
        let h = harness(Duration::from_secs(5));
        let stale = add_policy(&h, 1, &holder(1), 86_400).await;
        let event = wick_at(&h, 60).await;

        // Reconciler wins after the eligible set was read
        h.store.claim_policy(stale.id, "0xfromledger").await.unwrap();

        let outcome = h
            .executor
            .settle_policy(&event, &stale, &event.detection_ref())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PolicyOutcome::Skipped {
                policy_id: stale.id,
                status: PolicyStatus::Claimed,
            }
        );
        assert!(h.ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_wait_is_bounded() {
        let h = harness(Duration::from_millis(50));
        let policy = add_policy(&h, 1, &holder(1), 86_400).await;
        h.ledger.hang_confirmations();

        let event = wick_at(&h, 60).await;
        let outcomes = h.executor.execute(&event).await.unwrap();

        assert!(matches!(&outcomes[0], PolicyOutcome::Failed { reason, .. } if reason.contains("Timed out")));
        let still_active = h.store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(still_active.status, PolicyStatus::Active);
        assert!(h.store.recent_payouts(10).await.unwrap().is_empty());
    }
}
