// Background loops for the settlement side
//
// - Reconciler: fixed interval, coarser than detection
// - Expiry sweep: optional, flips lapsed active policies to expired
//
// Both stop on the shutdown signal between ticks. A tick that is already
// running always finishes; once shutdown is signalled no new tick starts.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::settlement::reconciler::LedgerReconciler;
use crate::store::StateStore;

/// Run `reconciler.poll()` every `period` until shutdown.
pub async fn run_reconciler(
    reconciler: Arc<LedgerReconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("🔁 Ledger reconciler started (every {}s)", period.as_secs());

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Ledger reconciler stopping");
                    break;
                }
            }
            _ = ticker.tick() => {
                match reconciler.poll().await {
                    Ok(report) if report.advanced => {
                        debug!(
                            to_height = report.to_height,
                            purchases = report.purchases,
                            settlements = report.settlements,
                            "Reconciler tick committed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(transient = e.is_transient(), "❌ Reconciler tick failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Expire active policies whose coverage ended more than `grace` ago.
pub async fn run_expiry_sweep(
    store: Arc<dyn StateStore>,
    period: Duration,
    grace: ChronoDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "🧹 Expiry sweep started (every {}s, grace {}s)",
        period.as_secs(),
        grace.num_seconds()
    );

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Expiry sweep stopping");
                    break;
                }
            }
            _ = ticker.tick() => {
                let cutoff = Utc::now() - grace;
                match store.expire_lapsed_policies(cutoff).await {
                    Ok(0) => {}
                    Ok(expired) => info!("⏰ Expired {} lapsed policies", expired),
                    Err(e) => error!("❌ Expiry sweep failed: {}", e),
                }
            }
        }
    }
}
