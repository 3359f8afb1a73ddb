use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::wick::WickDetector;
use crate::error::AppResult;
use crate::settlement::{PolicyOutcome, SettlementExecutor};
use crate::store::models::WickEvent;
use crate::store::StateStore;

/// Streaming detection loop.
///
/// Wakes on the poll interval or when the feed signals a new candle, evaluates
/// every candle past its cursor and settles newly detected wicks inline. The
/// settlement wait blocks only this loop.
pub struct DetectionMonitor {
    detector: Arc<WickDetector>,
    store: Arc<dyn StateStore>,
    executor: Option<Arc<SettlementExecutor>>,
    new_candles: Arc<Notify>,
    poll_interval: Duration,
    batch_limit: i64,
}

impl DetectionMonitor {
    pub fn new(
        detector: Arc<WickDetector>,
        store: Arc<dyn StateStore>,
        executor: Option<Arc<SettlementExecutor>>,
        new_candles: Arc<Notify>,
        poll_interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            detector,
            store,
            executor,
            new_candles,
            poll_interval,
            batch_limit: batch_limit.max(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let symbol = self.detector.symbol().to_string();
        // Candles after the last detected one are re-evaluated, which is harmless
        let mut cursor = self.store.latest_detected_candle_id(&symbol).await?;

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "🔍 Wick detector started for {} (cursor {}, every {}s)",
            symbol,
            cursor,
            self.poll_interval.as_secs()
        );

        loop {
            let wake = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    false
                }
                _ = ticker.tick() => true,
                _ = self.new_candles.notified() => true,
            };

            if wake {
                if let Err(e) = self.tick(&mut cursor).await {
                    error!(cursor, "❌ Detection tick failed: {}", e);
                }
            }
        }

        info!("Wick detector stopping at cursor {}", cursor);
        Ok(())
    }

    /// Evaluate stored candles past `cursor` in batches. The cursor moves past a
    /// candle only once its evaluation succeeded. Returns the number of newly
    /// detected wicks.
    pub async fn tick(&self, cursor: &mut i64) -> AppResult<usize> {
        let mut newly_detected = 0;

        loop {
            let candles = self
                .store
                .candles_after(self.detector.symbol(), *cursor, self.batch_limit)
                .await?;
            let fetched = candles.len();

            for candle in &candles {
                if let Some(detection) = self.detector.evaluate(candle).await? {
                    if detection.newly_detected {
                        newly_detected += 1;
                        self.settle(&detection.event).await;
                    }
                }
                *cursor = candle.id;
            }

            if (fetched as i64) < self.batch_limit {
                break;
            }
        }

        if newly_detected > 0 {
            debug!(cursor = *cursor, newly_detected, "Detection tick done");
        }
        Ok(newly_detected)
    }

    async fn settle(&self, event: &WickEvent) {
        let Some(executor) = &self.executor else {
            return;
        };

        match executor.execute(event).await {
            Ok(outcomes) => {
                let failed = outcomes
                    .iter()
                    .filter(|o| matches!(o, PolicyOutcome::Failed { .. }))
                    .count();
                if failed > 0 {
                    warn!(event_id = event.id, failed, "Some settlements did not complete");
                }
            }
            // Not retried for this event
            Err(e) => error!(event_id = event.id, "❌ Settlement run failed: {}", e),
        }
    }
}
