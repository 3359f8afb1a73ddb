use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::AppResult;
use crate::store::models::{Candle, NewWickEvent, WickEvent};
use crate::store::StateStore;

/// Ratios of a qualifying candle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WickMetrics {
    pub body_ratio: Decimal,
    pub range_ratio: Decimal,
}

/// Large range, small body. Direction does not matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WickRule {
    /// Upper bound (inclusive) on |close - open| / (high - low)
    pub body_ratio_max: Decimal,
    /// Lower bound (inclusive) on (high - low) / close
    pub range_threshold: Decimal,
}

impl Default for WickRule {
    fn default() -> Self {
        Self {
            body_ratio_max: dec!(0.30),
            range_threshold: dec!(0.10),
        }
    }
}

impl WickRule {
    pub fn new(body_ratio_max: Decimal, range_threshold: Decimal) -> Self {
        Self {
            body_ratio_max,
            range_threshold,
        }
    }

    /// `None` for non-qualifying and malformed candles alike
    pub fn classify(
        &self,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Option<WickMetrics> {
        let range = high - low;
        if range <= Decimal::ZERO || close <= Decimal::ZERO {
            return None;
        }

        let body = (close - open).abs();
        let body_ratio = body.checked_div(range)?;
        let range_ratio = range.checked_div(close)?;

        (body_ratio <= self.body_ratio_max && range_ratio >= self.range_threshold).then_some(
            WickMetrics {
                body_ratio,
                range_ratio,
            },
        )
    }
}

/// Outcome of evaluating one candle
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub event: WickEvent,
    /// False when the candle already had an event
    pub newly_detected: bool,
}

pub struct WickDetector {
    store: Arc<dyn StateStore>,
    rule: WickRule,
    symbol: String,
}

impl WickDetector {
    pub fn new(store: Arc<dyn StateStore>, rule: WickRule, symbol: &str) -> Self {
        Self {
            store,
            rule,
            symbol: symbol.to_string(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Classify a stored candle and persist the event if it qualifies.
    ///
    /// Persisting is what makes a wick "detected": a candle already linked to
    /// an event comes back with `newly_detected = false`.
    pub async fn evaluate(&self, candle: &Candle) -> AppResult<Option<Detection>> {
        let Some(metrics) = self
            .rule
            .classify(candle.open, candle.high, candle.low, candle.close)
        else {
            return Ok(None);
        };

        let (event, newly_detected) = self
            .store
            .record_wick_event(&NewWickEvent {
                symbol: candle.symbol.clone(),
                timestamp: candle.timestamp,
                candle_id: candle.id,
                body_ratio: metrics.body_ratio,
                range_ratio: metrics.range_ratio,
            })
            .await?;

        if newly_detected {
            info!(
                "🕯️ Wick detected on {} at {}: body ratio {:.4}, range ratio {:.4}",
                candle.symbol,
                candle.timestamp,
                metrics.body_ratio,
                metrics.range_ratio
            );
        } else {
            debug!(candle_id = candle.id, event_id = event.id, "Candle already detected");
        }

        Ok(Some(Detection {
            event,
            newly_detected,
        }))
    }

    /// Evaluate every stored candle in `[start, end]`, oldest first.
    /// Returns existing and new detections.
    pub async fn detect_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Detection>> {
        let candles = self.store.candles_between(&self.symbol, start, end).await?;
        let mut detections = Vec::new();

        for candle in &candles {
            if let Some(detection) = self.evaluate(candle).await? {
                detections.push(detection);
            }
        }

        info!(
            "📊 Scanned {} candles for {}: {} wick events",
            candles.len(),
            self.symbol,
            detections.len()
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{candle_at, ts};

    fn detector() -> (Arc<MemoryStore>, WickDetector) {
        let store = Arc::new(MemoryStore::new());
        let detector = WickDetector::new(store.clone(), WickRule::default(), "BTCUSDT");
        (store, detector)
    }

    #[test]
    fn test_trending_move_is_not_a_wick() {
        // 10% drop, but the body is most of the range
        let rule = WickRule::default();
        assert_eq!(
            rule.classify(dec!(45000), dec!(45200), dec!(40400), dec!(40500)),
            None
        );
    }

    #[test]
    fn test_long_wick_qualifies() {
        let rule = WickRule::default();
        let metrics = rule
            .classify(dec!(44000), dec!(48000), dec!(39500), dec!(43900))
            .unwrap();

        assert!(metrics.body_ratio < dec!(0.012) && metrics.body_ratio > dec!(0.011));
        assert!(metrics.range_ratio > dec!(0.19) && metrics.range_ratio < dec!(0.2));
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let rule = WickRule::default();

        // body 3, range 10, close 100 -> body ratio 0.30, range ratio 0.10
        let metrics = rule
            .classify(dec!(97), dec!(105), dec!(95), dec!(100))
            .unwrap();
        assert_eq!(metrics.body_ratio, dec!(0.3));
        assert_eq!(metrics.range_ratio, dec!(0.1));

        // Just past either bound
        assert!(rule.classify(dec!(96.99), dec!(105), dec!(95), dec!(100)).is_none());
        assert!(rule.classify(dec!(98), dec!(104.99), dec!(95), dec!(100)).is_none());
    }

    #[test]
    fn test_malformed_candles_do_not_qualify() {
        let rule = WickRule::default();
        // Zero range
        assert!(rule.classify(dec!(100), dec!(100), dec!(100), dec!(100)).is_none());
        // Inverted high/low
        assert!(rule.classify(dec!(100), dec!(90), dec!(110), dec!(100)).is_none());
        // Non-positive close
        assert!(rule.classify(dec!(1), dec!(2), dec!(-20), dec!(0)).is_none());
    }

    #[tokio::test]
    async fn test_evaluate_is_idempotent_per_candle() {
        let (store, detector) = detector();
        store
            .insert_candle(&candle_at("BTCUSDT", ts(60), dec!(44000), dec!(48000), dec!(39500), dec!(43900)))
            .await
            .unwrap();
        let candle = store.latest_candle("BTCUSDT").await.unwrap().unwrap();

        let first = detector.evaluate(&candle).await.unwrap().unwrap();
        assert!(first.newly_detected);

        for _ in 0..3 {
            let again = detector.evaluate(&candle).await.unwrap().unwrap();
            assert!(!again.newly_detected);
            assert_eq!(again.event.id, first.event.id);
        }

        assert_eq!(store.stats().await.unwrap().total_events, 1);
    }

    #[tokio::test]
    async fn test_detect_range_reports_existing_and_new() {
        let (store, detector) = detector();
        let candles = [
            candle_at("BTCUSDT", ts(0), dec!(45000), dec!(45200), dec!(40400), dec!(40500)),
            candle_at("BTCUSDT", ts(60), dec!(44000), dec!(48000), dec!(39500), dec!(43900)),
            candle_at("BTCUSDT", ts(120), dec!(43900), dec!(44000), dec!(43800), dec!(43950)),
            candle_at("BTCUSDT", ts(180), dec!(97), dec!(105), dec!(95), dec!(100)),
        ];
        for candle in &candles {
            store.insert_candle(candle).await.unwrap();
        }

        let first_pass = detector.detect_range(ts(0), ts(180)).await.unwrap();
        assert_eq!(first_pass.len(), 2);
        assert!(first_pass.iter().all(|d| d.newly_detected));
        assert_eq!(first_pass[0].event.timestamp, ts(60));

        let second_pass = detector.detect_range(ts(0), ts(180)).await.unwrap();
        assert_eq!(second_pass.len(), 2);
        assert!(second_pass.iter().all(|d| !d.newly_detected));

        let partial = detector.detect_range(ts(100), ts(200)).await.unwrap();
        assert_eq!(partial.len(), 1);
    }
}
