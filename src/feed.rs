use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::store::models::NewCandle;
use crate::store::StateStore;

/// Counts from ingesting a batch of candles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Entry point for candles produced in-process. Every stored candle wakes the
/// detection loop.
pub struct CandleFeed {
    store: Arc<dyn StateStore>,
    new_candles: Arc<Notify>,
}

impl CandleFeed {
    pub fn new(store: Arc<dyn StateStore>, new_candles: Arc<Notify>) -> Self {
        Self { store, new_candles }
    }

    pub async fn ingest(&self, candle: &NewCandle) -> AppResult<bool> {
        let inserted = self.store.insert_candle(candle).await?;
        if inserted {
            self.new_candles.notify_one();
        }
        Ok(inserted)
    }

    pub async fn ingest_all(&self, candles: &[NewCandle]) -> AppResult<IngestReport> {
        let mut report = IngestReport::default();
        for candle in candles {
            if self.ingest(candle).await? {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }
        info!(
            "📥 Ingested {} candles ({} already stored)",
            report.inserted, report.duplicates
        );
        Ok(report)
    }
}

/// Parse a recorded candle file: one JSON candle per line, blank lines ignored.
/// Candles for other symbols are dropped. Result is ordered by timestamp.
pub fn parse_replay(contents: &str, symbol: &str) -> anyhow::Result<Vec<NewCandle>> {
    let mut candles = Vec::new();
    let mut other_symbols = 0usize;

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let candle: NewCandle = serde_json::from_str(line)
            .with_context(|| format!("invalid candle on line {}", index + 1))?;
        if candle.symbol != symbol {
            other_symbols += 1;
            continue;
        }
        candles.push(candle);
    }

    if other_symbols > 0 {
        warn!("Skipped {} candles for symbols other than {}", other_symbols, symbol);
    }

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

pub async fn load_replay_file(path: &Path, symbol: &str) -> anyhow::Result<Vec<NewCandle>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read replay file {}", path.display()))?;
    parse_replay(&contents, symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::ts;
    use rust_decimal_macros::dec;

    const RECORDED: &str = r#"
{"symbol":"BTCUSDT","timestamp":"2024-01-01T00:01:00Z","open":44000,"high":48000,"low":39500,"close":43900,"volume":12.5}

{"symbol":"BTCUSDT","timestamp":"2024-01-01T00:00:00Z","open":45000,"high":45200,"low":40400,"close":40500}
{"symbol":"ETHUSDT","timestamp":"2024-01-01T00:00:00Z","open":2300,"high":2310,"low":2290,"close":2301}
"#;

    #[test]
    fn test_parse_replay_orders_and_filters() {
        let candles = parse_replay(RECORDED, "BTCUSDT").unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, ts(0));
        assert_eq!(candles[0].volume, dec!(0));
        assert_eq!(candles[1].high, dec!(48000));
        assert_eq!(candles[1].volume, dec!(12.5));
    }

    #[test]
    fn test_parse_replay_reports_bad_line() {
        let err = parse_replay("{\"symbol\":\"BTCUSDT\"}\n", "BTCUSDT").unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
    }

    #[tokio::test]
    async fn test_ingest_notifies_only_for_new_candles() {
        let store = Arc::new(MemoryStore::new());
        let notify = Arc::new(Notify::new());
        let feed = CandleFeed::new(store.clone(), notify.clone());
        let candles = parse_replay(RECORDED, "BTCUSDT").unwrap();

        let first = feed.ingest_all(&candles).await.unwrap();
        assert_eq!(first, IngestReport { inserted: 2, duplicates: 0 });
        // A stored permit makes this resolve immediately
        tokio::time::timeout(std::time::Duration::from_millis(100), notify.notified())
            .await
            .unwrap();

        let second = feed.ingest_all(&candles).await.unwrap();
        assert_eq!(second, IngestReport { inserted: 0, duplicates: 2 });
        assert_eq!(store.stats().await.unwrap().total_candles, 2);
    }
}
