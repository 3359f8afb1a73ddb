use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Replay,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,

    pub ledger_rpc_url: String,
    pub ledger_relayer_url: Option<String>,
    pub ledger_contract_address: Option<String>,
    pub signer_key: Option<String>,
    pub token_decimals: u32,

    pub symbol: String,
    pub body_ratio_max: String,
    pub range_threshold: String,
    pub detector_poll_secs: u64,
    pub detector_batch_limit: i64,

    pub reconciler_poll_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_millis: u64,
    pub lookback_blocks: u64,
    pub log_chunk_size: u64,

    pub expiry_sweep_secs: u64,
    pub expiry_grace_secs: u64,

    pub run_mode: RunMode,
    pub replay_file: Option<String>,
    pub replay_settle: bool,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/wickguard")?
            .set_default("database_max_connections", 10)?
            .set_default("ledger_rpc_url", "http://127.0.0.1:8545")?
            .set_default("token_decimals", 6)?
            .set_default("symbol", "BTCUSDT")?
            .set_default("body_ratio_max", "0.30")?
            .set_default("range_threshold", "0.10")?
            .set_default("detector_poll_secs", 5)?
            .set_default("detector_batch_limit", 500)?
            .set_default("reconciler_poll_secs", 15)?
            .set_default("confirmation_timeout_secs", 300)?
            .set_default("receipt_poll_millis", 1000)?
            .set_default("lookback_blocks", 1000)?
            .set_default("log_chunk_size", 1000)?
            .set_default("expiry_sweep_secs", 0)?
            .set_default("expiry_grace_secs", 3600)?
            .set_default("run_mode", "live")?
            .set_default("replay_settle", false)?
            .add_source(config::Environment::default())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.log_chunk_size == 0 {
            return Err(AppError::Config("LOG_CHUNK_SIZE must be positive".to_string()));
        }
        if self.detector_batch_limit <= 0 {
            return Err(AppError::Config("DETECTOR_BATCH_LIMIT must be positive".to_string()));
        }
        self.body_ratio_max()?;
        self.range_threshold()?;

        if self.run_mode == RunMode::Replay && self.replay_file.is_none() {
            return Err(AppError::Config("REPLAY_FILE must be set in replay mode".to_string()));
        }

        if self.run_mode == RunMode::Live {
            if self.ledger_contract_address.is_none() {
                return Err(AppError::Config("LEDGER_CONTRACT_ADDRESS must be set".to_string()));
            }
            if self.signer_key.is_none() {
                return Err(AppError::Config("SIGNER_KEY must be set".to_string()));
            }
        }
        Ok(())
    }

    /// Thresholds stay strings in the environment so boundary values parse exactly.
    pub fn body_ratio_max(&self) -> AppResult<Decimal> {
        parse_ratio("BODY_RATIO_MAX", &self.body_ratio_max)
    }

    pub fn range_threshold(&self) -> AppResult<Decimal> {
        parse_ratio("RANGE_THRESHOLD", &self.range_threshold)
    }

    pub fn relayer_url(&self) -> &str {
        self.ledger_relayer_url
            .as_deref()
            .unwrap_or(&self.ledger_rpc_url)
    }

    pub fn detector_poll_interval(&self) -> Duration {
        Duration::from_secs(self.detector_poll_secs.max(1))
    }

    pub fn reconciler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler_poll_secs.max(1))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_millis.max(50))
    }

    /// `None` when the sweep is disabled.
    pub fn expiry_sweep_interval(&self) -> Option<Duration> {
        (self.expiry_sweep_secs > 0).then(|| Duration::from_secs(self.expiry_sweep_secs))
    }

    pub fn expiry_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_grace_secs as i64)
    }
}

fn parse_ratio(name: &str, raw: &str) -> AppResult<Decimal> {
    let value = Decimal::from_str(raw.trim())
        .map_err(|e| AppError::Config(format!("{} is not a decimal ({}): {}", name, raw, e)))?;
    if value <= Decimal::ZERO {
        return Err(AppError::Config(format!("{} must be positive, got {}", name, value)));
    }
    Ok(value)
}
