use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::Notify;
use tracing::{info, warn, debug};
use crate::{
    chain::{LedgerClient, RpcLedgerClient, SettlementSigner},
    config::{Config, RunMode},
    detector::{WickDetector, WickRule},
    error::{AppError, AppResult},
    feed::CandleFeed,
    settlement::{LedgerReconciler, SettlementExecutor},
    store::{MemoryStore, PgStore, StateStore},
};

/// DATABASE_URL value that selects the in-process store
pub const MEMORY_STORE_URL: &str = "memory://";

/// Everything the run modes need, wired once at startup
pub struct Pipeline {
    pub store: Arc<dyn StateStore>,
    pub detector: Arc<WickDetector>,
    pub feed: Arc<CandleFeed>,
    pub new_candles: Arc<Notify>,
    pub executor: Option<Arc<SettlementExecutor>>,
    pub reconciler: Option<Arc<LedgerReconciler>>,
}

pub async fn initialize_pipeline(config: &Config) -> AppResult<Pipeline> {
    info!("Initializing pipeline components ...");

    let store = initialize_store(config).await?;

    let rule = WickRule::new(config.body_ratio_max()?, config.range_threshold()?);
    info!(
        "✅ Wick rule: body ratio <= {}, range ratio >= {}",
        rule.body_ratio_max, rule.range_threshold
    );
    let detector = Arc::new(WickDetector::new(store.clone(), rule, &config.symbol));

    let new_candles = Arc::new(Notify::new());
    let feed = Arc::new(CandleFeed::new(store.clone(), new_candles.clone()));

    let settles = match config.run_mode {
        RunMode::Live => true,
        RunMode::Replay => config.replay_settle,
    };

    let (executor, reconciler) = if settles {
        let ledger = initialize_ledger(config)?;
        let signer = initialize_signer(config)?;

        let executor = Arc::new(SettlementExecutor::new(
            store.clone(),
            ledger.clone(),
            signer,
            config.confirmation_timeout(),
        ));
        let reconciler = Arc::new(LedgerReconciler::new(
            store.clone(),
            ledger,
            config.lookback_blocks,
            config.log_chunk_size,
        ));
        info!("✅ Settlement executor and ledger reconciler ready");
        (Some(executor), Some(reconciler))
    } else {
        warn!("⚠️  Settlement disabled - detections are recorded only");
        (None, None)
    };

    Ok(Pipeline {
        store,
        detector,
        feed,
        new_candles,
        executor,
        reconciler,
    })
}

async fn initialize_store(config: &Config) -> AppResult<Arc<dyn StateStore>> {
    if config.database_url == MEMORY_STORE_URL {
        if config.run_mode == RunMode::Live {
            return Err(AppError::Config(
                "The in-memory store is only available in replay mode".to_string(),
            ));
        }
        info!("📊 Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let pool = initialize_database(&config.database_url, config.database_max_connections).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

fn initialize_ledger(config: &Config) -> AppResult<Arc<dyn LedgerClient>> {
    let contract = config
        .ledger_contract_address
        .as_deref()
        .ok_or_else(|| AppError::Config("LEDGER_CONTRACT_ADDRESS must be set".to_string()))?;

    let client = RpcLedgerClient::new(
        &config.ledger_rpc_url,
        config.relayer_url(),
        contract,
        config.token_decimals,
        config.receipt_poll_interval(),
    )?;

    info!("⛓️  Ledger client for contract {} via {}", contract, config.ledger_rpc_url);
    Ok(Arc::new(client))
}

fn initialize_signer(config: &Config) -> AppResult<Arc<SettlementSigner>> {
    let key = config
        .signer_key
        .as_deref()
        .ok_or_else(|| AppError::Config("SIGNER_KEY must be set".to_string()))?;

    let signer = SettlementSigner::from_hex_seed(key)?;
    info!("🔑 Settlement signer {}", signer.public_key());
    Ok(Arc::new(signer))
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

/// Log a summary of local state
pub async fn report_state(store: &dyn StateStore, symbol: &str) -> AppResult<()> {
    let stats = store.stats().await?;
    info!(
        "📈 {} candles, {} wick events, {} policies ({} active), {} payouts ({} unlinked)",
        stats.total_candles,
        stats.total_events,
        stats.total_policies,
        stats.active_policies,
        stats.total_payouts,
        stats.unlinked_payouts
    );

    if let Some(candle) = store.latest_candle(symbol).await? {
        info!("Latest {} candle at {} closed {}", symbol, candle.timestamp, candle.close);
    }
    for candle in store.recent_candles(symbol, 5).await? {
        debug!(id = candle.id, ts = %candle.timestamp, close = %candle.close, "Recent candle");
    }
    for event in store.recent_wick_events(5).await? {
        debug!(
            id = event.id,
            ts = %event.timestamp,
            body_ratio = %event.body_ratio,
            range_ratio = %event.range_ratio,
            "Recent wick event"
        );
    }
    for payout in store.recent_payouts(5).await? {
        debug!(
            settlement_ref = %payout.settlement_ref,
            amount = %payout.amount,
            holder = %payout.holder_address,
            "Recent payout"
        );
    }
    for payout in store.unlinked_payouts(20).await? {
        warn!(
            settlement_ref = %payout.settlement_ref,
            holder = %payout.holder_address,
            "Payout has no local policy"
        );
    }

    Ok(())
}
