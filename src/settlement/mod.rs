// Settlement side of the pipeline: paying policies and reconciling with the ledger
pub mod executor;
pub mod reconciler;
pub mod scheduler;

pub use executor::{PolicyOutcome, SettlementExecutor};
pub use reconciler::LedgerReconciler;
