// 8.0: core engine. owns the balance ledger, position book and order book, turns
// decoded requests into state changes and responses, and sweeps liquidations on
// every price update. deterministic and single-writer with no I/O of its own.

mod config;
mod core;
mod liquidations;
mod orders;
mod positions;
mod pricing;
mod replay;
mod results;

pub use config::EngineConfig;
pub use self::core::{BalanceView, Engine};
pub use replay::{entry_time, RebuildSummary};
pub use results::{Effects, EngineError, Handled, LiquidationResult, PriceUpdateResult};
