// margin-engine: leveraged trading against a reference price.
// single-writer ledgers fed by a durable request log, answered on a response log.
// the engine core is deterministic: replaying the log rebuilds the same state.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, Side, Price, Size, Quote, Leverage
//   2.x  order.rs: order lifecycle, pre-trade validation, limit reserves
//   3.x  balance.rs: available / locked / total per user, margin lock and release
//   4.x  position.rs: position struct, pnl, liquidation price, open/close
//   6.3  risk.rs: leverage and size limits, maintenance margin rate
//   7.x  config.rs: stream names, timings, cache retention, risk params
//   8.x  engine/: request handling, fills, closes, liquidation sweep, replay
//   11.x events.rs: state transition events for audit
//   12.x broker/: durable log + side cache seams, in-memory broker
//   13.x message.rs: wire codec for request and response entries
//   14.x dispatcher.rs: consumer-group reader driving the engine
//   15.x correlator.rs: reqId correlation for callers, engine client

// core trading modules
pub mod balance;
pub mod engine;
pub mod events;
pub mod order;
pub mod position;
pub mod types;

// risk and safety modules
pub mod risk;

// integration modules
pub mod broker;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod message;

// re exports for convenience
pub use balance::*;
pub use broker::*;
pub use config::*;
pub use correlator::*;
pub use dispatcher::*;
pub use engine::*;
pub use events::*;
pub use message::*;
pub use order::*;
pub use position::*;
pub use risk::*;
pub use types::*;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,margin_engine=debug"));
    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
