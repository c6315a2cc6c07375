// 8.0 engine/core.rs: main engine. owns the ledger, both books and the latest prices.
// one request in, at most one response out. time is whatever the caller says it is.

use super::config::EngineConfig;
use super::results::{Effects, EngineError, Handled};
use crate::balance::{BalanceLedger, UserBalance};
use crate::events::{EventJournal, EventPayload};
use crate::message::{DepositRequest, EngineRequest, EngineResponse, Envelope};
use crate::order::OrderBook;
use crate::position::PositionBook;
use crate::risk::RiskConfig;
use crate::types::{Price, Quote, Symbol, Timestamp, UserId};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/** 8.1: main engine struct. all state lives here */
#[derive(Debug)]
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) risk: Arc<RiskConfig>,
    pub(super) ledger: BalanceLedger,
    pub(super) positions: PositionBook,
    pub(super) orders: OrderBook,
    pub(super) prices: HashMap<Symbol, Price>,
    pub(super) journal: EventJournal,
    pub(super) current_time: Timestamp,
}

/// Balance as reported to clients, with unrealized pnl at the latest prices.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    #[serde(flatten)]
    pub balance: UserBalance,
    pub unrealized_pnl: Quote,
    pub equity: Quote,
}

impl Engine {
    pub fn new(config: EngineConfig, risk: Arc<RiskConfig>) -> Self {
        Self {
            journal: EventJournal::new(config.max_events),
            config,
            ledger: BalanceLedger::new(),
            positions: PositionBook::new(risk.clone()),
            orders: OrderBook::new(risk.clone()),
            risk,
            prices: HashMap::new(),
            current_time: Timestamp::from_millis(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn risk(&self) -> &RiskConfig {
        &self.risk
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn orders(&self) -> &OrderBook {
        &self.orders
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn latest_price(&self, symbol: &Symbol) -> Option<Price> {
        self.prices.get(symbol).copied()
    }

    pub(super) fn require_price(&self, symbol: &Symbol) -> Result<Price, EngineError> {
        self.latest_price(symbol)
            .ok_or_else(|| EngineError::NoPrice(symbol.clone()))
    }

    pub(super) fn available(&self, user: &UserId) -> Quote {
        self.ledger.balance(user).map_or(Quote::zero(), |b| b.available)
    }

    pub(super) fn record(&mut self, payload: EventPayload) {
        self.journal.record(self.current_time, payload);
    }

    /// 8.2: handle one decoded request at logical time `now`.
    ///
    /// Every request except a price update yields exactly one response, success or error.
    /// Unknown tags are answered with `UNSUPPORTED`.
    pub fn handle(&mut self, envelope: Envelope, now: Timestamp) -> Handled {
        self.current_time = self.current_time.max(now);
        let Envelope { req_id, request } = envelope;
        let kind = request.tag().to_string();
        let mut effects = Effects::default();

        let order_id = match &request {
            EngineRequest::OpenOrder(r) => Some(r.order_id.clone()),
            EngineRequest::CancelOrder(r) => Some(r.order_id.clone()),
            _ => None,
        };

        let outcome = match request {
            EngineRequest::Deposit(r) => self.deposit(r, &mut effects),
            EngineRequest::OpenOrder(r) => self.open_order(r, &mut effects),
            EngineRequest::CancelOrder(r) => self.cancel_order(r, &mut effects),
            EngineRequest::ClosePosition(r) => self.close_position(r, &mut effects),
            EngineRequest::PriceUpdate(r) => {
                if let Err(err) = self.update_price(r, &mut effects) {
                    warn!(req_id = %req_id, error = %err, "price update dropped");
                }
                return Handled {
                    response: None,
                    effects,
                };
            }
            EngineRequest::GetBalance(q) => Ok(self.balance_data(&q.user_id)),
            EngineRequest::GetPositions(q) => Ok(json!(self.positions.user_positions(&q.user_id))),
            EngineRequest::GetOrders(q) => Ok(json!(self.orders.user_orders(&q.user_id))),
            EngineRequest::Unknown { tag } => Err(EngineError::Unsupported(tag)),
        };

        let response = match outcome {
            Ok(data) => EngineResponse::ok(kind, req_id, data),
            Err(err) => {
                debug!(req_id = %req_id, kind = %kind, code = err.code(), error = %err, "request failed");
                EngineResponse::error(kind, req_id, err.code(), err.to_string())
            }
        };

        Handled {
            response: Some(match order_id {
                Some(id) => response.with_order_id(id),
                None => response,
            }),
            effects,
        }
    }

    pub(super) fn deposit(&mut self, req: DepositRequest, effects: &mut Effects) -> Result<Value, EngineError> {
        if self.risk.deposit_too_large(req.amount) {
            return Err(EngineError::Validation(format!(
                "Deposit {} exceeds limit {}",
                req.amount, self.risk.max_deposit
            )));
        }
        let balance = self.ledger.deposit(&req.user_id, req.amount, self.current_time)?.clone();
        self.record(EventPayload::Deposit {
            user_id: req.user_id.clone(),
            amount: req.amount,
            available: balance.available,
        });
        effects.touch(&req.user_id);
        Ok(json!(balance))
    }

    /// Balance plus unrealized pnl of open positions. Unknown users read as zero.
    pub fn balance_view(&self, user: &UserId) -> BalanceView {
        let balance = self.ledger.balance(user).cloned().unwrap_or_else(|| UserBalance {
            user_id: user.clone(),
            available: Quote::zero(),
            locked: Quote::zero(),
            total: Quote::zero(),
            last_updated: Timestamp::from_millis(0),
        });

        let unrealized_pnl: Quote = self
            .positions
            .user_positions(user)
            .into_iter()
            .filter(|p| p.is_open())
            .filter_map(|p| self.latest_price(&p.symbol).map(|price| p.unrealized_pnl(price)))
            .sum();

        BalanceView {
            equity: balance.available.add(balance.locked).add(unrealized_pnl),
            balance,
            unrealized_pnl,
        }
    }

    fn balance_data(&self, user: &UserId) -> Value {
        json!(self.balance_view(user))
    }
}
