//! Order lifecycle and pre-trade validation.
//!
//! Orders execute against an externally supplied reference price, never against other
//! users' orders. Status moves `pending → filled | cancelled | rejected`; all three are
//! terminal. Pending limit orders hold a margin reserve in the ledger until they fill
//! or are cancelled.

use crate::balance::{BalanceLedger, LedgerError};
use crate::position::{Position, PositionBook, PositionError};
use crate::risk::RiskConfig;
use crate::types::{Leverage, OrderId, Price, Quote, Side, Size, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Executes immediately at the latest reference price.
    Market,
    /// Rests until the reference price crosses the limit.
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// An opening order for a leveraged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub size: Size,
    pub leverage: Leverage,
    pub limit_price: Option<Price>,
    pub executed_price: Option<Price>,
    pub executed_at: Option<Timestamp>,
    pub status: OrderStatus,
    pub created_at: Timestamp,
    /// margin held in the ledger while a limit order rests
    pub reserved_margin: Quote,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn new_market(
        order_id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Size,
        leverage: Leverage,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            order_id,
            user_id,
            symbol,
            side,
            order_type: OrderType::Market,
            size,
            leverage,
            limit_price: None,
            executed_price: None,
            executed_at: None,
            status: OrderStatus::Pending,
            created_at: timestamp,
            reserved_margin: Quote::zero(),
            reject_reason: None,
        }
    }

    pub fn new_limit(
        order_id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Size,
        leverage: Leverage,
        limit_price: Price,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::new_market(order_id, user_id, symbol, side, size, leverage, timestamp)
        }
    }

    /// `size * price / leverage`, in quote units.
    pub fn margin_at(&self, price: Price) -> Quote {
        self.leverage.margin_for(self.size.notional(price))
    }

    /// Whether a limit order should fill at `price`. Buys fill at or below the limit, sells at or above.
    pub fn crosses(&self, price: Price) -> bool {
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(limit)) => match self.side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            },
            _ => false,
        }
    }
}

/// Returned by `cancel_order`. The caller releases `released_margin` back to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelledOrder {
    pub order: Order,
    pub released_margin: Option<Quote>,
}

#[derive(Debug)]
pub struct OrderBook {
    risk: Arc<RiskConfig>,
    orders: HashMap<OrderId, Order>,
    by_user: HashMap<UserId, Vec<OrderId>>,
    // pending limit orders in submission order
    resting: Vec<OrderId>,
}

impl OrderBook {
    pub fn new(risk: Arc<RiskConfig>) -> Self {
        Self {
            risk,
            orders: HashMap::new(),
            by_user: HashMap::new(),
            resting: Vec::new(),
        }
    }

    pub fn order(&self, id: &OrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn user_orders(&self, user: &UserId) -> Vec<&Order> {
        self.by_user
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| self.orders.get(id)).collect())
            .unwrap_or_default()
    }

    /// Pending limit orders on `symbol` that cross `price`, oldest first.
    pub fn triggered_limit_orders(&self, symbol: &Symbol, price: Price) -> Vec<OrderId> {
        self.resting
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| &o.symbol == symbol && o.crosses(price))
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn resting_count(&self) -> usize {
        self.resting.len()
    }

    /// Pre-trade checks against the risk limits.
    ///
    /// When an execution price is known (argument, or the order's own executed price),
    /// also checks that `available` covers the prospective margin. The ledger's margin
    /// lock stays the authoritative admission check.
    pub fn validate_order(&self, order: &Order, available: Quote, execution_price: Option<Price>) -> Result<(), OrderError> {
        if !self.risk.leverage_allowed(order.leverage) {
            return Err(OrderError::Validation(format!(
                "Leverage exceeds {}x",
                self.risk.max_leverage
            )));
        }
        if self.risk.size_too_small(order.size) {
            return Err(OrderError::Validation("Position size too small".to_string()));
        }
        if self.risk.size_too_large(order.size) {
            return Err(OrderError::Validation("Position size too large".to_string()));
        }
        if order.order_type == OrderType::Limit && order.limit_price.is_none() {
            return Err(OrderError::Validation("Limit price is required for limit orders".to_string()));
        }

        if let Some(price) = execution_price.or(order.executed_price) {
            let required = order.margin_at(price);
            if available < required {
                return Err(OrderError::InsufficientMargin { required, available });
            }
        }
        Ok(())
    }

    /// Stores a new order as pending. Duplicate ids are rejected.
    pub fn add_order(&mut self, mut order: Order) -> Result<&Order, OrderError> {
        if self.orders.contains_key(&order.order_id) {
            return Err(OrderError::Duplicate(order.order_id));
        }
        order.status = OrderStatus::Pending;
        if order.order_type == OrderType::Limit {
            self.resting.push(order.order_id.clone());
        }
        let id = order.order_id.clone();
        self.upsert(order);
        self.orders.get(&id).ok_or(OrderError::NotFound(id))
    }

    /// Locks the margin a pending limit order needs at its limit price.
    pub fn reserve_limit_margin(&mut self, ledger: &mut BalanceLedger, order_id: &OrderId, now: Timestamp) -> Result<Quote, OrderError> {
        let order = self.pending_order(order_id)?;
        let limit = order
            .limit_price
            .ok_or_else(|| OrderError::Validation("Limit price is required for limit orders".to_string()))?;
        let reserve = order.margin_at(limit);
        let user = order.user_id.clone();

        ledger.lock_margin(&user, reserve, now)?;

        let mut updated = order.clone();
        updated.reserved_margin = reserve;
        self.upsert(updated);
        Ok(reserve)
    }

    /// Marks a pending order rejected. Any reserve must already be released by the caller.
    pub fn reject(&mut self, order_id: &OrderId, reason: impl Into<String>, now: Timestamp) -> Result<&Order, OrderError> {
        let mut order = self.pending_order(order_id)?.clone();
        let reason = reason.into();
        warn!(order_id = %order_id, reason = %reason, "order rejected");
        order.status = OrderStatus::Rejected;
        order.executed_at = Some(now);
        order.reject_reason = Some(reason);
        self.finish(order);
        self.orders.get(order_id).ok_or_else(|| OrderError::NotFound(order_id.clone()))
    }

    /// Fills a pending order at `execution_price` and opens its position.
    ///
    /// A limit order's reserve goes back to the ledger first. If the margin lock for the
    /// position then fails, the order ends `rejected` with no position.
    pub fn execute_order(
        &mut self,
        positions: &mut PositionBook,
        ledger: &mut BalanceLedger,
        order_id: &OrderId,
        execution_price: Decimal,
        now: Timestamp,
    ) -> Result<Position, OrderError> {
        let mut order = self.pending_order(order_id)?.clone();
        let price = Price::new(execution_price).ok_or(OrderError::InvalidPrice(execution_price))?;

        if order.reserved_margin.is_positive() {
            ledger.release_margin(&order.user_id, order.reserved_margin, Quote::zero(), now);
            order.reserved_margin = Quote::zero();
        }

        order.executed_price = Some(price);
        order.executed_at = Some(now);

        let margin = order.margin_at(price);
        let position = Position::new(
            order.order_id.clone(),
            order.user_id.clone(),
            order.symbol.clone(),
            order.side,
            order.size,
            price,
            order.leverage,
            margin,
            now,
        );

        match positions.open_position(ledger, position, now) {
            Ok(opened) => {
                let opened = opened.clone();
                order.status = OrderStatus::Filled;
                debug!(order_id = %order_id, price = %price, %margin, "order filled");
                self.finish(order);
                Ok(opened)
            }
            Err(e) => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(e.to_string());
                warn!(order_id = %order_id, error = %e, "execution rejected");
                self.finish(order);
                Err(OrderError::Position(e))
            }
        }
    }

    /// Cancels a pending order owned by `user` and reports the reserve to release.
    pub fn cancel_order(&mut self, user: &UserId, order_id: &OrderId, now: Timestamp) -> Result<CancelledOrder, OrderError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.clone()))?;

        if &order.user_id != user {
            return Err(OrderError::Unauthorized(order_id.clone()));
        }
        if order.status != OrderStatus::Pending {
            return Err(OrderError::InvalidState {
                order_id: order_id.clone(),
                status: order.status,
            });
        }

        let mut order = order.clone();
        let released_margin = Some(order.reserved_margin).filter(|m| m.is_positive());
        order.status = OrderStatus::Cancelled;
        order.executed_at = Some(now);
        order.reserved_margin = Quote::zero();
        self.finish(order.clone());

        Ok(CancelledOrder { order, released_margin })
    }

    fn pending_order(&self, order_id: &OrderId) -> Result<&Order, OrderError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.clone()))?;
        if order.status != OrderStatus::Pending {
            return Err(OrderError::InvalidState {
                order_id: order_id.clone(),
                status: order.status,
            });
        }
        Ok(order)
    }

    fn finish(&mut self, order: Order) {
        if order.status.is_terminal() {
            self.resting.retain(|id| id != &order.order_id);
        }
        self.upsert(order);
    }

    // global index plus the owner's list; existing ids keep their slot
    fn upsert(&mut self, order: Order) {
        let ids = self.by_user.entry(order.user_id.clone()).or_default();
        if !ids.contains(&order.order_id) {
            ids.push(order.order_id.clone());
        }
        self.orders.insert(order.order_id.clone(), order);
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    #[error("{0}")]
    Validation(String),

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("Order {0} already exists")]
    Duplicate(OrderId),

    #[error("Order {0} not found")]
    NotFound(OrderId),

    #[error("Unauthorised to cancel order {0}")]
    Unauthorized(OrderId),

    #[error("Cannot change order {order_id} with status {status}")]
    InvalidState { order_id: OrderId, status: OrderStatus },

    #[error("Invalid execution price {0}")]
    InvalidPrice(Decimal),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Position(#[from] PositionError),
}
