// 8.0.2: result types and errors for engine operations.

use crate::balance::LedgerError;
use crate::message::EngineResponse;
use crate::order::{Order, OrderError};
use crate::position::{Position, PositionError};
use crate::types::{OrderId, PositionId, Price, Quote, Symbol, UserId};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

/// State touched while handling one request. Drives the side-cache writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    pub users: BTreeSet<UserId>,
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.orders.is_empty() && self.positions.is_empty()
    }

    pub(super) fn touch(&mut self, user: &UserId) {
        if !self.users.contains(user) {
            self.users.insert(user.clone());
        }
    }

    pub(super) fn order(&mut self, order: &Order) {
        self.touch(&order.user_id);
        self.orders.push(order.clone());
    }

    pub(super) fn position(&mut self, position: &Position) {
        self.touch(&position.user_id);
        self.positions.push(position.clone());
    }
}

/// Output of `Engine::handle`. Price updates produce no response.
#[derive(Debug, Clone)]
pub struct Handled {
    pub response: Option<EngineResponse>,
    pub effects: Effects,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationResult {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub liquidation_price: Decimal,
    pub close_price: Price,
    pub realized_pnl: Quote,
    pub bad_debt: Quote,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceUpdateResult {
    pub filled: Vec<OrderId>,
    pub rejected: Vec<OrderId>,
    pub liquidations: Vec<LiquidationResult>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("No reference price for {0}")]
    NoPrice(Symbol),

    #[error("{0}")]
    Duplicate(String),

    #[error("Unsupported request type {0}")]
    Unsupported(String),
}

impl EngineError {
    /// Stable wire code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::InsufficientMargin { .. } => "INSUFFICIENT_MARGIN",
            EngineError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::NoPrice(_) => "NO_PRICE",
            EngineError::Duplicate(_) => "DUPLICATE",
            EngineError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { requested, available } => {
                EngineError::InsufficientBalance { requested, available }
            }
            LedgerError::AlreadyInitialized(_) => EngineError::Duplicate(err.to_string()),
            LedgerError::UnknownUser(_) => EngineError::NotFound(err.to_string()),
            LedgerError::InvalidAmount(_) | LedgerError::Overflow(_) => EngineError::Validation(err.to_string()),
        }
    }
}

impl From<PositionError> for EngineError {
    fn from(err: PositionError) -> Self {
        match err {
            // a failed lock while opening exposure is a margin shortfall
            PositionError::Margin(LedgerError::InsufficientBalance { requested, available }) => {
                EngineError::InsufficientMargin {
                    required: requested,
                    available,
                }
            }
            PositionError::Margin(inner) => inner.into(),
            PositionError::NotFound(_) => EngineError::NotFound(err.to_string()),
            PositionError::AlreadyClosed(_) => EngineError::InvalidState(err.to_string()),
            PositionError::Duplicate(_) => EngineError::Duplicate(err.to_string()),
        }
    }
}

impl From<OrderError> for EngineError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(message) => EngineError::Validation(message),
            OrderError::InsufficientMargin { required, available } => {
                EngineError::InsufficientMargin { required, available }
            }
            OrderError::Duplicate(_) => EngineError::Duplicate(err.to_string()),
            OrderError::NotFound(_) => EngineError::NotFound(err.to_string()),
            OrderError::Unauthorized(_) => EngineError::Unauthorized(err.to_string()),
            OrderError::InvalidState { .. } => EngineError::InvalidState(err.to_string()),
            OrderError::InvalidPrice(_) => EngineError::Validation(err.to_string()),
            // reserving a limit order's margin is also an admission check
            OrderError::Ledger(LedgerError::InsufficientBalance { requested, available }) => {
                EngineError::InsufficientMargin {
                    required: requested,
                    available,
                }
            }
            OrderError::Ledger(inner) => inner.into(),
            OrderError::Position(inner) => inner.into(),
        }
    }
}
