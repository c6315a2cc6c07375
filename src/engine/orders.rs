//! Order placement, fills, and cancellation.

use super::core::Engine;
use super::results::{Effects, EngineError};
use crate::events::EventPayload;
use crate::message::{CancelOrderRequest, OpenOrderRequest};
use crate::order::{Order, OrderStatus, OrderType};
use crate::position::Position;
use crate::types::{Leverage, OrderId, Price, Quote, Size};
use serde_json::{json, Value};
use tracing::{info, warn};

impl Engine {
    /// Place an order.
    ///
    /// Market orders fill at the latest reference price or are rejected when none is known.
    /// Limit orders lock a reserve at their limit price and rest until a price update crosses
    /// them, filling at once if the latest price already does. Any failure after the order is
    /// stored leaves it `rejected`.
    pub(super) fn open_order(&mut self, req: OpenOrderRequest, effects: &mut Effects) -> Result<Value, EngineError> {
        let order = self.build_order(req)?;
        let order_id = order.order_id.clone();

        let placed = self.orders.add_order(order)?.clone();
        self.record(EventPayload::OrderPlaced {
            order_id: placed.order_id.clone(),
            user_id: placed.user_id.clone(),
            symbol: placed.symbol.clone(),
            side: placed.side,
            size: placed.size,
            limit_price: placed.limit_price,
        });
        info!(
            order_id = %order_id,
            user = %placed.user_id,
            symbol = %placed.symbol,
            side = %placed.side,
            size = %placed.size,
            leverage = placed.leverage.value(),
            order_type = ?placed.order_type,
            "order placed"
        );

        match self.admit(&order_id, effects) {
            Ok(data) => Ok(data),
            Err(err) => {
                self.reject_order(&order_id, &err, effects);
                Err(err)
            }
        }
    }

    fn build_order(&self, req: OpenOrderRequest) -> Result<Order, EngineError> {
        let size = Size::new(req.size)
            .ok_or_else(|| EngineError::Validation("Position size must be positive".to_string()))?;
        let leverage = Leverage::new(req.leverage)
            .ok_or_else(|| EngineError::Validation("Leverage must be at least 1x".to_string()))?;

        let order = match req.order_type {
            OrderType::Market => Order::new_market(
                req.order_id,
                req.user_id,
                req.symbol,
                req.side,
                size,
                leverage,
                self.current_time,
            ),
            OrderType::Limit => {
                let raw = req
                    .limit_price
                    .ok_or_else(|| EngineError::Validation("Limit price is required for limit orders".to_string()))?;
                let limit = Price::new(raw)
                    .filter(|price| !self.risk.price_too_large(*price))
                    .ok_or_else(|| EngineError::Validation(format!("Invalid limit price {raw}")))?;
                Order::new_limit(
                    req.order_id,
                    req.user_id,
                    req.symbol,
                    req.side,
                    size,
                    leverage,
                    limit,
                    self.current_time,
                )
            }
        };
        Ok(order)
    }

    fn admit(&mut self, order_id: &OrderId, effects: &mut Effects) -> Result<Value, EngineError> {
        let order = self
            .orders
            .order(order_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Order {order_id} not found")))?;
        let available = self.available(&order.user_id);

        match order.order_type {
            OrderType::Market => {
                let price = self.require_price(&order.symbol)?;
                self.orders.validate_order(&order, available, Some(price))?;
                let position = self.fill_order(order_id, price, effects)?;
                Ok(json!({ "order": self.orders.order(order_id), "position": position }))
            }
            OrderType::Limit => {
                self.orders.validate_order(&order, available, order.limit_price)?;
                let reserve = self.orders.reserve_limit_margin(&mut self.ledger, order_id, self.current_time)?;
                effects.touch(&order.user_id);

                let crossed = self.latest_price(&order.symbol).filter(|price| order.crosses(*price));
                if let Some(price) = crossed {
                    let position = self.fill_order(order_id, price, effects)?;
                    return Ok(json!({ "order": self.orders.order(order_id), "position": position }));
                }

                if let Some(resting) = self.orders.order(order_id) {
                    effects.order(resting);
                }
                Ok(json!({ "order": self.orders.order(order_id), "reservedMargin": reserve }))
            }
        }
    }

    /// Executes a pending order at `price` and records the fill.
    pub(super) fn fill_order(
        &mut self,
        order_id: &OrderId,
        price: Price,
        effects: &mut Effects,
    ) -> Result<Position, EngineError> {
        let position = self.orders.execute_order(
            &mut self.positions,
            &mut self.ledger,
            order_id,
            price.value(),
            self.current_time,
        )?;

        self.record(EventPayload::OrderFilled {
            order_id: order_id.clone(),
            price,
            margin: position.margin,
        });
        self.record(EventPayload::PositionOpened {
            position_id: position.position_id.clone(),
            user_id: position.user_id.clone(),
            liquidation_price: position.liquidation_price,
        });

        if let Some(filled) = self.orders.order(order_id) {
            effects.order(filled);
        }
        effects.position(&position);
        Ok(position)
    }

    /// Leaves a failed order `rejected` and returns any reserve it still holds.
    pub(super) fn reject_order(&mut self, order_id: &OrderId, err: &EngineError, effects: &mut Effects) {
        let now = self.current_time;
        let pending = self
            .orders
            .order(order_id)
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| (o.user_id.clone(), o.reserved_margin));

        if let Some((user, reserve)) = pending {
            if reserve.is_positive() {
                self.ledger.release_margin(&user, reserve, Quote::zero(), now);
            }
            if let Err(e) = self.orders.reject(order_id, err.to_string(), now) {
                warn!(order_id = %order_id, error = %e, "could not mark order rejected");
            }
        }

        let rejected = self
            .orders
            .order(order_id)
            .filter(|o| o.status == OrderStatus::Rejected)
            .cloned();
        if let Some(order) = rejected {
            self.record(EventPayload::OrderRejected {
                order_id: order_id.clone(),
                reason: err.to_string(),
            });
            effects.order(&order);
        }
    }

    /// Cancel a pending order. The owner's reserve, if any, goes back to available.
    pub(super) fn cancel_order(&mut self, req: CancelOrderRequest, effects: &mut Effects) -> Result<Value, EngineError> {
        let now = self.current_time;
        let cancelled = self.orders.cancel_order(&req.user_id, &req.order_id, now)?;

        let released = cancelled.released_margin.unwrap_or_default();
        if released.is_positive() {
            self.ledger.release_margin(&req.user_id, released, Quote::zero(), now);
        }

        self.record(EventPayload::OrderCancelled {
            order_id: req.order_id.clone(),
            released_margin: released,
        });
        info!(order_id = %req.order_id, user = %req.user_id, released_margin = %released, "order cancelled");

        effects.order(&cancelled.order);
        Ok(json!({ "order": cancelled.order, "releasedMargin": released }))
    }
}
