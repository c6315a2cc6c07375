//! Reference price updates.

use super::core::Engine;
use super::results::{Effects, EngineError, PriceUpdateResult};
use crate::events::EventPayload;
use crate::message::PriceUpdateRequest;
use crate::types::Price;
use tracing::{debug, warn};

impl Engine {
    /// Record a new reference price, fill the limit orders it crosses, then sweep the
    /// symbol's open positions for liquidation.
    pub(super) fn update_price(
        &mut self,
        req: PriceUpdateRequest,
        effects: &mut Effects,
    ) -> Result<PriceUpdateResult, EngineError> {
        let price = Price::new(req.price)
            .filter(|price| !self.risk.price_too_large(*price))
            .ok_or_else(|| EngineError::Validation(format!("Invalid price {} for {}", req.price, req.symbol)))?;
        let symbol = req.symbol;

        self.prices.insert(symbol.clone(), price);
        self.record(EventPayload::PriceUpdated {
            symbol: symbol.clone(),
            price,
        });
        debug!(symbol = %symbol, price = %price, "price updated");

        let mut result = PriceUpdateResult::default();

        // resting limits fill in placement order
        for order_id in self.orders.triggered_limit_orders(&symbol, price) {
            match self.fill_order(&order_id, price, effects) {
                Ok(_) => result.filled.push(order_id),
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "triggered limit order failed");
                    self.reject_order(&order_id, &err, effects);
                    result.rejected.push(order_id);
                }
            }
        }

        result.liquidations = self.run_liquidations(&symbol, price, effects);
        Ok(result)
    }
}
