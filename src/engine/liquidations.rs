//! Liquidation sweep on price updates.

use super::core::Engine;
use super::results::{Effects, LiquidationResult};
use crate::position::CloseReason;
use crate::types::{PositionId, Price, Symbol};
use tracing::warn;

impl Engine {
    /// Closes every open position on `symbol` whose liquidation price `price` has reached.
    /// Positions close at the update price, in the order they were opened.
    pub(super) fn run_liquidations(&mut self, symbol: &Symbol, price: Price, effects: &mut Effects) -> Vec<LiquidationResult> {
        let liquidatable: Vec<PositionId> = self
            .positions
            .open_positions_for(symbol)
            .into_iter()
            .filter(|id| self.positions.check_liquidation(id, price))
            .collect();

        let mut results = Vec::with_capacity(liquidatable.len());
        for id in liquidatable {
            let closed = match self.positions.close_position(
                &mut self.ledger,
                &id,
                price,
                CloseReason::Liquidation,
                self.current_time,
            ) {
                Ok(closed) => closed,
                Err(e) => {
                    warn!(position_id = %id, error = %e, "liquidation skipped");
                    continue;
                }
            };

            let position = &closed.position;
            warn!(
                position_id = %id,
                user = %position.user_id,
                symbol = %symbol,
                liquidation_price = %position.liquidation_price,
                price = %price,
                realized_pnl = %position.realized_pnl,
                bad_debt = %closed.release.bad_debt,
                "position liquidated"
            );

            results.push(LiquidationResult {
                position_id: id,
                user_id: position.user_id.clone(),
                liquidation_price: position.liquidation_price,
                close_price: price,
                realized_pnl: position.realized_pnl,
                bad_debt: closed.release.bad_debt,
            });
            self.record_close(&closed, effects);
        }
        results
    }
}
