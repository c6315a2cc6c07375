//! User-initiated position closes.

use super::core::Engine;
use super::results::{Effects, EngineError};
use crate::events::EventPayload;
use crate::message::ClosePositionRequest;
use crate::position::{CloseReason, ClosedPosition};
use serde_json::{json, Value};

impl Engine {
    /// Close an open position owned by the caller at the latest reference price.
    pub(super) fn close_position(&mut self, req: ClosePositionRequest, effects: &mut Effects) -> Result<Value, EngineError> {
        let position = self
            .positions
            .position(&req.position_id)
            .ok_or_else(|| EngineError::NotFound(format!("Position {} not found", req.position_id)))?;

        if position.user_id != req.user_id {
            return Err(EngineError::Unauthorized(format!(
                "Unauthorised to close position {}",
                req.position_id
            )));
        }
        if !position.is_open() {
            return Err(EngineError::InvalidState(format!(
                "Position {} is already closed",
                req.position_id
            )));
        }

        let price = self.require_price(&position.symbol)?;
        let closed = self.positions.close_position(
            &mut self.ledger,
            &req.position_id,
            price,
            CloseReason::User,
            self.current_time,
        )?;
        self.record_close(&closed, effects);

        Ok(json!({
            "position": closed.position,
            "realizedPnl": closed.position.realized_pnl,
            "badDebt": closed.release.bad_debt,
            "balance": self.ledger.balance(&req.user_id),
        }))
    }

    pub(super) fn record_close(&mut self, closed: &ClosedPosition, effects: &mut Effects) {
        let position = &closed.position;
        self.record(EventPayload::PositionClosed {
            position_id: position.position_id.clone(),
            user_id: position.user_id.clone(),
            close_price: position.close_price.unwrap_or(position.open_price),
            realized_pnl: position.realized_pnl,
            bad_debt: closed.release.bad_debt,
            reason: position.close_reason.unwrap_or(CloseReason::User),
        });
        effects.position(position);
    }
}
