// 4.0: open position tracking. pnl = (price - open) * size * sign.
// 4.1 liquidation price is fixed at open. 4.2 close is the only path that frees margin.

use crate::balance::{BalanceLedger, LedgerError, Release};
use crate::risk::RiskConfig;
use crate::types::{Leverage, OrderId, PositionId, Price, Quote, Side, Size, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    User,
    Liquidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub position_id: PositionId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Size,
    pub open_price: Price,
    pub leverage: Leverage,
    pub margin: Quote,
    pub status: PositionStatus,
    pub realized_pnl: Quote,
    /// zero means a long that cannot be liquidated before the price hits zero
    pub liquidation_price: Decimal,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub close_price: Option<Price>,
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// A fresh open position. The liquidation price is filled in by `PositionBook::open_position`.
    pub fn new(
        order_id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Size,
        open_price: Price,
        leverage: Leverage,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            position_id: PositionId::for_order(&order_id),
            order_id,
            user_id,
            symbol,
            side,
            size,
            open_price,
            leverage,
            margin,
            status: PositionStatus::Open,
            realized_pnl: Quote::zero(),
            liquidation_price: Decimal::ZERO,
            opened_at: timestamp,
            closed_at: None,
            close_price: None,
            close_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    // 4.1: paper gains/losses based on current price
    pub fn unrealized_pnl(&self, mark_price: Price) -> Quote {
        calculate_pnl(self.side, self.size, self.open_price, mark_price)
    }

    pub fn notional_value(&self) -> Quote {
        self.size.notional(self.open_price)
    }
}

// 4.3: the pnl formula. (exit - open) * size * sign
pub fn calculate_pnl(side: Side, size: Size, open_price: Price, exit_price: Price) -> Quote {
    Quote::new((exit_price.value() - open_price.value()) * size.value() * side.sign())
}

/// Price at which equity (margin + unrealized pnl) falls to the maintenance margin.
///
/// `MM = size * open * rate`. Longs liquidate at `open - (margin - MM) / size`,
/// shorts at `open + (margin - MM) / size`. Long prices are floored at zero.
pub fn calculate_liquidation_price(
    side: Side,
    size: Size,
    open_price: Price,
    margin: Quote,
    maintenance_margin_rate: Decimal,
) -> Decimal {
    let maintenance = size.value() * open_price.value() * maintenance_margin_rate;
    let buffer = (margin.value() - maintenance) / size.value();

    match side {
        Side::Buy => (open_price.value() - buffer).max(Decimal::ZERO),
        Side::Sell => open_price.value() + buffer,
    }
}

/// Result of closing a position: the closed record plus what the ledger did with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub release: Release,
}

#[derive(Debug)]
pub struct PositionBook {
    risk: Arc<RiskConfig>,
    positions: HashMap<PositionId, Position>,
    by_user: HashMap<UserId, Vec<PositionId>>,
    // open ids in open order so liquidation sweeps are deterministic
    open: Vec<PositionId>,
}

impl PositionBook {
    pub fn new(risk: Arc<RiskConfig>) -> Self {
        Self {
            risk,
            positions: HashMap::new(),
            by_user: HashMap::new(),
            open: Vec::new(),
        }
    }

    pub fn position(&self, id: &PositionId) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn user_positions(&self, user: &UserId) -> Vec<&Position> {
        self.by_user
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| self.positions.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn open_positions_for(&self, symbol: &Symbol) -> Vec<PositionId> {
        self.open
            .iter()
            .filter(|id| self.positions.get(*id).is_some_and(|p| &p.symbol == symbol))
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Locks the position's margin and activates it. On a failed lock nothing changes.
    pub fn open_position(
        &mut self,
        ledger: &mut BalanceLedger,
        mut position: Position,
        now: Timestamp,
    ) -> Result<&Position, PositionError> {
        if self.positions.contains_key(&position.position_id) {
            return Err(PositionError::Duplicate(position.position_id));
        }

        ledger
            .lock_margin(&position.user_id, position.margin, now)
            .map_err(PositionError::Margin)?;

        position.liquidation_price = calculate_liquidation_price(
            position.side,
            position.size,
            position.open_price,
            position.margin,
            self.risk.maintenance_margin_rate,
        );
        position.status = PositionStatus::Open;

        info!(
            position_id = %position.position_id,
            user = %position.user_id,
            symbol = %position.symbol,
            side = %position.side,
            size = %position.size,
            open_price = %position.open_price,
            margin = %position.margin,
            liquidation_price = %position.liquidation_price,
            "position opened"
        );

        let id = position.position_id.clone();
        self.by_user
            .entry(position.user_id.clone())
            .or_default()
            .push(id.clone());
        self.open.push(id.clone());
        Ok(self.positions.entry(id).or_insert(position))
    }

    /// True iff the position is open and `current_price` has reached its liquidation price.
    pub fn check_liquidation(&self, id: &PositionId, current_price: Price) -> bool {
        let Some(position) = self.positions.get(id) else {
            return false;
        };
        if !position.is_open() {
            return false;
        }
        match position.side {
            Side::Buy => current_price.value() <= position.liquidation_price,
            Side::Sell => current_price.value() >= position.liquidation_price,
        }
    }

    /// Closes at `close_price`, realizes pnl and releases the margin. A position closes exactly once.
    pub fn close_position(
        &mut self,
        ledger: &mut BalanceLedger,
        id: &PositionId,
        close_price: Price,
        reason: CloseReason,
        now: Timestamp,
    ) -> Result<ClosedPosition, PositionError> {
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| PositionError::NotFound(id.clone()))?;

        if !position.is_open() {
            return Err(PositionError::AlreadyClosed(id.clone()));
        }

        let realized = position.unrealized_pnl(close_price);
        position.realized_pnl = realized;
        position.status = PositionStatus::Closed;
        position.closed_at = Some(now);
        position.close_price = Some(close_price);
        position.close_reason = Some(reason);

        let release = ledger.release_margin(&position.user_id, position.margin, realized, now);

        info!(
            position_id = %id,
            user = %position.user_id,
            close_price = %close_price,
            realized_pnl = %realized,
            reason = ?reason,
            "position closed"
        );

        let closed = position.clone();
        self.open.retain(|open_id| open_id != id);

        Ok(ClosedPosition {
            position: closed,
            release,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("Position {0} not found")]
    NotFound(PositionId),

    #[error("Position {0} is already closed")]
    AlreadyClosed(PositionId),

    #[error("Position {0} already exists")]
    Duplicate(PositionId),

    #[error("Margin lock failed: {0}")]
    Margin(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn risk(rate: Decimal) -> Arc<RiskConfig> {
        Arc::new(RiskConfig {
            maintenance_margin_rate: rate,
            ..RiskConfig::default()
        })
    }

    fn user() -> UserId {
        UserId::from("bob@example.com")
    }

    fn position(side: Side, size: Decimal, open: Decimal, margin: Decimal) -> Position {
        Position::new(
            OrderId::from("order_1"),
            user(),
            Symbol::from("SOL_USDC"),
            side,
            Size::new_unchecked(size),
            Price::new_unchecked(open),
            Leverage::new(10).unwrap(),
            Quote::new(margin),
            Timestamp::from_millis(0),
        )
    }

    fn funded(amount: Decimal) -> BalanceLedger {
        let mut ledger = BalanceLedger::new();
        ledger.deposit(&user(), Quote::new(amount), Timestamp::from_millis(0)).unwrap();
        ledger
    }

    #[test]
    fn liquidation_price_long() {
        let size = Size::new_unchecked(dec!(10));
        let open = Price::new_unchecked(dec!(100));
        // MM = 10 * 100 * 0.05 = 50
        let at_mm = calculate_liquidation_price(Side::Buy, size, open, Quote::new(dec!(50)), dec!(0.05));
        assert_eq!(at_mm, dec!(100));

        let with_buffer = calculate_liquidation_price(Side::Buy, size, open, Quote::new(dec!(80)), dec!(0.05));
        assert_eq!(with_buffer, dec!(97));
    }

    #[test]
    fn liquidation_price_short() {
        let size = Size::new_unchecked(dec!(10));
        let open = Price::new_unchecked(dec!(100));
        let liq = calculate_liquidation_price(Side::Sell, size, open, Quote::new(dec!(80)), dec!(0.05));
        assert_eq!(liq, dec!(103));
    }

    #[test]
    fn liquidation_price_long_floors_at_zero() {
        // 1x long with no maintenance requirement can never be liquidated
        let liq = calculate_liquidation_price(
            Side::Buy,
            Size::new_unchecked(dec!(1)),
            Price::new_unchecked(dec!(100)),
            Quote::new(dec!(150)),
            dec!(0),
        );
        assert_eq!(liq, dec!(0));
    }

    #[test]
    fn open_locks_margin_and_stores_liquidation_price() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.05)));

        let opened = book
            .open_position(&mut ledger, position(Side::Buy, dec!(10), dec!(100), dec!(80)), Timestamp::from_millis(1))
            .unwrap();
        assert_eq!(opened.liquidation_price, dec!(97));

        let balance = ledger.balance(&user()).unwrap();
        assert_eq!(balance.available.value(), dec!(920));
        assert_eq!(balance.locked.value(), dec!(80));
        assert_eq!(book.user_positions(&user()).len(), 1);
    }

    #[test]
    fn open_without_margin_changes_nothing() {
        let mut ledger = funded(dec!(10));
        let mut book = PositionBook::new(risk(dec!(0.05)));

        let result = book.open_position(&mut ledger, position(Side::Buy, dec!(10), dec!(100), dec!(80)), Timestamp::from_millis(1));
        assert!(matches!(result, Err(PositionError::Margin(LedgerError::InsufficientBalance { .. }))));
        assert!(book.user_positions(&user()).is_empty());
        assert_eq!(book.open_count(), 0);
        assert_eq!(ledger.balance(&user()).unwrap().available.value(), dec!(10));
    }

    #[test]
    fn check_liquidation_boundary_long() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.05)));
        let id = book
            .open_position(&mut ledger, position(Side::Buy, dec!(10), dec!(100), dec!(80)), Timestamp::from_millis(1))
            .unwrap()
            .position_id
            .clone();

        assert!(book.check_liquidation(&id, Price::new_unchecked(dec!(97))));
        assert!(book.check_liquidation(&id, Price::new_unchecked(dec!(90))));
        assert!(!book.check_liquidation(&id, Price::new_unchecked(dec!(97.01))));
    }

    #[test]
    fn check_liquidation_boundary_short() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.05)));
        let id = book
            .open_position(&mut ledger, position(Side::Sell, dec!(10), dec!(100), dec!(80)), Timestamp::from_millis(1))
            .unwrap()
            .position_id
            .clone();

        assert!(book.check_liquidation(&id, Price::new_unchecked(dec!(103))));
        assert!(!book.check_liquidation(&id, Price::new_unchecked(dec!(102.99))));
    }

    #[test]
    fn close_realizes_pnl_and_releases() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.005)));
        let id = book
            .open_position(&mut ledger, position(Side::Buy, dec!(100), dec!(50), dec!(500)), Timestamp::from_millis(1))
            .unwrap()
            .position_id
            .clone();

        let closed = book
            .close_position(&mut ledger, &id, Price::new_unchecked(dec!(60)), CloseReason::User, Timestamp::from_millis(2))
            .unwrap();
        assert_eq!(closed.position.realized_pnl.value(), dec!(1000));
        assert_eq!(closed.position.status, PositionStatus::Closed);

        let balance = ledger.balance(&user()).unwrap();
        assert_eq!(balance.available.value(), dec!(2000));
        assert_eq!(balance.locked.value(), dec!(0));
        assert!(!book.check_liquidation(&id, Price::new_unchecked(dec!(1))));
    }

    #[test]
    fn short_profits_when_price_drops() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.005)));
        let id = book
            .open_position(&mut ledger, position(Side::Sell, dec!(10), dec!(100), dec!(100)), Timestamp::from_millis(1))
            .unwrap()
            .position_id
            .clone();

        let closed = book
            .close_position(&mut ledger, &id, Price::new_unchecked(dec!(95)), CloseReason::User, Timestamp::from_millis(2))
            .unwrap();
        assert_eq!(closed.position.realized_pnl.value(), dec!(50));
    }

    #[test]
    fn close_twice_is_rejected() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.005)));
        let id = book
            .open_position(&mut ledger, position(Side::Buy, dec!(10), dec!(50), dec!(50)), Timestamp::from_millis(1))
            .unwrap()
            .position_id
            .clone();

        book.close_position(&mut ledger, &id, Price::new_unchecked(dec!(50)), CloseReason::User, Timestamp::from_millis(2))
            .unwrap();
        let again = book.close_position(&mut ledger, &id, Price::new_unchecked(dec!(50)), CloseReason::User, Timestamp::from_millis(3));
        assert!(matches!(again, Err(PositionError::AlreadyClosed(_))));
        assert_eq!(ledger.balance(&user()).unwrap().available.value(), dec!(1000));
    }

    #[test]
    fn close_unknown_position() {
        let mut ledger = funded(dec!(1));
        let mut book = PositionBook::new(risk(dec!(0.005)));
        let result = book.close_position(
            &mut ledger,
            &PositionId::from("pos_missing"),
            Price::new_unchecked(dec!(1)),
            CloseReason::User,
            Timestamp::from_millis(1),
        );
        assert!(matches!(result, Err(PositionError::NotFound(_))));
    }

    #[test]
    fn open_positions_filtered_by_symbol() {
        let mut ledger = funded(dec!(1000));
        let mut book = PositionBook::new(risk(dec!(0.005)));
        book.open_position(&mut ledger, position(Side::Buy, dec!(1), dec!(10), dec!(1)), Timestamp::from_millis(1))
            .unwrap();

        assert_eq!(book.open_positions_for(&Symbol::from("SOL_USDC")).len(), 1);
        assert!(book.open_positions_for(&Symbol::from("BTC_USDC")).is_empty());
    }
}
