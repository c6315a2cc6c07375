// 11.0: every ledger-visible state change produces an event. used for the audit trail
// and for checking replays. the EventPayload enum lists all event types.

use crate::position::CloseReason;
use crate::types::{OrderId, PositionId, Price, Quote, Side, Size, Symbol, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self { id, timestamp, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    // Account events
    Deposit {
        user_id: UserId,
        amount: Quote,
        available: Quote,
    },

    // Order events
    OrderPlaced {
        order_id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Size,
        limit_price: Option<Price>,
    },
    OrderFilled {
        order_id: OrderId,
        price: Price,
        margin: Quote,
    },
    OrderRejected {
        order_id: OrderId,
        reason: String,
    },
    OrderCancelled {
        order_id: OrderId,
        released_margin: Quote,
    },

    // Position events
    PositionOpened {
        position_id: PositionId,
        user_id: UserId,
        liquidation_price: rust_decimal::Decimal,
    },
    PositionClosed {
        position_id: PositionId,
        user_id: UserId,
        close_price: Price,
        realized_pnl: Quote,
        bad_debt: Quote,
        reason: CloseReason,
    },

    // Price events
    PriceUpdated {
        symbol: Symbol,
        price: Price,
    },
}

/// Bounded in-memory audit trail. Oldest events fall off once `capacity` is reached.
#[derive(Debug)]
pub struct EventJournal {
    events: VecDeque<Event>,
    next_id: u64,
    capacity: usize,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            next_id: 1,
            capacity,
        }
    }

    pub fn record(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.push_back(Event::new(id, timestamp, payload));
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn recent(&self, count: usize) -> Vec<&Event> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).collect()
    }
}
