//! Per-user cash and margin ledger.
//!
//! Each user has `available` cash, `locked` margin pledged against open positions or
//! resting limit orders, and a `total` accumulator of realized PnL. `lock_margin` is the
//! only operation that moves cash from available to locked and is the single admission
//! point for new leveraged exposure. `release_margin` is its inverse plus a PnL term.
//!
//! The ledger is single-writer: only the dispatcher thread mutates it, so there is no
//! internal locking.

use crate::types::{Quote, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBalance {
    pub user_id: UserId,
    pub available: Quote,
    pub locked: Quote,
    /// realized pnl credited since initialization
    pub total: Quote,
    pub last_updated: Timestamp,
}

impl UserBalance {
    fn new(user_id: UserId, available: Quote, now: Timestamp) -> Self {
        Self {
            user_id,
            available,
            locked: Quote::zero(),
            total: Quote::zero(),
            last_updated: now,
        }
    }

    fn touch(&mut self, now: Timestamp) {
        self.last_updated = self.last_updated.max(now);
    }
}

/// Outcome of a margin release. `bad_debt` is the loss the user's cash could not cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Release {
    pub released: Quote,
    pub credited_pnl: Quote,
    pub bad_debt: Quote,
}

#[derive(Debug, Default)]
pub struct BalanceLedger {
    balances: HashMap<UserId, UserBalance>,
    bad_debt: Quote,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, user: &UserId) -> Option<&UserBalance> {
        self.balances.get(user)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserBalance> {
        self.balances.values()
    }

    pub fn total_bad_debt(&self) -> Quote {
        self.bad_debt
    }

    /// Creates a balance with `available = amount`. Re-initializing an existing user is rejected.
    pub fn initialize(&mut self, user: &UserId, amount: Quote, now: Timestamp) -> Result<&UserBalance, LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.balances.contains_key(user) {
            return Err(LedgerError::AlreadyInitialized(user.clone()));
        }
        let balance = self
            .balances
            .entry(user.clone())
            .or_insert_with(|| UserBalance::new(user.clone(), amount, now));
        Ok(balance)
    }

    /// Credits `available`. A user seen for the first time is initialized on the spot.
    pub fn deposit(&mut self, user: &UserId, amount: Quote, now: Timestamp) -> Result<&UserBalance, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let balance = self
            .balances
            .entry(user.clone())
            .or_insert_with(|| UserBalance::new(user.clone(), Quote::zero(), now));
        balance.available = balance
            .available
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(user.clone()))?;
        balance.touch(now);
        debug!(user = %user, %amount, available = %balance.available, "deposit credited");
        Ok(balance)
    }

    /// Moves `amount` from available to locked. All-or-nothing.
    pub fn lock_margin(&mut self, user: &UserId, amount: Quote, now: Timestamp) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let balance = self
            .balances
            .get_mut(user)
            .ok_or_else(|| LedgerError::UnknownUser(user.clone()))?;

        if balance.available < amount {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: balance.available,
            });
        }

        balance.available = balance.available.sub(amount);
        balance.locked = balance.locked.add(amount);
        balance.touch(now);
        Ok(())
    }

    /// Moves `amount` back from locked to available and credits `pnl`.
    ///
    /// A loss larger than the released margin plus the user's free cash floors
    /// `available` at zero; the uncovered part is returned as bad debt. Missing users
    /// are a no-op.
    pub fn release_margin(&mut self, user: &UserId, amount: Quote, pnl: Quote, now: Timestamp) -> Release {
        let Some(balance) = self.balances.get_mut(user) else {
            warn!(user = %user, %amount, "release for unknown user ignored");
            return Release::default();
        };

        let released = amount.max(Quote::zero()).min(balance.locked);
        balance.locked = balance.locked.sub(released);

        let after = balance.available.add(released).add(pnl);
        let bad_debt = if after.is_negative() { after.abs() } else { Quote::zero() };
        let credited_pnl = pnl.add(bad_debt);

        balance.available = after.max(Quote::zero());
        balance.total = balance.total.add(credited_pnl);
        balance.touch(now);

        if bad_debt.is_positive() {
            warn!(user = %user, %bad_debt, "loss exceeded collateral");
            self.bad_debt = self.bad_debt.add(bad_debt);
        }

        Release {
            released,
            credited_pnl,
            bad_debt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Balance for {0} already initialized")]
    AlreadyInitialized(UserId),

    #[error("No balance for user {0}")]
    UnknownUser(UserId),

    #[error("Invalid amount {0}")]
    InvalidAmount(Quote),

    #[error("Balance for {0} would overflow")]
    Overflow(UserId),
}
