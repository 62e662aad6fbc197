//! In-memory ledger with free and held balances.
//!
//! It is the ledger used by simulations and tests. A node embedding the core provides its own
//! [`HoldLedger`] backed by the chain's balances.

use std::collections::BTreeMap;

use shp_traits::{HoldLedger, Precision};
use sp_runtime::{ArithmeticError, DispatchError, TokenError};

use crate::types::{AccountId, Balance, HoldReason};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    free: BTreeMap<AccountId, Balance>,
    holds: BTreeMap<(HoldReason, AccountId), Balance>,
}

impl Balances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `amount` out of thin air in the free balance of `who`.
    pub fn deposit_creating(&mut self, who: &AccountId, amount: Balance) {
        let free = self.free.entry(who.clone()).or_default();
        *free = free.saturating_add(amount);
    }

    pub fn total_issuance(&self) -> Balance {
        self.free
            .values()
            .chain(self.holds.values())
            .fold(0, |acc, b| acc.saturating_add(*b))
    }

    fn credit(&mut self, who: &AccountId, amount: Balance) -> Result<(), DispatchError> {
        let free = self.free.entry(who.clone()).or_default();
        *free = free.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        Ok(())
    }

    /// Reduces the hold of `who` by up to `amount`, returning how much was taken.
    fn take_from_hold(
        &mut self,
        reason: &HoldReason,
        who: &AccountId,
        amount: Balance,
        precision: Precision,
    ) -> Result<Balance, DispatchError> {
        let key = (*reason, who.clone());
        let held = self.holds.get(&key).copied().unwrap_or_default();
        let taken = match precision {
            Precision::Exact if held < amount => return Err(TokenError::FundsUnavailable.into()),
            Precision::Exact => amount,
            Precision::BestEffort => amount.min(held),
        };

        match held - taken {
            0 => self.holds.remove(&key),
            remaining => self.holds.insert(key, remaining),
        };

        Ok(taken)
    }
}

impl HoldLedger<AccountId> for Balances {
    type Balance = Balance;
    type Reason = HoldReason;

    fn free_balance(&self, who: &AccountId) -> Balance {
        self.free.get(who).copied().unwrap_or_default()
    }

    fn balance_on_hold(&self, reason: &HoldReason, who: &AccountId) -> Balance {
        self.holds
            .get(&(*reason, who.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn hold(
        &mut self,
        reason: &HoldReason,
        who: &AccountId,
        amount: Balance,
    ) -> Result<(), DispatchError> {
        if amount == 0 {
            return Ok(());
        }

        let free = self.free_balance(who);
        let remaining = free
            .checked_sub(amount)
            .ok_or(TokenError::FundsUnavailable)?;

        let held = self.holds.entry((*reason, who.clone())).or_default();
        *held = held.checked_add(amount).ok_or(ArithmeticError::Overflow)?;
        self.free.insert(who.clone(), remaining);

        Ok(())
    }

    fn release(
        &mut self,
        reason: &HoldReason,
        who: &AccountId,
        amount: Balance,
        precision: Precision,
    ) -> Result<Balance, DispatchError> {
        let released = self.take_from_hold(reason, who, amount, precision)?;
        self.credit(who, released)?;
        Ok(released)
    }

    fn transfer_on_hold(
        &mut self,
        reason: &HoldReason,
        source: &AccountId,
        dest: &AccountId,
        amount: Balance,
        precision: Precision,
    ) -> Result<Balance, DispatchError> {
        let moved = self.take_from_hold(reason, source, amount, precision)?;
        self.credit(dest, moved)?;
        Ok(moved)
    }

    fn transfer(
        &mut self,
        source: &AccountId,
        dest: &AccountId,
        amount: Balance,
        precision: Precision,
    ) -> Result<Balance, DispatchError> {
        let free = self.free_balance(source);
        let moved = match precision {
            Precision::Exact if free < amount => return Err(TokenError::FundsUnavailable.into()),
            Precision::Exact => amount,
            Precision::BestEffort => amount.min(free),
        };

        self.free.insert(source.clone(), free - moved);
        self.credit(dest, moved)?;
        Ok(moved)
    }
}
