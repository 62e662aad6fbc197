use log::{debug, warn};
use shp_constants::GIGAUNIT;
use shp_traits::{HoldLedger, Precision, TreasuryCutCalculator, UpdateStoragePrice};

use super::{Error, Event, LOG_TARGET};
use crate::{
    error::{ensure, DispatchError, DispatchResult},
    payment_streams::types::*,
    types::{AccountId, Balance, HoldReason, PriceIndex, ProviderId, StorageData, TickNumber},
    Ledger, Runtime,
};

impl<L: Ledger> Runtime<L> {
    /// This function holds the logic that checks if a fixed rate payment stream can be created and, if so, stores it
    /// and holds the deposit of the user for it.
    pub(crate) fn do_create_fixed_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        rate: Balance,
    ) -> DispatchResult {
        // Check that the provider exists
        ensure!(
            self.get_payment_account(provider_id).is_some(),
            Error::NotAProvider
        );

        // Check that the rate is not zero (there would be nothing to charge)
        ensure!(rate != 0, Error::RateCantBeZero);

        // Check that a fixed rate payment stream between that provider and user does not exist yet
        let key = (*provider_id, user_account.clone());
        ensure!(
            !self
                .state
                .payment_streams
                .fixed_rate_payment_streams
                .contains_key(&key),
            Error::PaymentStreamAlreadyExists
        );

        // Check that the user is not flagged as without funds
        ensure!(
            !self.is_user_without_funds(user_account),
            Error::UserWithoutFunds
        );

        let deposit = self.fixed_rate_stream_deposit(rate)?;
        self.hold_stream_deposit(user_account, deposit)?;

        // The stream starts from the provider's last chargeable tick, so the first charge only
        // covers ticks after its creation
        let chargeable = self.chargeable_info_or_now(provider_id);
        self.state.payment_streams.fixed_rate_payment_streams.insert(
            key,
            FixedRatePaymentStream {
                rate,
                last_charged_tick: chargeable.last_chargeable_tick,
                user_deposit: deposit,
                out_of_funds_tick: None,
                outstanding_debt: 0,
            },
        );

        self.deposit_event(Event::FixedRatePaymentStreamCreated {
            user_account: user_account.clone(),
            provider_id: *provider_id,
            rate,
        });

        Ok(())
    }

    /// This function holds the logic that checks if a fixed rate payment stream can be updated and, if so, charges it
    /// with the old rate and updates it.
    pub(crate) fn do_update_fixed_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        new_rate: Balance,
    ) -> DispatchResult {
        // Ensure that the new rate is not 0 (should delete the payment stream instead)
        ensure!(new_rate != 0, Error::RateCantBeZero);

        let key = (*provider_id, user_account.clone());
        let current_rate = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&key)
            .map(|stream| stream.rate)
            .ok_or(Error::PaymentStreamNotFound)?;

        // Verify that the new rate is different from the current one
        ensure!(current_rate != new_rate, Error::UpdateRateToSameRate);

        // Charge the payment stream with the old rate before updating it to prevent abuse
        self.do_charge_payment_streams(provider_id, user_account)?;

        // A user without funds can't get more service, but can always get less
        if new_rate > current_rate {
            ensure!(
                !self.is_user_without_funds(user_account),
                Error::UserWithoutFunds
            );
        }

        let target_deposit = self.fixed_rate_stream_deposit(new_rate)?;
        let mut stream = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&key)
            .cloned()
            .ok_or(Error::PaymentStreamNotFound)?;
        stream.user_deposit =
            self.adjust_stream_deposit(user_account, stream.user_deposit, target_deposit)?;
        stream.rate = new_rate;
        self.state
            .payment_streams
            .fixed_rate_payment_streams
            .insert(key, stream);

        self.deposit_event(Event::FixedRatePaymentStreamUpdated {
            user_account: user_account.clone(),
            provider_id: *provider_id,
            new_rate,
        });

        Ok(())
    }

    /// This function holds the logic that checks if a fixed rate payment stream can be removed and, if so, charges it
    /// one last time, removes it and releases what is left of its deposit.
    pub(crate) fn do_delete_fixed_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
    ) -> DispatchResult {
        let key = (*provider_id, user_account.clone());
        ensure!(
            self.state
                .payment_streams
                .fixed_rate_payment_streams
                .contains_key(&key),
            Error::PaymentStreamNotFound
        );

        // Charge the payment stream before deletion to make sure the storage provided by the provider is paid in full for its duration
        self.do_charge_payment_streams(provider_id, user_account)?;

        let stream = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .remove(&key)
            .ok_or(Error::PaymentStreamNotFound)?;
        self.settle_removed_stream(provider_id, user_account, stream.user_deposit, stream.outstanding_debt)?;

        self.deposit_event(Event::FixedRatePaymentStreamDeleted {
            user_account: user_account.clone(),
            provider_id: *provider_id,
        });

        Ok(())
    }

    pub(crate) fn do_create_dynamic_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        amount_provided: StorageData,
    ) -> DispatchResult {
        ensure!(
            self.get_payment_account(provider_id).is_some(),
            Error::NotAProvider
        );
        ensure!(amount_provided != 0, Error::AmountProvidedCantBeZero);

        let key = (*provider_id, user_account.clone());
        ensure!(
            !self
                .state
                .payment_streams
                .dynamic_rate_payment_streams
                .contains_key(&key),
            Error::PaymentStreamAlreadyExists
        );
        ensure!(
            !self.is_user_without_funds(user_account),
            Error::UserWithoutFunds
        );

        let deposit = self.dynamic_rate_stream_deposit(amount_provided)?;
        self.hold_stream_deposit(user_account, deposit)?;

        let chargeable = self.chargeable_info_or_now(provider_id);
        self.state.payment_streams.dynamic_rate_payment_streams.insert(
            key,
            DynamicRatePaymentStream {
                amount_provided,
                price_index_when_last_charged: chargeable.price_index,
                last_charged_tick: chargeable.last_chargeable_tick,
                user_deposit: deposit,
                out_of_funds_tick: None,
                outstanding_debt: 0,
            },
        );

        self.deposit_event(Event::DynamicRatePaymentStreamCreated {
            user_account: user_account.clone(),
            provider_id: *provider_id,
            amount_provided,
        });

        Ok(())
    }

    pub(crate) fn do_update_dynamic_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        new_amount_provided: StorageData,
    ) -> DispatchResult {
        ensure!(new_amount_provided != 0, Error::AmountProvidedCantBeZero);

        let key = (*provider_id, user_account.clone());
        let current_amount = self
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .get(&key)
            .map(|stream| stream.amount_provided)
            .ok_or(Error::PaymentStreamNotFound)?;
        ensure!(
            current_amount != new_amount_provided,
            Error::UpdateAmountToSameAmount
        );

        self.do_charge_payment_streams(provider_id, user_account)?;

        if new_amount_provided > current_amount {
            ensure!(
                !self.is_user_without_funds(user_account),
                Error::UserWithoutFunds
            );
        }

        let target_deposit = self.dynamic_rate_stream_deposit(new_amount_provided)?;
        let mut stream = self
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .get(&key)
            .cloned()
            .ok_or(Error::PaymentStreamNotFound)?;
        stream.user_deposit =
            self.adjust_stream_deposit(user_account, stream.user_deposit, target_deposit)?;
        stream.amount_provided = new_amount_provided;
        self.state
            .payment_streams
            .dynamic_rate_payment_streams
            .insert(key, stream);

        self.deposit_event(Event::DynamicRatePaymentStreamUpdated {
            user_account: user_account.clone(),
            provider_id: *provider_id,
            new_amount_provided,
        });

        Ok(())
    }

    pub(crate) fn do_delete_dynamic_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
    ) -> DispatchResult {
        let key = (*provider_id, user_account.clone());
        ensure!(
            self.state
                .payment_streams
                .dynamic_rate_payment_streams
                .contains_key(&key),
            Error::PaymentStreamNotFound
        );

        self.do_charge_payment_streams(provider_id, user_account)?;

        let stream = self
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .remove(&key)
            .ok_or(Error::PaymentStreamNotFound)?;
        self.settle_removed_stream(provider_id, user_account, stream.user_deposit, stream.outstanding_debt)?;

        self.deposit_event(Event::DynamicRatePaymentStreamDeleted {
            user_account: user_account.clone(),
            provider_id: *provider_id,
        });

        Ok(())
    }

    /// Sets the rate of the fixed rate stream between a provider and a user, creating the stream
    /// if needed and deleting it when the rate drops to zero.
    pub(crate) fn set_fixed_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        rate: Balance,
    ) -> DispatchResult {
        let current_rate = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&(*provider_id, user_account.clone()))
            .map(|stream| stream.rate);

        match (current_rate, rate) {
            (None, 0) => Ok(()),
            (None, rate) => self.do_create_fixed_rate_payment_stream(provider_id, user_account, rate),
            (Some(_), 0) => self.do_delete_fixed_rate_payment_stream(provider_id, user_account),
            (Some(current), rate) if current == rate => Ok(()),
            (Some(_), rate) => self.do_update_fixed_rate_payment_stream(provider_id, user_account, rate),
        }
    }

    /// Sets the amount provided of the dynamic rate stream between a provider and a user,
    /// creating the stream if needed and deleting it when the amount drops to zero.
    pub(crate) fn set_dynamic_rate_payment_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        amount_provided: StorageData,
    ) -> DispatchResult {
        let current_amount = self.dynamic_amount_provided(provider_id, user_account);

        match (current_amount, amount_provided) {
            (None, 0) => Ok(()),
            (None, amount) => {
                self.do_create_dynamic_rate_payment_stream(provider_id, user_account, amount)
            }
            (Some(_), 0) => self.do_delete_dynamic_rate_payment_stream(provider_id, user_account),
            (Some(current), amount) if current == amount => Ok(()),
            (Some(_), amount) => {
                self.do_update_dynamic_rate_payment_stream(provider_id, user_account, amount)
            }
        }
    }

    pub(crate) fn increase_dynamic_amount_provided(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        delta: StorageData,
    ) -> DispatchResult {
        let current = self
            .dynamic_amount_provided(provider_id, user_account)
            .unwrap_or_default();
        let new_amount = current.checked_add(delta).ok_or(Error::ChargeOverflow)?;
        self.set_dynamic_rate_payment_stream(provider_id, user_account, new_amount)
    }

    pub(crate) fn decrease_dynamic_amount_provided(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        delta: StorageData,
    ) -> DispatchResult {
        let current = self
            .dynamic_amount_provided(provider_id, user_account)
            .unwrap_or_default();
        self.set_dynamic_rate_payment_stream(
            provider_id,
            user_account,
            current.saturating_sub(delta),
        )
    }

    fn dynamic_amount_provided(
        &self,
        provider_id: &ProviderId,
        user_account: &AccountId,
    ) -> Option<StorageData> {
        self.state
            .payment_streams
            .dynamic_rate_payment_streams
            .get(&(*provider_id, user_account.clone()))
            .map(|stream| stream.amount_provided)
    }

    /// This function holds the logic that charges the payment streams between a provider and a user.
    ///
    /// Fixed rate streams are charged `rate * (last_chargeable_tick - last_charged_tick)` and dynamic rate streams
    /// `amount_provided * (last_chargeable_price_index - price_index_when_last_charged) / GIGAUNIT`. The charge is
    /// taken from the stream's deposit first and then from the free balance of the user. Whatever can't be paid is
    /// recorded as debt and flags the user as without funds. Returns the amount actually paid.
    pub(crate) fn do_charge_payment_streams(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
    ) -> Result<Balance, DispatchError> {
        let payment_account = self
            .get_payment_account(provider_id)
            .ok_or(Error::NotAProvider)?;
        let chargeable = self
            .state
            .payment_streams
            .last_chargeable_info
            .get(provider_id)
            .copied()
            .ok_or(Error::ProviderInconsistencyError)?;

        let key = (*provider_id, user_account.clone());
        let fixed = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&key)
            .cloned();
        let dynamic = self
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .get(&key)
            .cloned();
        ensure!(
            fixed.is_some() || dynamic.is_some(),
            Error::PaymentStreamNotFound
        );

        let tick = self.current_tick();
        let mut total_paid: Balance = 0;
        let mut total_shortfall: Balance = 0;

        if let Some(mut stream) = fixed {
            // Calculate the time passed between the last chargeable tick and the last charged tick
            let ticks = chargeable
                .last_chargeable_tick
                .checked_sub(stream.last_charged_tick)
                .ok_or(Error::LastChargedGreaterThanLastChargeable)?;
            let amount_to_charge = stream
                .rate
                .checked_mul(ticks.into())
                .ok_or(Error::ChargeOverflow)?;

            let (paid, shortfall) =
                self.collect_payment(user_account, &payment_account, amount_to_charge, &mut stream.user_deposit)?;
            if shortfall > 0 {
                stream.outstanding_debt = stream.outstanding_debt.saturating_add(shortfall);
                stream.out_of_funds_tick.get_or_insert(tick);
            }
            stream.last_charged_tick = chargeable.last_chargeable_tick;

            total_paid = total_paid.saturating_add(paid);
            total_shortfall = total_shortfall.saturating_add(shortfall);
            self.state
                .payment_streams
                .fixed_rate_payment_streams
                .insert(key.clone(), stream);
        }

        if let Some(mut stream) = dynamic {
            ensure!(
                stream.last_charged_tick <= chargeable.last_chargeable_tick,
                Error::LastChargedGreaterThanLastChargeable
            );
            let price_index_delta = chargeable
                .price_index
                .checked_sub(stream.price_index_when_last_charged)
                .ok_or(Error::LastChargedGreaterThanLastChargeable)?;
            let amount_to_charge = Balance::from(stream.amount_provided)
                .checked_mul(price_index_delta)
                .ok_or(Error::ChargeOverflow)?
                / Balance::from(GIGAUNIT);

            let (paid, shortfall) =
                self.collect_payment(user_account, &payment_account, amount_to_charge, &mut stream.user_deposit)?;
            if shortfall > 0 {
                stream.outstanding_debt = stream.outstanding_debt.saturating_add(shortfall);
                stream.out_of_funds_tick.get_or_insert(tick);
            }
            stream.last_charged_tick = chargeable.last_chargeable_tick;
            stream.price_index_when_last_charged = chargeable.price_index;

            total_paid = total_paid.saturating_add(paid);
            total_shortfall = total_shortfall.saturating_add(shortfall);
            self.state
                .payment_streams
                .dynamic_rate_payment_streams
                .insert(key, stream);
        }

        if total_shortfall > 0 {
            self.flag_user_without_funds(user_account);
        }

        self.deposit_event(Event::PaymentStreamCharged {
            user_account: user_account.clone(),
            provider_id: *provider_id,
            amount: total_paid,
            last_tick_charged: chargeable.last_chargeable_tick,
            charged_at_tick: tick,
        });

        Ok(total_paid)
    }

    /// Moves `amount` from `user` to `payment_account`, first from `user_deposit` and then from
    /// the free balance, and sends the treasury its cut of what was paid.
    ///
    /// Returns what was paid and what is left unpaid.
    fn collect_payment(
        &mut self,
        user: &AccountId,
        payment_account: &AccountId,
        amount: Balance,
        user_deposit: &mut Balance,
    ) -> Result<(Balance, Balance), DispatchError> {
        if amount == 0 {
            return Ok((0, 0));
        }

        let paid_from_deposit = self.ledger.transfer_on_hold(
            &HoldReason::PaymentStreamDeposit,
            user,
            payment_account,
            amount.min(*user_deposit),
            Precision::BestEffort,
        )?;
        *user_deposit = user_deposit.saturating_sub(paid_from_deposit);

        let remaining = amount.saturating_sub(paid_from_deposit);
        let paid_from_free = if remaining > 0 {
            self.ledger
                .transfer(user, payment_account, remaining, Precision::BestEffort)?
        } else {
            0
        };

        let paid = paid_from_deposit.saturating_add(paid_from_free);
        self.transfer_treasury_cut(payment_account, paid)?;

        Ok((paid, amount.saturating_sub(paid)))
    }

    fn transfer_treasury_cut(&mut self, payment_account: &AccountId, paid: Balance) -> DispatchResult {
        let providers = &self.state.providers;
        let cut = self
            .config
            .payment_streams
            .treasury_cut_calculator()
            .calculate_treasury_cut(
                providers.total_bsps_capacity,
                providers.used_bsps_capacity,
                paid,
            );

        if cut > 0 {
            let treasury = self.config.treasury_account.clone();
            self.ledger
                .transfer(payment_account, &treasury, cut, Precision::BestEffort)?;
        }

        Ok(())
    }

    fn flag_user_without_funds(&mut self, user: &AccountId) {
        if self.is_user_without_funds(user) {
            return;
        }

        let tick = self.current_tick();
        self.state
            .payment_streams
            .users_without_funds
            .insert(user.clone(), tick);

        warn!(target: LOG_TARGET, "User {:?} is out of funds at tick {}", user, tick);
        self.deposit_event(Event::UserWithoutFunds {
            who: user.clone(),
            out_of_funds_tick: tick,
        });
    }

    pub(crate) fn do_pay_outstanding_debt(
        &mut self,
        user_account: &AccountId,
        providers: &[ProviderId],
    ) -> DispatchResult {
        let mut had_debt = false;

        for provider_id in providers {
            // Bring the debt up to date before paying it
            self.do_charge_payment_streams(provider_id, user_account)?;

            let payment_account = self
                .get_payment_account(provider_id)
                .ok_or(Error::NotAProvider)?;
            let key = (*provider_id, user_account.clone());

            if let Some(mut stream) = self
                .state
                .payment_streams
                .fixed_rate_payment_streams
                .get(&key)
                .cloned()
            {
                if stream.outstanding_debt > 0 {
                    had_debt = true;
                    let paid = self.pay_debt(user_account, &payment_account, stream.outstanding_debt)?;
                    stream.outstanding_debt -= paid;
                    if stream.outstanding_debt == 0 {
                        stream.out_of_funds_tick = None;
                    }
                    self.state
                        .payment_streams
                        .fixed_rate_payment_streams
                        .insert(key.clone(), stream);
                }
            }

            if let Some(mut stream) = self
                .state
                .payment_streams
                .dynamic_rate_payment_streams
                .get(&key)
                .cloned()
            {
                if stream.outstanding_debt > 0 {
                    had_debt = true;
                    let paid = self.pay_debt(user_account, &payment_account, stream.outstanding_debt)?;
                    stream.outstanding_debt -= paid;
                    if stream.outstanding_debt == 0 {
                        stream.out_of_funds_tick = None;
                    }
                    self.state
                        .payment_streams
                        .dynamic_rate_payment_streams
                        .insert(key, stream);
                }
            }
        }

        ensure!(had_debt, Error::NoDebtToPay);

        if self.user_has_debt(user_account) {
            self.deposit_event(Event::UserPaidSomeDebts {
                who: user_account.clone(),
            });
        } else {
            self.deposit_event(Event::UserPaidAllDebts {
                who: user_account.clone(),
            });
            self.clear_without_funds_flag(user_account);
        }

        Ok(())
    }

    fn pay_debt(
        &mut self,
        user: &AccountId,
        payment_account: &AccountId,
        debt: Balance,
    ) -> Result<Balance, DispatchError> {
        let paid = self
            .ledger
            .transfer(user, payment_account, debt, Precision::BestEffort)?;
        self.transfer_treasury_cut(payment_account, paid)?;
        Ok(paid)
    }

    fn user_has_debt(&self, user: &AccountId) -> bool {
        let state = &self.state.payment_streams;
        state
            .fixed_rate_payment_streams
            .iter()
            .any(|((_, account), stream)| account == user && stream.outstanding_debt > 0)
            || state
                .dynamic_rate_payment_streams
                .iter()
                .any(|((_, account), stream)| account == user && stream.outstanding_debt > 0)
    }

    fn clear_without_funds_flag(&mut self, user: &AccountId) {
        if self
            .state
            .payment_streams
            .users_without_funds
            .remove(user)
            .is_some()
        {
            debug!(target: LOG_TARGET, "User {:?} is solvent again", user);
            self.deposit_event(Event::UserSolvent { who: user.clone() });
        }
    }

    /// Uses what is left of the deposit of a removed stream to pay its debt and releases the
    /// rest. Debt that the deposit can't cover is dropped with the stream.
    fn settle_removed_stream(
        &mut self,
        provider_id: &ProviderId,
        user_account: &AccountId,
        user_deposit: Balance,
        outstanding_debt: Balance,
    ) -> DispatchResult {
        let mut remaining_deposit = user_deposit;
        if outstanding_debt > 0 {
            if let Some(payment_account) = self.get_payment_account(provider_id) {
                let paid = self.ledger.transfer_on_hold(
                    &HoldReason::PaymentStreamDeposit,
                    user_account,
                    &payment_account,
                    outstanding_debt.min(remaining_deposit),
                    Precision::BestEffort,
                )?;
                remaining_deposit = remaining_deposit.saturating_sub(paid);
            }
        }

        self.ledger.release(
            &HoldReason::PaymentStreamDeposit,
            user_account,
            remaining_deposit,
            Precision::BestEffort,
        )?;

        if !self.user_has_debt(user_account) {
            self.clear_without_funds_flag(user_account);
        }

        Ok(())
    }

    /// Removes every payment stream of a provider without charging them, releasing the
    /// deposits of its users.
    pub(crate) fn remove_payment_streams_of_provider(&mut self, provider_id: ProviderId) -> DispatchResult {
        let fixed: Vec<AccountId> = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .keys()
            .filter(|(provider, _)| *provider == provider_id)
            .map(|(_, user)| user.clone())
            .collect();
        for user_account in fixed {
            if let Some(stream) = self
                .state
                .payment_streams
                .fixed_rate_payment_streams
                .remove(&(provider_id, user_account.clone()))
            {
                self.ledger.release(
                    &HoldReason::PaymentStreamDeposit,
                    &user_account,
                    stream.user_deposit,
                    Precision::BestEffort,
                )?;
                if !self.user_has_debt(&user_account) {
                    self.clear_without_funds_flag(&user_account);
                }
                self.deposit_event(Event::FixedRatePaymentStreamDeleted {
                    user_account,
                    provider_id,
                });
            }
        }

        let dynamic: Vec<AccountId> = self
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .keys()
            .filter(|(provider, _)| *provider == provider_id)
            .map(|(_, user)| user.clone())
            .collect();
        for user_account in dynamic {
            if let Some(stream) = self
                .state
                .payment_streams
                .dynamic_rate_payment_streams
                .remove(&(provider_id, user_account.clone()))
            {
                self.ledger.release(
                    &HoldReason::PaymentStreamDeposit,
                    &user_account,
                    stream.user_deposit,
                    Precision::BestEffort,
                )?;
                if !self.user_has_debt(&user_account) {
                    self.clear_without_funds_flag(&user_account);
                }
                self.deposit_event(Event::DynamicRatePaymentStreamDeleted {
                    user_account,
                    provider_id,
                });
            }
        }

        Ok(())
    }

    pub fn provider_has_payment_streams(&self, provider_id: &ProviderId) -> bool {
        let state = &self.state.payment_streams;
        state
            .fixed_rate_payment_streams
            .keys()
            .any(|(provider, _)| provider == provider_id)
            || state
                .dynamic_rate_payment_streams
                .keys()
                .any(|(provider, _)| provider == provider_id)
    }

    /// What a user owes a provider if it were charged now: accrued charges plus outstanding debt.
    pub(crate) fn calculate_unpaid_amount(
        &self,
        provider_id: &ProviderId,
        user_account: &AccountId,
    ) -> Result<Balance, DispatchError> {
        let chargeable = self.chargeable_info_or_now(provider_id);
        let key = (*provider_id, user_account.clone());
        let state = &self.state.payment_streams;
        let mut unpaid: Balance = 0;

        if let Some(stream) = state.fixed_rate_payment_streams.get(&key) {
            let ticks = chargeable
                .last_chargeable_tick
                .saturating_sub(stream.last_charged_tick);
            let accrued = stream
                .rate
                .checked_mul(ticks.into())
                .ok_or(Error::ChargeOverflow)?;
            unpaid = unpaid
                .saturating_add(accrued)
                .saturating_add(stream.outstanding_debt);
        }

        if let Some(stream) = state.dynamic_rate_payment_streams.get(&key) {
            let delta = chargeable
                .price_index
                .saturating_sub(stream.price_index_when_last_charged);
            let accrued = Balance::from(stream.amount_provided)
                .checked_mul(delta)
                .ok_or(Error::ChargeOverflow)?
                / Balance::from(GIGAUNIT);
            unpaid = unpaid
                .saturating_add(accrued)
                .saturating_add(stream.outstanding_debt);
        }

        Ok(unpaid)
    }

    fn fixed_rate_stream_deposit(&self, rate: Balance) -> Result<Balance, DispatchError> {
        Ok(rate
            .checked_mul(self.config.payment_streams.new_stream_deposit.into())
            .ok_or(Error::ChargeOverflow)?)
    }

    fn dynamic_rate_stream_deposit(&self, amount_provided: StorageData) -> Result<Balance, DispatchError> {
        let price = self.state.payment_streams.current_price_per_giga_unit_per_tick;
        let per_tick = Balance::from(amount_provided)
            .checked_mul(price)
            .ok_or(Error::ChargeOverflow)?
            / Balance::from(GIGAUNIT);
        Ok(per_tick
            .checked_mul(self.config.payment_streams.new_stream_deposit.into())
            .ok_or(Error::ChargeOverflow)?)
    }

    fn hold_stream_deposit(&mut self, user_account: &AccountId, deposit: Balance) -> DispatchResult {
        // Check that the user has enough balance to pay the deposit
        ensure!(
            self.ledger.free_balance(user_account) >= deposit,
            Error::CannotHoldDeposit
        );
        self.ledger
            .hold(&HoldReason::PaymentStreamDeposit, user_account, deposit)
            .map_err(|_| Error::CannotHoldDeposit)?;
        Ok(())
    }

    /// Holds or releases funds so that a stream's deposit becomes `target`. Returns the new deposit.
    fn adjust_stream_deposit(
        &mut self,
        user_account: &AccountId,
        current: Balance,
        target: Balance,
    ) -> Result<Balance, DispatchError> {
        if target > current {
            self.hold_stream_deposit(user_account, target - current)?;
        } else if current > target {
            self.ledger.release(
                &HoldReason::PaymentStreamDeposit,
                user_account,
                current - target,
                Precision::BestEffort,
            )?;
        }
        Ok(target)
    }

    fn chargeable_info_or_now(&self, provider_id: &ProviderId) -> ProviderLastChargeableInfo {
        self.state
            .payment_streams
            .last_chargeable_info
            .get(provider_id)
            .copied()
            .unwrap_or(ProviderLastChargeableInfo {
                last_chargeable_tick: self.current_tick(),
                price_index: self.state.payment_streams.accumulated_price_index,
            })
    }

    pub(crate) fn initialise_last_chargeable_info(&mut self, provider_id: ProviderId) {
        let info = ProviderLastChargeableInfo {
            last_chargeable_tick: self.current_tick(),
            price_index: self.state.payment_streams.accumulated_price_index,
        };
        self.state
            .payment_streams
            .last_chargeable_info
            .insert(provider_id, info);
    }

    pub(crate) fn remove_last_chargeable_info(&mut self, provider_id: ProviderId) {
        self.state
            .payment_streams
            .last_chargeable_info
            .remove(&provider_id);
    }

    /// Moves forward up to where a provider can charge its users. Neither the tick nor the price
    /// index can go backwards, and the tick can't be in the future.
    pub(crate) fn update_last_chargeable_info(
        &mut self,
        provider_id: ProviderId,
        last_chargeable_tick: TickNumber,
        price_index: PriceIndex,
    ) -> DispatchResult {
        let current = self
            .state
            .payment_streams
            .last_chargeable_info
            .get(&provider_id)
            .copied()
            .unwrap_or_default();

        ensure!(
            last_chargeable_tick >= current.last_chargeable_tick
                && last_chargeable_tick <= self.current_tick(),
            Error::InvalidLastChargeableBlockNumber
        );
        ensure!(
            price_index >= current.price_index,
            Error::InvalidLastChargeablePriceIndex
        );

        self.state.payment_streams.last_chargeable_info.insert(
            provider_id,
            ProviderLastChargeableInfo {
                last_chargeable_tick,
                price_index,
            },
        );

        self.deposit_event(Event::LastChargeableInfoUpdated {
            provider_id,
            last_chargeable_tick,
            last_chargeable_price_index: price_index,
        });

        Ok(())
    }

    /// Accumulates the price of this tick into the price index, moves the price for the next
    /// tick along the utilisation curve and lets every solvent MSP charge up to now.
    pub(crate) fn payment_streams_on_poll(&mut self) {
        let tick = self.current_tick();
        let used = self.state.providers.used_bsps_capacity;
        let total = self.state.providers.total_bsps_capacity;

        let state = &mut self.state.payment_streams;
        state.accumulated_price_index = state
            .accumulated_price_index
            .saturating_add(state.current_price_per_giga_unit_per_tick);
        state.current_price_per_giga_unit_per_tick = self
            .config
            .payment_streams
            .price_updater()
            .update_storage_price(state.current_price_per_giga_unit_per_tick, used, total);

        let price_index = state.accumulated_price_index;
        let msps: Vec<ProviderId> = self
            .state
            .providers
            .main_storage_providers
            .keys()
            .filter(|msp_id| !self.state.providers.insolvent_providers.contains(msp_id))
            .copied()
            .collect();
        for msp_id in msps {
            self.state.payment_streams.last_chargeable_info.insert(
                msp_id,
                ProviderLastChargeableInfo {
                    last_chargeable_tick: tick,
                    price_index,
                },
            );
        }
    }
}
