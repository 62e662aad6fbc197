//! # Payment Streams
//!
//! Billing of users by storage providers. Every (provider, user) pair can have one fixed rate
//! stream (an MSP storing buckets of the user) and one dynamic rate stream (a BSP storing files
//! of the user).
//!
//! - Fixed rate streams charge `rate` per tick.
//! - Dynamic rate streams charge `amount_provided` times the increase of the accumulated price
//!   index, which grows every tick by the current price of a giga-unit of data. The price follows
//!   the utilisation of the BSPs' capacity.
//!
//! A provider can only charge up to its [`ProviderLastChargeableInfo`]. A charge that the user
//! can't pay is not reverted: the missing amount is recorded as debt and the user is flagged as
//! without funds, which blocks new storage requests until the debt is paid.

use std::collections::{BTreeMap, BTreeSet};

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use thiserror::Error;

use crate::{
    ensure_root, ensure_signed,
    error::{DispatchError, DispatchResult},
    types::{AccountId, Balance, Origin, PriceIndex, ProviderId, StorageData, TickNumber},
    Ledger, Runtime,
};

pub mod types;
mod utils;

#[cfg(test)]
mod tests;

pub use types::*;

pub(crate) const LOG_TARGET: &str = "runtime::payment_streams";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymentStreamsState {
    pub fixed_rate_payment_streams: BTreeMap<(ProviderId, AccountId), FixedRatePaymentStream>,
    pub dynamic_rate_payment_streams: BTreeMap<(ProviderId, AccountId), DynamicRatePaymentStream>,
    pub last_chargeable_info: BTreeMap<ProviderId, ProviderLastChargeableInfo>,
    pub accumulated_price_index: PriceIndex,
    pub current_price_per_giga_unit_per_tick: Balance,
    /// Users that could not pay a charge, with the tick they were flagged in.
    pub users_without_funds: BTreeMap<AccountId, TickNumber>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Event {
    FixedRatePaymentStreamCreated {
        user_account: AccountId,
        provider_id: ProviderId,
        rate: Balance,
    },
    FixedRatePaymentStreamUpdated {
        user_account: AccountId,
        provider_id: ProviderId,
        new_rate: Balance,
    },
    FixedRatePaymentStreamDeleted {
        user_account: AccountId,
        provider_id: ProviderId,
    },
    DynamicRatePaymentStreamCreated {
        user_account: AccountId,
        provider_id: ProviderId,
        amount_provided: StorageData,
    },
    DynamicRatePaymentStreamUpdated {
        user_account: AccountId,
        provider_id: ProviderId,
        new_amount_provided: StorageData,
    },
    DynamicRatePaymentStreamDeleted {
        user_account: AccountId,
        provider_id: ProviderId,
    },
    /// The payment streams between a provider and a user were charged.
    PaymentStreamCharged {
        user_account: AccountId,
        provider_id: ProviderId,
        amount: Balance,
        last_tick_charged: TickNumber,
        charged_at_tick: TickNumber,
    },
    UsersCharged {
        user_accounts: Vec<AccountId>,
        provider_id: ProviderId,
        charged_at_tick: TickNumber,
    },
    LastChargeableInfoUpdated {
        provider_id: ProviderId,
        last_chargeable_tick: TickNumber,
        last_chargeable_price_index: PriceIndex,
    },
    /// A user could not pay a charge in full and is now flagged as without funds.
    UserWithoutFunds {
        who: AccountId,
        out_of_funds_tick: TickNumber,
    },
    UserPaidAllDebts {
        who: AccountId,
    },
    UserPaidSomeDebts {
        who: AccountId,
    },
    /// A user flagged as without funds has no debt left.
    UserSolvent {
        who: AccountId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("payment stream already exists")]
    PaymentStreamAlreadyExists,
    #[error("payment stream not found")]
    PaymentStreamNotFound,
    #[error("account is not a provider")]
    NotAProvider,
    #[error("provider has no chargeable info")]
    ProviderInconsistencyError,
    #[error("failed to hold the payment stream deposit")]
    CannotHoldDeposit,
    #[error("new rate equals the current rate")]
    UpdateRateToSameRate,
    #[error("new amount provided equals the current amount provided")]
    UpdateAmountToSameAmount,
    #[error("rate can't be zero")]
    RateCantBeZero,
    #[error("amount provided can't be zero")]
    AmountProvidedCantBeZero,
    #[error("last charged tick is greater than the last chargeable tick")]
    LastChargedGreaterThanLastChargeable,
    #[error("last chargeable tick can't go backwards or into the future")]
    InvalidLastChargeableBlockNumber,
    #[error("last chargeable price index can't go backwards")]
    InvalidLastChargeablePriceIndex,
    #[error("charge overflows")]
    ChargeOverflow,
    #[error("user is flagged as without funds")]
    UserWithoutFunds,
    #[error("too many users to charge in one call")]
    TooManyUsersToCharge,
    #[error("user has no debt with the given providers")]
    NoDebtToPay,
}

impl<L: Ledger> Runtime<L> {
    /// Creates a fixed rate payment stream from `user_account` to `provider_id`.
    ///
    /// Emits `FixedRatePaymentStreamCreated` event when successful.
    pub fn create_fixed_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
        rate: Balance,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| rt.do_create_fixed_rate_payment_stream(&provider_id, &user_account, rate))
    }

    /// Emits `FixedRatePaymentStreamUpdated` event when successful.
    pub fn update_fixed_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
        new_rate: Balance,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| {
            rt.do_update_fixed_rate_payment_stream(&provider_id, &user_account, new_rate)
        })
    }

    /// Emits `FixedRatePaymentStreamDeleted` event when successful.
    pub fn delete_fixed_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| rt.do_delete_fixed_rate_payment_stream(&provider_id, &user_account))
    }

    /// Emits `DynamicRatePaymentStreamCreated` event when successful.
    pub fn create_dynamic_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
        amount_provided: StorageData,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| {
            rt.do_create_dynamic_rate_payment_stream(&provider_id, &user_account, amount_provided)
        })
    }

    /// Emits `DynamicRatePaymentStreamUpdated` event when successful.
    pub fn update_dynamic_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
        new_amount_provided: StorageData,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| {
            rt.do_update_dynamic_rate_payment_stream(&provider_id, &user_account, new_amount_provided)
        })
    }

    /// Emits `DynamicRatePaymentStreamDeleted` event when successful.
    pub fn delete_dynamic_rate_payment_stream(
        &mut self,
        origin: Origin,
        provider_id: ProviderId,
        user_account: AccountId,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| {
            rt.do_delete_dynamic_rate_payment_stream(&provider_id, &user_account)
        })
    }

    /// Charges the payment streams between the caller's provider and `user_account`, up to the
    /// provider's last chargeable tick and price index.
    ///
    /// Emits `PaymentStreamCharged` event when successful, and `UserWithoutFunds` if the user
    /// could not pay the charge in full.
    pub fn charge_payment_streams(
        &mut self,
        origin: Origin,
        user_account: AccountId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let provider_id = rt
                .get_provider_id_of(&who)
                .ok_or(Error::NotAProvider)?
                .id();
            rt.do_charge_payment_streams(&provider_id, &user_account)?;
            Ok(())
        })
    }

    /// Charges the payment streams between the caller's provider and each of `user_accounts`.
    ///
    /// Emits `UsersCharged` event when successful.
    pub fn charge_multiple_users_payment_streams(
        &mut self,
        origin: Origin,
        user_accounts: Vec<AccountId>,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let provider_id = rt
                .get_provider_id_of(&who)
                .ok_or(Error::NotAProvider)?
                .id();

            if user_accounts.len() > rt.config.payment_streams.max_users_to_charge as usize {
                return Err(Error::TooManyUsersToCharge.into());
            }

            for user_account in &user_accounts {
                rt.do_charge_payment_streams(&provider_id, user_account)?;
            }

            rt.deposit_event(Event::UsersCharged {
                user_accounts,
                provider_id,
                charged_at_tick: rt.current_tick(),
            });

            Ok(())
        })
    }

    /// Pays the outstanding debt of the caller with each of `providers`.
    ///
    /// Emits `UserPaidAllDebts` and `UserSolvent` when no debt is left, or `UserPaidSomeDebts`.
    pub fn pay_outstanding_debt(
        &mut self,
        origin: Origin,
        providers: Vec<ProviderId>,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_pay_outstanding_debt(&who, &providers))
    }

    pub fn get_users_of_payment_streams_of_provider(&self, provider_id: &ProviderId) -> Vec<AccountId> {
        let state = &self.state.payment_streams;
        let fixed = state
            .fixed_rate_payment_streams
            .keys()
            .filter(|(provider, _)| provider == provider_id);
        let dynamic = state
            .dynamic_rate_payment_streams
            .keys()
            .filter(|(provider, _)| provider == provider_id);

        fixed
            .chain(dynamic)
            .map(|(_, user)| user.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get_current_price_per_giga_unit_per_tick(&self) -> Balance {
        self.state
            .payment_streams
            .current_price_per_giga_unit_per_tick
    }

    /// Users whose unpaid amount with `provider_id` (accrued charges plus outstanding debt) is
    /// above `threshold`.
    pub fn get_users_with_debt_over_threshold(
        &self,
        provider_id: &ProviderId,
        threshold: Balance,
    ) -> Result<Vec<AccountId>, DispatchError> {
        let mut debts: BTreeMap<AccountId, Balance> = BTreeMap::new();
        for user in self.get_users_of_payment_streams_of_provider(provider_id) {
            let debt = self.calculate_unpaid_amount(provider_id, &user)?;
            debts.insert(user, debt);
        }

        Ok(debts
            .into_iter()
            .filter(|(_, debt)| *debt > threshold)
            .map(|(user, _)| user)
            .collect())
    }

    pub fn is_user_without_funds(&self, user: &AccountId) -> bool {
        self.state
            .payment_streams
            .users_without_funds
            .contains_key(user)
    }
}
