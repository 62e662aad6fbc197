//! # Storage Providers
//!
//! Registry of Main Storage Providers (MSPs) and Backup Storage Providers (BSPs).
//!
//! A provider signs up in two steps: it first requests to sign up, which holds the deposit its
//! capacity requires, and then confirms the request once the randomness of the request tick is
//! known. The provider id is derived from that randomness, so it can't be chosen in advance.
//!
//! The held deposit is the stake of the provider. Failing to submit proofs of storage makes a
//! provider slashable; once slashed below what its capacity requires it has
//! `ProviderTopUpTtl` ticks to top up its deposit or it becomes insolvent.
//!
//! Buckets also live in this registry, since their root and size are part of the state the MSP
//! storing them is accountable for.

use std::collections::{BTreeMap, BTreeSet};

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use thiserror::Error;

use crate::{
    ensure_signed,
    error::DispatchResult,
    types::{
        AccountId, Balance, BucketId, MerkleHash, MultiAddress, Origin, ProviderId,
        ReputationWeight, StorageData, StorageProviderId, TickNumber, ValuePropId,
    },
    Ledger, Runtime,
};

pub mod types;
mod utils;


pub use types::*;

pub(crate) const LOG_TARGET: &str = "runtime::providers";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvidersState {
    pub sign_up_requests: BTreeMap<AccountId, SignUpRequest>,
    pub account_id_to_main_storage_provider_id: BTreeMap<AccountId, ProviderId>,
    pub account_id_to_backup_storage_provider_id: BTreeMap<AccountId, ProviderId>,
    pub main_storage_providers: BTreeMap<ProviderId, MainStorageProvider>,
    pub backup_storage_providers: BTreeMap<ProviderId, BackupStorageProvider>,
    pub main_storage_provider_ids_to_value_propositions:
        BTreeMap<ProviderId, BTreeMap<ValuePropId, ValueProposition>>,
    pub buckets: BTreeMap<BucketId, Bucket>,
    pub main_storage_provider_ids_to_buckets: BTreeMap<ProviderId, BTreeSet<BucketId>>,
    pub total_bsps_capacity: StorageData,
    pub used_bsps_capacity: StorageData,
    pub global_bsps_reputation_weight: ReputationWeight,
    pub awaiting_top_up_from_providers: BTreeMap<ProviderId, TopUpMetadata>,
    /// Providers whose grace period to top up ends at a given tick.
    pub provider_top_up_expirations: BTreeMap<TickNumber, Vec<ProviderId>>,
    pub insolvent_providers: BTreeSet<ProviderId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Event {
    /// An MSP requested to sign up. The request has to be confirmed with `confirm_sign_up`.
    MspRequestSignUpSuccess {
        who: AccountId,
        multiaddresses: Vec<MultiAddress>,
        capacity: StorageData,
    },
    MspSignUpSuccess {
        who: AccountId,
        msp_id: ProviderId,
        multiaddresses: Vec<MultiAddress>,
        capacity: StorageData,
        value_prop_id: ValuePropId,
        value_prop: ValueProposition,
    },
    /// A BSP requested to sign up. The request has to be confirmed with `confirm_sign_up`.
    BspRequestSignUpSuccess {
        who: AccountId,
        multiaddresses: Vec<MultiAddress>,
        capacity: StorageData,
    },
    BspSignUpSuccess {
        who: AccountId,
        bsp_id: ProviderId,
        root: MerkleHash,
        multiaddresses: Vec<MultiAddress>,
        capacity: StorageData,
    },
    SignUpRequestCanceled {
        who: AccountId,
    },
    MspSignOffSuccess {
        who: AccountId,
        msp_id: ProviderId,
    },
    BspSignOffSuccess {
        who: AccountId,
        bsp_id: ProviderId,
    },
    CapacityChanged {
        who: AccountId,
        provider_id: StorageProviderId,
        old_capacity: StorageData,
        new_capacity: StorageData,
        next_tick_when_change_allowed: TickNumber,
    },
    ValuePropAdded {
        msp_id: ProviderId,
        value_prop_id: ValuePropId,
        value_prop: ValueProposition,
    },
    ValuePropUnavailable {
        msp_id: ProviderId,
        value_prop_id: ValuePropId,
    },
    MultiAddressAdded {
        provider_id: ProviderId,
        new_multiaddress: MultiAddress,
    },
    MultiAddressRemoved {
        provider_id: ProviderId,
        removed_multiaddress: MultiAddress,
    },
    Slashed {
        provider_id: ProviderId,
        amount: Balance,
    },
    /// The deposit of a provider fell below what its capacity requires.
    AwaitingTopUp {
        provider_id: ProviderId,
        top_up_metadata: TopUpMetadata,
    },
    TopUpFulfilled {
        provider_id: ProviderId,
        amount: Balance,
    },
    ProviderInsolvent {
        provider_id: ProviderId,
    },
    /// The buckets of an MSP that became insolvent, which are now not stored by any MSP.
    BucketsOfInsolventMsp {
        msp_id: ProviderId,
        buckets: Vec<BucketId>,
    },
    MspDeleted {
        provider_id: ProviderId,
    },
    BspDeleted {
        provider_id: ProviderId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("account is already registered as a provider")]
    AlreadyRegistered,
    #[error("account has a pending sign up request")]
    SignUpRequestPending,
    #[error("sign up request does not exist")]
    SignUpRequestDoesNotExist,
    #[error("sign up request expired before being confirmed")]
    SignUpRequestExpired,
    #[error("randomness of the request tick is not available yet")]
    RandomnessNotValidYet,
    #[error("no multiaddress was provided")]
    NoMultiAddress,
    #[error("too many multiaddresses")]
    TooManyMultiAddresses,
    #[error("multiaddress already registered for this provider")]
    MultiAddressAlreadyExists,
    #[error("multiaddress not found")]
    MultiAddressNotFound,
    #[error("the last multiaddress of a provider can't be removed")]
    LastMultiAddressCantBeRemoved,
    #[error("capacity is below the minimum")]
    StorageTooLow,
    #[error("not enough free balance for the deposit")]
    NotEnoughBalance,
    #[error("failed to hold the deposit")]
    CannotHoldDeposit,
    #[error("provider still stores data")]
    StorageStillInUse,
    #[error("MSP still stores buckets")]
    MspStillHasBuckets,
    #[error("new capacity can't be zero")]
    NewCapacityCantBeZero,
    #[error("new capacity equals the current capacity")]
    NewCapacityEqualsCurrentCapacity,
    #[error("new capacity is less than the used storage")]
    NewCapacityLessThanUsedStorage,
    #[error("not enough time passed since the last capacity change")]
    NotEnoughTimePassed,
    #[error("new used capacity exceeds the capacity of the provider")]
    NewUsedCapacityExceedsStorageCapacity,
    #[error("account is not a registered provider")]
    NotRegistered,
    #[error("provider is not an MSP")]
    NotMsp,
    #[error("provider is not a BSP")]
    NotBsp,
    #[error("provider is not slashable")]
    ProviderNotSlashable,
    #[error("provider does not need to top up its deposit")]
    TopUpNotRequired,
    #[error("operation not allowed for an insolvent provider")]
    OperationNotAllowedForInsolventProvider,
    #[error("provider does not meet the conditions to be deleted")]
    DeleteProviderConditionsNotMet,
    #[error("value proposition already exists")]
    ValuePropositionAlreadyExists,
    #[error("value proposition not found")]
    ValuePropositionNotFound,
    #[error("value proposition is already unavailable")]
    ValuePropositionAlreadyUnavailable,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("MSP reached the maximum amount of buckets")]
    MaxBucketsReached,
    #[error("inconsistent providers state")]
    InconsistentState,
}

impl<L: Ledger> Runtime<L> {
    /// Requests to sign up as a Main Storage Provider, offering a first value proposition.
    ///
    /// The deposit for `capacity` is held right away and the request has to be confirmed with
    /// [`Self::confirm_sign_up`] within `MaxTicksForRandomness` ticks.
    ///
    /// Emits `MspRequestSignUpSuccess` event when successful.
    pub fn request_msp_sign_up(
        &mut self,
        origin: Origin,
        capacity: StorageData,
        multiaddresses: Vec<MultiAddress>,
        value_prop_price_per_giga_unit_of_data_per_tick: Balance,
        commitment: Vec<u8>,
        value_prop_max_data_limit: StorageData,
        payment_account: AccountId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let tick = rt.current_tick();
            let msp_info = MainStorageProvider {
                capacity,
                capacity_used: 0,
                multiaddresses: multiaddresses.clone(),
                amount_of_buckets: 0,
                amount_of_value_props: 0,
                last_capacity_change: tick,
                owner_account: who.clone(),
                payment_account,
                sign_up_tick: tick,
            };
            let value_prop = ValueProposition::new(
                value_prop_price_per_giga_unit_of_data_per_tick,
                commitment,
                value_prop_max_data_limit,
            );

            rt.do_request_msp_sign_up(msp_info, value_prop)?;

            rt.deposit_event(Event::MspRequestSignUpSuccess {
                who,
                multiaddresses,
                capacity,
            });

            Ok(())
        })
    }

    /// Requests to sign up as a Backup Storage Provider.
    ///
    /// Emits `BspRequestSignUpSuccess` event when successful.
    pub fn request_bsp_sign_up(
        &mut self,
        origin: Origin,
        capacity: StorageData,
        multiaddresses: Vec<MultiAddress>,
        payment_account: AccountId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let tick = rt.current_tick();
            let bsp_info = BackupStorageProvider {
                capacity,
                capacity_used: 0,
                multiaddresses: multiaddresses.clone(),
                root: crate::forest::default_forest_root(),
                last_capacity_change: tick,
                owner_account: who.clone(),
                payment_account,
                reputation_weight: rt.config.providers.starting_reputation_weight,
                sign_up_tick: tick,
            };

            rt.do_request_bsp_sign_up(bsp_info)?;

            rt.deposit_event(Event::BspRequestSignUpSuccess {
                who,
                multiaddresses,
                capacity,
            });

            Ok(())
        })
    }

    /// Confirms the sign up request of `provider_account`, or of the caller if `None`.
    ///
    /// Anyone can confirm a request. The provider id is derived from the account and the
    /// randomness of the tick after the request.
    ///
    /// Emits `MspSignUpSuccess` or `BspSignUpSuccess` event when successful.
    pub fn confirm_sign_up(
        &mut self,
        origin: Origin,
        provider_account: Option<AccountId>,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;
        let provider_account = provider_account.unwrap_or(who);

        self.transactional(|rt| rt.do_confirm_sign_up(&provider_account))
    }

    /// Cancels the pending sign up request of the caller, releasing its deposit.
    ///
    /// Emits `SignUpRequestCanceled` event when successful.
    pub fn cancel_sign_up(&mut self, origin: Origin) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_cancel_sign_up(&who)?;
            rt.deposit_event(Event::SignUpRequestCanceled { who });
            Ok(())
        })
    }

    /// Signs off an MSP that stores no data and no buckets, releasing its deposit.
    ///
    /// Emits `MspSignOffSuccess` event when successful.
    pub fn msp_sign_off(&mut self, origin: Origin, msp_id: ProviderId) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_msp_sign_off(&who, msp_id)?;
            rt.deposit_event(Event::MspSignOffSuccess { who, msp_id });
            Ok(())
        })
    }

    /// Signs off a BSP that stores no data, releasing its deposit.
    ///
    /// Emits `BspSignOffSuccess` event when successful.
    pub fn bsp_sign_off(&mut self, origin: Origin) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let bsp_id = rt.do_bsp_sign_off(&who)?;
            rt.deposit_event(Event::BspSignOffSuccess { who, bsp_id });
            Ok(())
        })
    }

    /// Changes the capacity of the caller's provider, holding or releasing the difference in
    /// deposit. Can only happen every `MinTicksBetweenCapacityChanges` ticks.
    ///
    /// Emits `CapacityChanged` event when successful.
    pub fn change_capacity(&mut self, origin: Origin, new_capacity: StorageData) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_change_capacity(&who, new_capacity))
    }

    /// Adds a new value proposition to the caller's MSP.
    ///
    /// Emits `ValuePropAdded` event when successful.
    pub fn add_value_prop(
        &mut self,
        origin: Origin,
        price_per_giga_unit_of_data_per_tick: Balance,
        commitment: Vec<u8>,
        bucket_data_limit: StorageData,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let value_prop = ValueProposition::new(
                price_per_giga_unit_of_data_per_tick,
                commitment,
                bucket_data_limit,
            );
            let (msp_id, value_prop_id) = rt.do_add_value_prop(&who, value_prop.clone())?;

            rt.deposit_event(Event::ValuePropAdded {
                msp_id,
                value_prop_id,
                value_prop,
            });

            Ok(())
        })
    }

    /// Makes a value proposition of the caller's MSP unavailable for new buckets.
    ///
    /// Emits `ValuePropUnavailable` event when successful.
    pub fn make_value_prop_unavailable(
        &mut self,
        origin: Origin,
        value_prop_id: ValuePropId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let msp_id = rt.do_make_value_prop_unavailable(&who, value_prop_id)?;
            rt.deposit_event(Event::ValuePropUnavailable {
                msp_id,
                value_prop_id,
            });
            Ok(())
        })
    }

    /// Emits `MultiAddressAdded` event when successful.
    pub fn add_multiaddress(
        &mut self,
        origin: Origin,
        new_multiaddress: MultiAddress,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let provider_id = rt.do_add_multiaddress(&who, new_multiaddress.clone())?;
            rt.deposit_event(Event::MultiAddressAdded {
                provider_id,
                new_multiaddress,
            });
            Ok(())
        })
    }

    /// Emits `MultiAddressRemoved` event when successful.
    pub fn remove_multiaddress(
        &mut self,
        origin: Origin,
        multiaddress: MultiAddress,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let provider_id = rt.do_remove_multiaddress(&who, &multiaddress)?;
            rt.deposit_event(Event::MultiAddressRemoved {
                provider_id,
                removed_multiaddress: multiaddress,
            });
            Ok(())
        })
    }

    /// Slashes a provider that failed to submit proofs of storage.
    ///
    /// Anyone can call it. The slashed amount goes from the deposit of the provider to the
    /// treasury and, if what is left is not enough for its capacity, the provider is given
    /// `ProviderTopUpTtl` ticks to top up.
    ///
    /// Emits `Slashed` and, if the provider has to top up, `AwaitingTopUp`.
    pub fn slash(&mut self, origin: Origin, provider_id: ProviderId) -> DispatchResult {
        ensure_signed(origin)?;

        self.transactional(|rt| rt.do_slash(provider_id))
    }

    /// Tops up the deposit of the caller's provider to what its capacity requires.
    ///
    /// Emits `TopUpFulfilled` event when successful.
    pub fn top_up_deposit(&mut self, origin: Origin) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_top_up_deposit(&who))
    }

    /// Deletes an insolvent provider without payment streams. Anyone can call it.
    ///
    /// Emits `MspDeleted` or `BspDeleted` event when successful.
    pub fn delete_provider(&mut self, origin: Origin, provider_id: ProviderId) -> DispatchResult {
        ensure_signed(origin)?;

        self.transactional(|rt| rt.do_delete_provider(provider_id))
    }
}
