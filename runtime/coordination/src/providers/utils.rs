use codec::Encode;
use log::{debug, warn};
use shp_traits::{HoldLedger, Precision};
use sp_runtime::traits::{BlakeTwo256, Hash};

use super::{Error, Event, LOG_TARGET};
use crate::{
    error::{ensure, expect_or_err, DispatchError, DispatchResult},
    providers::types::*,
    types::{
        hash_concat, AccountId, Balance, BucketId, HoldReason, MultiAddress, ProviderId,
        StorageData, StorageProviderId, TickNumber, ValuePropId,
    },
    Ledger, Runtime,
};

impl<L: Ledger> Runtime<L> {
    /// This function holds the logic that checks if a user can request to sign up as a Main Storage Provider
    /// and, if so, stores the request in the sign up requests.
    pub(crate) fn do_request_msp_sign_up(
        &mut self,
        msp_info: MainStorageProvider,
        value_prop: ValueProposition,
    ) -> DispatchResult {
        let who = msp_info.owner_account.clone();

        self.check_sign_up_request(&who, msp_info.capacity, &msp_info.multiaddresses)?;
        self.hold_sign_up_deposit(&who, msp_info.capacity)?;

        let request = SignUpRequest {
            sp_sign_up_request: SignUpRequestSpParams::MainStorageProvider(
                MainStorageProviderSignUpRequest {
                    msp_info,
                    value_prop,
                },
            ),
            at: self.current_tick(),
        };
        self.state.providers.sign_up_requests.insert(who, request);

        Ok(())
    }

    /// This function holds the logic that checks if a user can request to sign up as a Backup Storage Provider
    /// and, if so, stores the request in the sign up requests.
    pub(crate) fn do_request_bsp_sign_up(&mut self, bsp_info: BackupStorageProvider) -> DispatchResult {
        let who = bsp_info.owner_account.clone();

        self.check_sign_up_request(&who, bsp_info.capacity, &bsp_info.multiaddresses)?;
        self.hold_sign_up_deposit(&who, bsp_info.capacity)?;

        let request = SignUpRequest {
            sp_sign_up_request: SignUpRequestSpParams::BackupStorageProvider(bsp_info),
            at: self.current_tick(),
        };
        self.state.providers.sign_up_requests.insert(who, request);

        Ok(())
    }

    fn check_sign_up_request(
        &self,
        who: &AccountId,
        capacity: StorageData,
        multiaddresses: &[MultiAddress],
    ) -> DispatchResult {
        // Check that the account is not already registered either as a Main Storage Provider or a Backup Storage Provider
        ensure!(
            self.get_provider_id_of(who).is_none(),
            Error::AlreadyRegistered
        );

        // Check that the account hasn't requested to sign up before
        ensure!(
            !self.state.providers.sign_up_requests.contains_key(who),
            Error::SignUpRequestPending
        );

        // Check that the multiaddresses vector is not empty and not too long
        ensure!(!multiaddresses.is_empty(), Error::NoMultiAddress);
        ensure!(
            multiaddresses.len() <= self.config.providers.max_multi_addresses as usize,
            Error::TooManyMultiAddresses
        );

        // Check that the data to be stored is bigger than the minimum required by the runtime
        ensure!(
            capacity >= self.config.providers.sp_min_capacity,
            Error::StorageTooLow
        );

        Ok(())
    }

    fn hold_sign_up_deposit(&mut self, who: &AccountId, capacity: StorageData) -> DispatchResult {
        let deposit = self.compute_deposit_needed_for_capacity(capacity);

        // Check that the signer has enough funds to pay the deposit
        ensure!(
            self.ledger.free_balance(who) >= deposit,
            Error::NotEnoughBalance
        );

        self.ledger
            .hold(&HoldReason::StorageProviderDeposit, who, deposit)
            .map_err(|_| Error::CannotHoldDeposit)?;

        Ok(())
    }

    /// Deposit a provider has to keep held for `capacity`.
    pub fn compute_deposit_needed_for_capacity(&self, capacity: StorageData) -> Balance {
        let config = &self.config.providers;
        let capacity_over_minimum = capacity.saturating_sub(config.sp_min_capacity);
        config
            .sp_min_deposit
            .saturating_add(config.deposit_per_data.saturating_mul(capacity_over_minimum.into()))
    }

    pub(crate) fn do_confirm_sign_up(&mut self, who: &AccountId) -> DispatchResult {
        // Check that the account has a pending sign up request
        let request = self
            .state
            .providers
            .sign_up_requests
            .get(who)
            .cloned()
            .ok_or(Error::SignUpRequestDoesNotExist)?;

        let tick = self.current_tick();
        let randomness_tick = request.at.saturating_add(1);

        // Check that the randomness of the tick after the request is already known
        ensure!(tick >= randomness_tick, Error::RandomnessNotValidYet);

        // Check that the request has not expired
        ensure!(
            tick <= request
                .at
                .saturating_add(self.config.providers.max_ticks_for_randomness),
            Error::SignUpRequestExpired
        );

        let seed = self
            .randomness_at(randomness_tick)
            .ok_or(Error::RandomnessNotValidYet)?;

        // The requirements might have changed since the request was made
        let deposit = self.compute_deposit_needed_for_capacity(request.sp_sign_up_request.capacity());
        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        if deposit > held {
            self.ledger
                .hold(&HoldReason::StorageProviderDeposit, who, deposit - held)
                .map_err(|_| Error::NotEnoughBalance)?;
        }

        let provider_id = hash_concat(&[&who.encode()[..], seed.as_bytes()]);
        ensure!(
            self.get_provider(provider_id).is_none(),
            Error::AlreadyRegistered
        );

        match request.sp_sign_up_request {
            SignUpRequestSpParams::MainStorageProvider(MainStorageProviderSignUpRequest {
                mut msp_info,
                value_prop,
            }) => {
                let value_prop_id = value_prop.derive_id();
                msp_info.amount_of_value_props = 1;
                msp_info.sign_up_tick = tick;
                msp_info.last_capacity_change = tick;

                let providers = &mut self.state.providers;
                providers
                    .account_id_to_main_storage_provider_id
                    .insert(who.clone(), provider_id);
                providers
                    .main_storage_provider_ids_to_value_propositions
                    .entry(provider_id)
                    .or_default()
                    .insert(value_prop_id, value_prop.clone());
                providers
                    .main_storage_providers
                    .insert(provider_id, msp_info.clone());

                self.deposit_event(Event::MspSignUpSuccess {
                    who: who.clone(),
                    msp_id: provider_id,
                    multiaddresses: msp_info.multiaddresses,
                    capacity: msp_info.capacity,
                    value_prop_id,
                    value_prop,
                });
            }
            SignUpRequestSpParams::BackupStorageProvider(mut bsp_info) => {
                bsp_info.sign_up_tick = tick;
                bsp_info.last_capacity_change = tick;

                let providers = &mut self.state.providers;
                providers
                    .account_id_to_backup_storage_provider_id
                    .insert(who.clone(), provider_id);
                providers.total_bsps_capacity = providers
                    .total_bsps_capacity
                    .checked_add(bsp_info.capacity)
                    .ok_or(DispatchError::Arithmetic(
                        sp_runtime::ArithmeticError::Overflow,
                    ))?;
                providers.global_bsps_reputation_weight = providers
                    .global_bsps_reputation_weight
                    .saturating_add(bsp_info.reputation_weight);
                providers
                    .backup_storage_providers
                    .insert(provider_id, bsp_info.clone());

                self.deposit_event(Event::BspSignUpSuccess {
                    who: who.clone(),
                    bsp_id: provider_id,
                    root: bsp_info.root,
                    multiaddresses: bsp_info.multiaddresses,
                    capacity: bsp_info.capacity,
                });
            }
        }

        self.initialise_last_chargeable_info(provider_id);
        self.state.providers.sign_up_requests.remove(who);

        debug!(target: LOG_TARGET, "Provider {:?} signed up at tick {}", provider_id, tick);

        Ok(())
    }

    pub(crate) fn do_cancel_sign_up(&mut self, who: &AccountId) -> DispatchResult {
        // Check that the signer has requested to sign up
        ensure!(
            self.state.providers.sign_up_requests.remove(who).is_some(),
            Error::SignUpRequestDoesNotExist
        );

        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        self.ledger.release(
            &HoldReason::StorageProviderDeposit,
            who,
            held,
            Precision::Exact,
        )?;

        Ok(())
    }

    pub(crate) fn do_msp_sign_off(&mut self, who: &AccountId, msp_id: ProviderId) -> DispatchResult {
        // Check that the signer is the owner of the MSP
        let caller_msp_id = self.get_msp_id_of(who).ok_or(Error::NotRegistered)?;
        ensure!(caller_msp_id == msp_id, Error::NotRegistered);
        ensure!(
            !self.is_provider_insolvent(msp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        let msp = expect_or_err!(
            self.state.providers.main_storage_providers.get(&msp_id).cloned(),
            "MSP registered for an account should exist",
            Error::InconsistentState
        );

        // Check that the MSP does not store any data or bucket
        ensure!(msp.capacity_used == 0, Error::StorageStillInUse);
        ensure!(msp.amount_of_buckets == 0, Error::MspStillHasBuckets);

        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        self.ledger.release(
            &HoldReason::StorageProviderDeposit,
            who,
            held,
            Precision::BestEffort,
        )?;

        self.remove_msp(msp_id, who);

        Ok(())
    }

    pub(crate) fn do_bsp_sign_off(&mut self, who: &AccountId) -> Result<ProviderId, DispatchError> {
        let bsp_id = self.get_bsp_id_of(who).ok_or(Error::NotRegistered)?;
        ensure!(
            !self.is_provider_insolvent(bsp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        let bsp = expect_or_err!(
            self.state.providers.backup_storage_providers.get(&bsp_id).cloned(),
            "BSP registered for an account should exist",
            Error::InconsistentState
        );

        // Check that the BSP does not store any data
        ensure!(bsp.capacity_used == 0, Error::StorageStillInUse);

        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        self.ledger.release(
            &HoldReason::StorageProviderDeposit,
            who,
            held,
            Precision::BestEffort,
        )?;

        self.remove_bsp(bsp_id, &bsp);

        Ok(bsp_id)
    }

    fn remove_msp(&mut self, msp_id: ProviderId, owner: &AccountId) {
        let providers = &mut self.state.providers;
        providers.main_storage_providers.remove(&msp_id);
        providers.account_id_to_main_storage_provider_id.remove(owner);
        providers
            .main_storage_provider_ids_to_value_propositions
            .remove(&msp_id);
        providers.main_storage_provider_ids_to_buckets.remove(&msp_id);
        self.remove_last_chargeable_info(msp_id);
    }

    fn remove_bsp(&mut self, bsp_id: ProviderId, bsp: &BackupStorageProvider) {
        let providers = &mut self.state.providers;
        providers.backup_storage_providers.remove(&bsp_id);
        providers
            .account_id_to_backup_storage_provider_id
            .remove(&bsp.owner_account);
        providers.total_bsps_capacity = providers.total_bsps_capacity.saturating_sub(bsp.capacity);
        providers.used_bsps_capacity = providers
            .used_bsps_capacity
            .saturating_sub(bsp.capacity_used);
        providers.global_bsps_reputation_weight = providers
            .global_bsps_reputation_weight
            .saturating_sub(bsp.reputation_weight);
        self.stop_challenge_cycle(bsp_id);
        self.state.proofs_dealer.slashable_providers.remove(&bsp_id);
        self.remove_last_chargeable_info(bsp_id);
    }

    pub(crate) fn do_change_capacity(
        &mut self,
        who: &AccountId,
        new_capacity: StorageData,
    ) -> DispatchResult {
        // Check that the signer is registered as a provider and get its info
        let provider_id = self.get_provider_id_of(who).ok_or(Error::NotRegistered)?;
        let id = provider_id.id();
        ensure!(
            !self.is_provider_insolvent(id),
            Error::OperationNotAllowedForInsolventProvider
        );

        // Check that the new capacity is not zero (there are specific functions to sign off as a provider)
        ensure!(new_capacity != 0, Error::NewCapacityCantBeZero);

        let (old_capacity, capacity_used, last_capacity_change) =
            expect_or_err!(
                self.capacity_info(id),
                "Provider registered for an account should exist",
                Error::InconsistentState
            );

        // Check that the new capacity is different from the current capacity
        ensure!(
            new_capacity != old_capacity,
            Error::NewCapacityEqualsCurrentCapacity
        );

        // Check that enough time has passed since the last capacity change
        let tick = self.current_tick();
        let min_ticks = self.config.providers.min_ticks_between_capacity_changes;
        ensure!(
            tick >= last_capacity_change.saturating_add(min_ticks),
            Error::NotEnoughTimePassed
        );

        // Check that the new capacity is bigger than the minimum required by the runtime
        ensure!(
            new_capacity >= self.config.providers.sp_min_capacity,
            Error::StorageTooLow
        );

        // Check that the new capacity is bigger than the current used capacity by the provider
        ensure!(
            new_capacity >= capacity_used,
            Error::NewCapacityLessThanUsedStorage
        );

        // Hold or release the difference between the held deposit and the new one
        let new_deposit = self.compute_deposit_needed_for_capacity(new_capacity);
        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        if new_deposit > held {
            let difference = new_deposit - held;
            ensure!(
                self.ledger.free_balance(who) >= difference,
                Error::NotEnoughBalance
            );
            self.ledger
                .hold(&HoldReason::StorageProviderDeposit, who, difference)
                .map_err(|_| Error::CannotHoldDeposit)?;
        } else if held > new_deposit {
            self.ledger.release(
                &HoldReason::StorageProviderDeposit,
                who,
                held - new_deposit,
                Precision::Exact,
            )?;
        }

        let providers = &mut self.state.providers;
        match provider_id {
            StorageProviderId::MainStorageProvider(msp_id) => {
                if let Some(msp) = providers.main_storage_providers.get_mut(&msp_id) {
                    msp.capacity = new_capacity;
                    msp.last_capacity_change = tick;
                }
            }
            StorageProviderId::BackupStorageProvider(bsp_id) => {
                if let Some(bsp) = providers.backup_storage_providers.get_mut(&bsp_id) {
                    bsp.capacity = new_capacity;
                    bsp.last_capacity_change = tick;
                }
                providers.total_bsps_capacity = providers
                    .total_bsps_capacity
                    .saturating_sub(old_capacity)
                    .saturating_add(new_capacity);
            }
        }

        self.deposit_event(Event::CapacityChanged {
            who: who.clone(),
            provider_id,
            old_capacity,
            new_capacity,
            next_tick_when_change_allowed: tick.saturating_add(min_ticks),
        });

        Ok(())
    }

    fn capacity_info(&self, provider_id: ProviderId) -> Option<(StorageData, StorageData, TickNumber)> {
        let providers = &self.state.providers;
        if let Some(msp) = providers.main_storage_providers.get(&provider_id) {
            return Some((msp.capacity, msp.capacity_used, msp.last_capacity_change));
        }
        providers
            .backup_storage_providers
            .get(&provider_id)
            .map(|bsp| (bsp.capacity, bsp.capacity_used, bsp.last_capacity_change))
    }

    pub(crate) fn do_add_value_prop(
        &mut self,
        who: &AccountId,
        value_prop: ValueProposition,
    ) -> Result<(ProviderId, ValuePropId), DispatchError> {
        let msp_id = self.get_msp_id_of(who).ok_or(Error::NotMsp)?;
        let value_prop_id = value_prop.derive_id();

        let value_props = self
            .state
            .providers
            .main_storage_provider_ids_to_value_propositions
            .entry(msp_id)
            .or_default();

        // Check that the value proposition does not exist already
        ensure!(
            !value_props.contains_key(&value_prop_id),
            Error::ValuePropositionAlreadyExists
        );
        value_props.insert(value_prop_id, value_prop);

        if let Some(msp) = self.state.providers.main_storage_providers.get_mut(&msp_id) {
            msp.amount_of_value_props = msp.amount_of_value_props.saturating_add(1);
        }

        Ok((msp_id, value_prop_id))
    }

    pub(crate) fn do_make_value_prop_unavailable(
        &mut self,
        who: &AccountId,
        value_prop_id: ValuePropId,
    ) -> Result<ProviderId, DispatchError> {
        let msp_id = self.get_msp_id_of(who).ok_or(Error::NotMsp)?;

        let value_prop = self
            .state
            .providers
            .main_storage_provider_ids_to_value_propositions
            .get_mut(&msp_id)
            .and_then(|value_props| value_props.get_mut(&value_prop_id))
            .ok_or(Error::ValuePropositionNotFound)?;

        ensure!(value_prop.available, Error::ValuePropositionAlreadyUnavailable);
        value_prop.available = false;

        Ok(msp_id)
    }

    fn multiaddresses_mut(&mut self, provider_id: StorageProviderId) -> Option<&mut Vec<MultiAddress>> {
        let providers = &mut self.state.providers;
        match provider_id {
            StorageProviderId::MainStorageProvider(id) => providers
                .main_storage_providers
                .get_mut(&id)
                .map(|msp| &mut msp.multiaddresses),
            StorageProviderId::BackupStorageProvider(id) => providers
                .backup_storage_providers
                .get_mut(&id)
                .map(|bsp| &mut bsp.multiaddresses),
        }
    }

    pub(crate) fn do_add_multiaddress(
        &mut self,
        who: &AccountId,
        new_multiaddress: MultiAddress,
    ) -> Result<ProviderId, DispatchError> {
        let provider_id = self.get_provider_id_of(who).ok_or(Error::NotRegistered)?;
        let max = self.config.providers.max_multi_addresses as usize;

        let multiaddresses = expect_or_err!(
            self.multiaddresses_mut(provider_id),
            "Provider registered for an account should exist",
            Error::InconsistentState
        );

        ensure!(
            !multiaddresses.contains(&new_multiaddress),
            Error::MultiAddressAlreadyExists
        );
        ensure!(multiaddresses.len() < max, Error::TooManyMultiAddresses);
        multiaddresses.push(new_multiaddress);

        Ok(provider_id.id())
    }

    pub(crate) fn do_remove_multiaddress(
        &mut self,
        who: &AccountId,
        multiaddress: &MultiAddress,
    ) -> Result<ProviderId, DispatchError> {
        let provider_id = self.get_provider_id_of(who).ok_or(Error::NotRegistered)?;

        let multiaddresses = expect_or_err!(
            self.multiaddresses_mut(provider_id),
            "Provider registered for an account should exist",
            Error::InconsistentState
        );

        let position = multiaddresses
            .iter()
            .position(|address| address == multiaddress)
            .ok_or(Error::MultiAddressNotFound)?;
        ensure!(multiaddresses.len() > 1, Error::LastMultiAddressCantBeRemoved);
        multiaddresses.remove(position);

        Ok(provider_id.id())
    }

    pub(crate) fn do_slash(&mut self, provider_id: ProviderId) -> DispatchResult {
        // Check that the provider has accrued failed proof submissions
        let accrued_failed_proofs = self
            .state
            .proofs_dealer
            .slashable_providers
            .remove(&provider_id)
            .ok_or(Error::ProviderNotSlashable)?;

        let (owner, capacity) = match self.get_provider(provider_id) {
            Some(StorageProvider::MainStorageProvider(msp)) => (msp.owner_account, msp.capacity),
            Some(StorageProvider::BackupStorageProvider(bsp)) => (bsp.owner_account, bsp.capacity),
            None => return Err(Error::NotRegistered.into()),
        };

        let slash_amount = self
            .config
            .providers
            .slash_amount_per_max_file_size
            .saturating_mul(accrued_failed_proofs.into())
            .saturating_mul(2);

        let treasury = self.config.treasury_account.clone();
        let slashed = self.ledger.transfer_on_hold(
            &HoldReason::StorageProviderDeposit,
            &owner,
            &treasury,
            slash_amount,
            Precision::BestEffort,
        )?;

        warn!(
            target: LOG_TARGET,
            "Slashed {} from provider {:?} for {} failed proof submissions",
            slashed,
            provider_id,
            accrued_failed_proofs
        );

        self.deposit_event(Event::Slashed {
            provider_id,
            amount: slashed,
        });

        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, &owner);
        let required = self.compute_deposit_needed_for_capacity(capacity);
        if held < required
            && !self
                .state
                .providers
                .awaiting_top_up_from_providers
                .contains_key(&provider_id)
        {
            let tick = self.current_tick();
            let top_up_metadata = TopUpMetadata {
                started_at: tick,
                end_tick_grace_period: tick
                    .saturating_add(self.config.providers.provider_top_up_ttl),
            };

            let providers = &mut self.state.providers;
            providers
                .awaiting_top_up_from_providers
                .insert(provider_id, top_up_metadata);
            providers
                .provider_top_up_expirations
                .entry(top_up_metadata.end_tick_grace_period)
                .or_default()
                .push(provider_id);

            self.deposit_event(Event::AwaitingTopUp {
                provider_id,
                top_up_metadata,
            });
        }

        Ok(())
    }

    pub(crate) fn do_top_up_deposit(&mut self, who: &AccountId) -> DispatchResult {
        let provider_id = self.get_provider_id_of(who).ok_or(Error::NotRegistered)?.id();
        ensure!(
            !self.is_provider_insolvent(provider_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        let (capacity, _, _) = expect_or_err!(
            self.capacity_info(provider_id),
            "Provider registered for an account should exist",
            Error::InconsistentState
        );

        let required = self.compute_deposit_needed_for_capacity(capacity);
        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, who);
        let awaiting = self
            .state
            .providers
            .awaiting_top_up_from_providers
            .remove(&provider_id);

        let amount = required.saturating_sub(held);
        ensure!(amount > 0 || awaiting.is_some(), Error::TopUpNotRequired);

        if amount > 0 {
            ensure!(
                self.ledger.free_balance(who) >= amount,
                Error::NotEnoughBalance
            );
            self.ledger
                .hold(&HoldReason::StorageProviderDeposit, who, amount)
                .map_err(|_| Error::CannotHoldDeposit)?;
        }

        if let Some(metadata) = awaiting {
            if let Some(expiring) = self
                .state
                .providers
                .provider_top_up_expirations
                .get_mut(&metadata.end_tick_grace_period)
            {
                expiring.retain(|id| *id != provider_id);
            }
        }

        self.deposit_event(Event::TopUpFulfilled {
            provider_id,
            amount,
        });

        Ok(())
    }

    /// Marks as insolvent the providers whose grace period to top up ends at the current tick.
    pub(crate) fn providers_on_idle(&mut self) {
        let tick = self.current_tick();
        let Some(expiring) = self
            .state
            .providers
            .provider_top_up_expirations
            .remove(&tick)
        else {
            return;
        };

        for provider_id in expiring {
            let still_awaiting = self
                .state
                .providers
                .awaiting_top_up_from_providers
                .get(&provider_id)
                .is_some_and(|metadata| metadata.end_tick_grace_period == tick);
            if !still_awaiting {
                continue;
            }

            if let Err(error) = self.transactional(|rt| rt.mark_provider_insolvent(provider_id)) {
                log::error!(
                    target: LOG_TARGET,
                    "Failed to mark provider {:?} as insolvent: {:?}",
                    provider_id,
                    error
                );
            }
        }
    }

    fn mark_provider_insolvent(&mut self, provider_id: ProviderId) -> DispatchResult {
        let providers = &mut self.state.providers;
        providers.awaiting_top_up_from_providers.remove(&provider_id);
        providers.insolvent_providers.insert(provider_id);

        warn!(target: LOG_TARGET, "Provider {:?} is now insolvent", provider_id);
        self.deposit_event(Event::ProviderInsolvent { provider_id });

        if self.is_msp(&provider_id) {
            let buckets: Vec<BucketId> = self
                .state
                .providers
                .main_storage_provider_ids_to_buckets
                .get(&provider_id)
                .map(|buckets| buckets.iter().copied().collect())
                .unwrap_or_default();

            for bucket_id in &buckets {
                self.unassign_msp_from_bucket(bucket_id)?;
            }

            self.deposit_event(Event::BucketsOfInsolventMsp {
                msp_id: provider_id,
                buckets,
            });
        } else {
            self.stop_challenge_cycle(provider_id);
        }

        self.remove_payment_streams_of_provider(provider_id)?;

        Ok(())
    }

    pub(crate) fn do_delete_provider(&mut self, provider_id: ProviderId) -> DispatchResult {
        // Only insolvent providers whose payment streams are all gone can be deleted
        ensure!(
            self.is_provider_insolvent(provider_id),
            Error::DeleteProviderConditionsNotMet
        );
        ensure!(
            !self.provider_has_payment_streams(&provider_id),
            Error::DeleteProviderConditionsNotMet
        );

        let provider = self
            .get_provider(provider_id)
            .ok_or(Error::DeleteProviderConditionsNotMet)?;
        let owner = match &provider {
            StorageProvider::MainStorageProvider(msp) => msp.owner_account.clone(),
            StorageProvider::BackupStorageProvider(bsp) => bsp.owner_account.clone(),
        };

        // Whatever is left of the deposit goes to the treasury
        let held = self
            .ledger
            .balance_on_hold(&HoldReason::StorageProviderDeposit, &owner);
        let treasury = self.config.treasury_account.clone();
        self.ledger.transfer_on_hold(
            &HoldReason::StorageProviderDeposit,
            &owner,
            &treasury,
            held,
            Precision::BestEffort,
        )?;

        match provider {
            StorageProvider::MainStorageProvider(_) => {
                self.remove_msp(provider_id, &owner);
                self.deposit_event(Event::MspDeleted { provider_id });
            }
            StorageProvider::BackupStorageProvider(bsp) => {
                self.remove_bsp(provider_id, &bsp);
                self.deposit_event(Event::BspDeleted { provider_id });
            }
        }
        self.state.providers.insolvent_providers.remove(&provider_id);

        Ok(())
    }

    // Buckets

    pub(crate) fn add_bucket(
        &mut self,
        msp_id: ProviderId,
        user_id: AccountId,
        bucket_id: BucketId,
        private: bool,
        value_prop_id: ValuePropId,
        name: Vec<u8>,
    ) -> DispatchResult {
        let max_buckets = self.config.providers.max_buckets_per_msp;
        let providers = &mut self.state.providers;

        let msp = providers
            .main_storage_providers
            .get_mut(&msp_id)
            .ok_or(Error::NotMsp)?;
        ensure!(msp.amount_of_buckets < max_buckets, Error::MaxBucketsReached);
        msp.amount_of_buckets += 1;

        providers
            .main_storage_provider_ids_to_buckets
            .entry(msp_id)
            .or_default()
            .insert(bucket_id);
        providers.buckets.insert(
            bucket_id,
            Bucket {
                root: crate::forest::default_forest_root(),
                user_id,
                msp_id: Some(msp_id),
                private,
                size: 0,
                value_prop_id,
                name,
            },
        );

        Ok(())
    }

    /// Detaches a bucket from its MSP, releasing the capacity it used.
    pub(crate) fn unassign_msp_from_bucket(&mut self, bucket_id: &BucketId) -> DispatchResult {
        let providers = &mut self.state.providers;
        let bucket = providers
            .buckets
            .get_mut(bucket_id)
            .ok_or(Error::BucketNotFound)?;
        let Some(msp_id) = bucket.msp_id.take() else {
            return Ok(());
        };
        let size = bucket.size;

        if let Some(msp) = providers.main_storage_providers.get_mut(&msp_id) {
            msp.amount_of_buckets = msp.amount_of_buckets.saturating_sub(1);
            msp.capacity_used = msp.capacity_used.saturating_sub(size);
        }
        if let Some(buckets) = providers.main_storage_provider_ids_to_buckets.get_mut(&msp_id) {
            buckets.remove(bucket_id);
        }

        Ok(())
    }

    /// Assigns a bucket without MSP to `msp_id`, using `size` of its capacity.
    pub(crate) fn assign_msp_to_bucket(
        &mut self,
        bucket_id: &BucketId,
        msp_id: ProviderId,
        value_prop_id: ValuePropId,
    ) -> DispatchResult {
        let providers = &mut self.state.providers;
        let bucket = providers
            .buckets
            .get_mut(bucket_id)
            .ok_or(Error::BucketNotFound)?;
        bucket.msp_id = Some(msp_id);
        bucket.value_prop_id = value_prop_id;
        let size = bucket.size;

        let msp = providers
            .main_storage_providers
            .get_mut(&msp_id)
            .ok_or(Error::NotMsp)?;
        let new_used = msp
            .capacity_used
            .checked_add(size)
            .filter(|used| *used <= msp.capacity)
            .ok_or(Error::NewUsedCapacityExceedsStorageCapacity)?;
        msp.capacity_used = new_used;
        msp.amount_of_buckets = msp.amount_of_buckets.saturating_add(1);

        providers
            .main_storage_provider_ids_to_buckets
            .entry(msp_id)
            .or_default()
            .insert(*bucket_id);

        Ok(())
    }

    pub(crate) fn remove_bucket(&mut self, bucket_id: &BucketId) -> DispatchResult {
        self.unassign_msp_from_bucket(bucket_id)?;
        self.state.providers.buckets.remove(bucket_id);
        Ok(())
    }

    /// Grows a bucket by `delta`, using capacity of the MSP storing it.
    pub(crate) fn increase_bucket_size(
        &mut self,
        bucket_id: &BucketId,
        delta: StorageData,
    ) -> DispatchResult {
        let bucket = self
            .state
            .providers
            .buckets
            .get_mut(bucket_id)
            .ok_or(Error::BucketNotFound)?;
        bucket.size = bucket.size.saturating_add(delta);

        if let Some(msp_id) = bucket.msp_id {
            self.increase_capacity_used(&msp_id, delta)?;
        }

        Ok(())
    }

    pub(crate) fn decrease_bucket_size(
        &mut self,
        bucket_id: &BucketId,
        delta: StorageData,
    ) -> DispatchResult {
        let bucket = self
            .state
            .providers
            .buckets
            .get_mut(bucket_id)
            .ok_or(Error::BucketNotFound)?;
        bucket.size = bucket.size.saturating_sub(delta);

        if let Some(msp_id) = bucket.msp_id {
            self.decrease_capacity_used(&msp_id, delta)?;
        }

        Ok(())
    }

    // Capacity

    pub(crate) fn increase_capacity_used(
        &mut self,
        provider_id: &ProviderId,
        delta: StorageData,
    ) -> DispatchResult {
        let providers = &mut self.state.providers;
        if let Some(msp) = providers.main_storage_providers.get_mut(provider_id) {
            msp.capacity_used = msp
                .capacity_used
                .checked_add(delta)
                .filter(|used| *used <= msp.capacity)
                .ok_or(Error::NewUsedCapacityExceedsStorageCapacity)?;
            return Ok(());
        }

        let bsp = providers
            .backup_storage_providers
            .get_mut(provider_id)
            .ok_or(Error::NotRegistered)?;
        bsp.capacity_used = bsp
            .capacity_used
            .checked_add(delta)
            .filter(|used| *used <= bsp.capacity)
            .ok_or(Error::NewUsedCapacityExceedsStorageCapacity)?;
        providers.used_bsps_capacity = providers.used_bsps_capacity.saturating_add(delta);

        Ok(())
    }

    pub(crate) fn decrease_capacity_used(
        &mut self,
        provider_id: &ProviderId,
        delta: StorageData,
    ) -> DispatchResult {
        let providers = &mut self.state.providers;
        if let Some(msp) = providers.main_storage_providers.get_mut(provider_id) {
            msp.capacity_used = msp.capacity_used.saturating_sub(delta);
            return Ok(());
        }

        let bsp = providers
            .backup_storage_providers
            .get_mut(provider_id)
            .ok_or(Error::NotRegistered)?;
        bsp.capacity_used = bsp.capacity_used.saturating_sub(delta);
        providers.used_bsps_capacity = providers.used_bsps_capacity.saturating_sub(delta);

        Ok(())
    }

    // Queries

    pub fn get_msp_id_of(&self, who: &AccountId) -> Option<ProviderId> {
        self.state
            .providers
            .account_id_to_main_storage_provider_id
            .get(who)
            .copied()
    }

    pub fn get_bsp_id_of(&self, who: &AccountId) -> Option<ProviderId> {
        self.state
            .providers
            .account_id_to_backup_storage_provider_id
            .get(who)
            .copied()
    }

    pub fn get_provider_id_of(&self, who: &AccountId) -> Option<StorageProviderId> {
        self.get_msp_id_of(who)
            .map(StorageProviderId::MainStorageProvider)
            .or_else(|| {
                self.get_bsp_id_of(who)
                    .map(StorageProviderId::BackupStorageProvider)
            })
    }

    pub fn is_msp(&self, provider_id: &ProviderId) -> bool {
        self.state
            .providers
            .main_storage_providers
            .contains_key(provider_id)
    }

    pub fn is_bsp(&self, provider_id: &ProviderId) -> bool {
        self.state
            .providers
            .backup_storage_providers
            .contains_key(provider_id)
    }

    pub fn get_provider(&self, provider_id: ProviderId) -> Option<StorageProvider> {
        let providers = &self.state.providers;
        if let Some(msp) = providers.main_storage_providers.get(&provider_id) {
            return Some(StorageProvider::MainStorageProvider(msp.clone()));
        }
        providers
            .backup_storage_providers
            .get(&provider_id)
            .map(|bsp| StorageProvider::BackupStorageProvider(bsp.clone()))
    }

    pub fn get_bucket(&self, bucket_id: &BucketId) -> Option<&Bucket> {
        self.state.providers.buckets.get(bucket_id)
    }

    pub fn get_payment_account(&self, provider_id: &ProviderId) -> Option<AccountId> {
        match self.get_provider(*provider_id)? {
            StorageProvider::MainStorageProvider(msp) => Some(msp.payment_account),
            StorageProvider::BackupStorageProvider(bsp) => Some(bsp.payment_account),
        }
    }

    /// Capacity of a provider that is not used yet.
    pub fn available_capacity(&self, provider_id: &ProviderId) -> StorageData {
        self.capacity_info(*provider_id)
            .map(|(capacity, used, _)| capacity.saturating_sub(used))
            .unwrap_or_default()
    }

    /// Deposit currently held by a provider, which acts as its stake.
    pub fn get_stake(&self, provider_id: &ProviderId) -> Option<Balance> {
        let owner = match self.get_provider(*provider_id)? {
            StorageProvider::MainStorageProvider(msp) => msp.owner_account,
            StorageProvider::BackupStorageProvider(bsp) => bsp.owner_account,
        };
        Some(
            self.ledger
                .balance_on_hold(&HoldReason::StorageProviderDeposit, &owner),
        )
    }

    pub fn is_provider_insolvent(&self, provider_id: ProviderId) -> bool {
        self.state
            .providers
            .insolvent_providers
            .contains(&provider_id)
    }

    pub fn query_value_propositions_for_msp(
        &self,
        msp_id: &ProviderId,
    ) -> Vec<(ValuePropId, ValueProposition)> {
        self.state
            .providers
            .main_storage_provider_ids_to_value_propositions
            .get(msp_id)
            .map(|value_props| {
                value_props
                    .iter()
                    .map(|(id, value_prop)| (*id, value_prop.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_value_proposition(
        &self,
        msp_id: &ProviderId,
        value_prop_id: &ValuePropId,
    ) -> Option<&ValueProposition> {
        self.state
            .providers
            .main_storage_provider_ids_to_value_propositions
            .get(msp_id)?
            .get(value_prop_id)
    }

    pub fn get_buckets_of_msp(&self, msp_id: &ProviderId) -> Vec<BucketId> {
        self.state
            .providers
            .main_storage_provider_ids_to_buckets
            .get(msp_id)
            .map(|buckets| buckets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Id of a bucket: the hash of its owner and its name.
    pub fn derive_bucket_id(owner: &AccountId, name: &[u8]) -> BucketId {
        let mut preimage = owner.encode();
        preimage.extend_from_slice(name);
        BlakeTwo256::hash(&preimage)
    }
}
