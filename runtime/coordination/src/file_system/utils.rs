use std::collections::BTreeSet;

use codec::Encode;
use log::{debug, error, info, warn};
use shp_constants::GIGAUNIT;
use shp_file_key_verifier::FileKeyProof;
use shp_file_metadata::FileMetadata;
use shp_traits::{
    CommitmentVerifier, HoldLedger, Precision, TrieAddMutation, TrieMutation, TrieRemoveMutation,
};
use sp_runtime::ArithmeticError;
use sp_trie::CompactProof;

use super::{
    threshold::{bsp_volunteer_value, VolunteerWindow},
    types::*,
    Error, Event, LOG_TARGET,
};
use crate::{
    error::{ensure, expect_or_err, DispatchError, DispatchResult},
    forest::{default_forest_root, verify_forest_proof, TrieId},
    proofs_dealer::generate_challenges_from_seed,
    types::{
        AccountId, Balance, BucketId, FileKey, FileKeyVerifierFor, Fingerprint, HoldReason,
        MerkleHash, PeerId, ProviderId, StorageData, StorageProviderId, TickNumber, ValuePropId,
    },
    Ledger, Runtime,
};

/// Metadata of a file as it is stored in forests, with the file key it hashes to.
pub(crate) fn file_metadata_for(
    owner: &AccountId,
    bucket_id: &BucketId,
    location: &[u8],
    size: StorageData,
    fingerprint: Fingerprint,
) -> Result<FileMetadata, Error> {
    FileMetadata::new(
        owner.encode(),
        bucket_id.as_bytes().to_vec(),
        location.to_vec(),
        size,
        fingerprint,
    )
    .map_err(|_| Error::InvalidFileKeyMetadata)
}

/// Checks a key proof for the chunks challenged by `provider_id` when committing to a file.
///
/// Challenges are derived from the file key itself, so a provider can only build the proof if
/// it actually received the file.
pub(crate) fn verify_commitment_key_proof(
    provider_id: &ProviderId,
    file_key: &FileKey,
    metadata: &FileMetadata,
    proof: &FileKeyProof,
) -> Result<(), Error> {
    ensure!(proof.file_metadata == *metadata, Error::InvalidFileKeyMetadata);

    let challenges = generate_challenges_from_seed(*file_key, provider_id, metadata.chunks_to_check());
    FileKeyVerifierFor::verify_proof(file_key, &challenges, proof).map_err(|e| {
        warn!(target: LOG_TARGET, "Key proof for {:?} rejected: {:?}", file_key, e);
        Error::KeyProofVerificationFailed
    })?;

    Ok(())
}

/// Checks that `proof` shows every key of `file_keys` in the forest with `root`.
pub(crate) fn ensure_all_included(
    root: &MerkleHash,
    file_keys: &[FileKey],
    proof: &CompactProof,
) -> Result<(), Error> {
    let proven = verify_forest_proof(root, file_keys, proof).map_err(|e| {
        debug!(target: LOG_TARGET, "Forest proof rejected: {:?}", e);
        Error::ForestProofVerificationFailed
    })?;
    ensure!(
        file_keys.iter().all(|file_key| proven.contains(file_key)),
        Error::ExpectedInclusionProof
    );
    Ok(())
}

pub(crate) fn total_size<'a>(
    sizes: impl IntoIterator<Item = &'a StorageData>,
) -> Result<StorageData, DispatchError> {
    sizes.into_iter().try_fold(0 as StorageData, |acc, size| {
        acc.checked_add(*size)
            .ok_or_else(|| DispatchError::from(ArithmeticError::Overflow))
    })
}

impl<L: Ledger> Runtime<L> {
    // Buckets

    pub(crate) fn do_create_bucket(
        &mut self,
        who: AccountId,
        msp_id: ProviderId,
        name: Vec<u8>,
        private: bool,
        value_prop_id: ValuePropId,
    ) -> DispatchResult {
        // Users with unpaid debt can't take on new storage.
        ensure!(
            !self.is_user_without_funds(&who),
            Error::OperationNotAllowedWithInsolventUser
        );

        ensure!(self.is_msp(&msp_id), Error::NotAMsp);
        ensure!(
            !self.is_provider_insolvent(msp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        // Check that the value proposition exists and is still offered.
        ensure!(
            self.get_value_proposition(&msp_id, &value_prop_id)
                .is_some_and(|value_prop| value_prop.available),
            Error::ValuePropositionNotAvailable
        );

        let bucket_id = Self::derive_bucket_id(&who, &name);
        ensure!(
            self.get_bucket(&bucket_id).is_none(),
            Error::BucketAlreadyExists
        );

        let deposit = self.config.providers.bucket_deposit;
        self.ledger
            .hold(&HoldReason::BucketDeposit, &who, deposit)
            .map_err(|_| Error::CannotHoldDeposit)?;
        self.state
            .file_system
            .bucket_deposits
            .insert(bucket_id, deposit);

        self.add_bucket(
            msp_id,
            who.clone(),
            bucket_id,
            private,
            value_prop_id,
            name.clone(),
        )?;
        self.update_user_msp_fixed_rate(&msp_id, &who)?;

        self.deposit_event(Event::NewBucket {
            who,
            msp_id,
            bucket_id,
            name,
            root: default_forest_root(),
            private,
            value_prop_id,
        });

        Ok(())
    }

    pub(crate) fn do_delete_bucket(&mut self, who: AccountId, bucket_id: BucketId) -> DispatchResult {
        let bucket = self
            .get_bucket(&bucket_id)
            .ok_or(Error::BucketNotFound)?
            .clone();

        ensure!(bucket.user_id == who, Error::NotBucketOwner);
        ensure!(
            bucket.root == default_forest_root() && bucket.size == 0,
            Error::BucketNotEmpty
        );
        ensure!(
            !self.is_bucket_being_moved(&bucket_id),
            Error::BucketIsBeingMoved
        );

        // Open storage requests would add files to the bucket once accepted.
        ensure!(
            !self
                .state
                .file_system
                .storage_requests
                .values()
                .any(|request| request.bucket_id == bucket_id),
            Error::BucketNotEmpty
        );

        self.remove_bucket(&bucket_id)?;
        if let Some(msp_id) = bucket.msp_id {
            self.update_user_msp_fixed_rate(&msp_id, &who)?;
        }

        if let Some(deposit) = self.state.file_system.bucket_deposits.remove(&bucket_id) {
            self.ledger.release(
                &HoldReason::BucketDeposit,
                &who,
                deposit,
                Precision::BestEffort,
            )?;
        }

        self.deposit_event(Event::BucketDeleted { who, bucket_id });

        Ok(())
    }

    /// Sets the fixed rate stream from `user` to `msp_id` to what the user's buckets stored by
    /// the MSP cost per tick: each bucket pays its size at the price of its value proposition,
    /// plus `ZeroSizeBucketFixedRate`.
    pub(crate) fn update_user_msp_fixed_rate(
        &mut self,
        msp_id: &ProviderId,
        user: &AccountId,
    ) -> DispatchResult {
        let zero_size_bucket_fixed_rate = self.config.payment_streams.zero_size_bucket_fixed_rate;
        let mut rate: Balance = 0;

        for bucket in self
            .state
            .providers
            .buckets
            .values()
            .filter(|bucket| bucket.user_id == *user && bucket.msp_id == Some(*msp_id))
        {
            let price = self
                .get_value_proposition(msp_id, &bucket.value_prop_id)
                .map(|value_prop| value_prop.price_per_giga_unit_of_data_per_tick)
                .unwrap_or_default();
            let bucket_rate = Balance::from(bucket.size)
                .checked_mul(price)
                .ok_or(ArithmeticError::Overflow)?
                / Balance::from(GIGAUNIT);
            rate = rate
                .checked_add(bucket_rate)
                .and_then(|rate| rate.checked_add(zero_size_bucket_fixed_rate))
                .ok_or(ArithmeticError::Overflow)?;
        }

        let has_stream = self
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .contains_key(&(*msp_id, user.clone()));
        if !has_stream && rate > 0 && self.is_user_without_funds(user) {
            // A user without funds can't open a stream, the provider can stop storing its files
            warn!(
                target: LOG_TARGET,
                "Not opening a fixed rate stream from {:?} to {:?}: user without funds",
                user,
                msp_id
            );
            return Ok(());
        }

        self.set_fixed_rate_payment_stream(msp_id, user, rate)
    }

    // Storage requests

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn do_issue_storage_request(
        &mut self,
        who: AccountId,
        bucket_id: BucketId,
        location: Vec<u8>,
        fingerprint: Fingerprint,
        size: StorageData,
        msp_id: ProviderId,
        peer_ids: Vec<PeerId>,
        replication_target: ReplicationTarget,
    ) -> Result<FileKey, DispatchError> {
        let config = &self.config.file_system;

        ensure!(
            !self.is_user_without_funds(&who),
            Error::OperationNotAllowedWithInsolventUser
        );

        ensure!(size > 0, Error::FileSizeCannotBeZero);
        ensure!(size <= config.max_file_size, Error::FileSizeTooLarge);

        let bsps_required = replication_target.bsps_required(&config.replication_targets);
        ensure!(bsps_required > 0, Error::ReplicationTargetCannotBeZero);
        ensure!(
            bsps_required <= config.max_replication_target,
            Error::ReplicationTargetExceedsMaximum
        );

        ensure!(
            peer_ids.len() <= config.max_peer_ids_per_storage_request as usize,
            Error::TooManyPeerIds
        );
        let deposit = config.storage_request_creation_deposit;

        // Check that the bucket is owned by the caller and stored by `msp_id`.
        let bucket = self.get_bucket(&bucket_id).ok_or(Error::BucketNotFound)?;
        ensure!(bucket.user_id == who, Error::NotBucketOwner);
        let bucket_msp = bucket.msp_id;
        ensure!(
            !self.is_bucket_being_moved(&bucket_id),
            Error::BucketIsBeingMoved
        );
        ensure!(bucket_msp == Some(msp_id), Error::MspNotStoringBucket);
        ensure!(
            !self.is_provider_insolvent(msp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        self.create_storage_request(
            who,
            bucket_id,
            location,
            fingerprint,
            size,
            MspStorageRequestStatus::Pending(msp_id),
            peer_ids,
            bsps_required,
            deposit,
            Vec::new(),
        )
    }

    /// Registers a storage request, holding `deposit` from `owner`, and schedules its expiration.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_storage_request(
        &mut self,
        owner: AccountId,
        bucket_id: BucketId,
        location: Vec<u8>,
        fingerprint: Fingerprint,
        size: StorageData,
        msp_status: MspStorageRequestStatus,
        user_peer_ids: Vec<PeerId>,
        bsps_required: u32,
        deposit: Balance,
        data_server_sps: Vec<ProviderId>,
    ) -> Result<FileKey, DispatchError> {
        let file_key = file_metadata_for(&owner, &bucket_id, &location, size, fingerprint)?.file_key();

        ensure!(
            !self.state.file_system.storage_requests.contains_key(&file_key),
            Error::StorageRequestAlreadyRegistered
        );

        if deposit > 0 {
            self.ledger
                .hold(&HoldReason::StorageRequestCreationHold, &owner, deposit)
                .map_err(|_| Error::CannotHoldDeposit)?;
        }

        let now = self.current_tick();
        let expires_at = self.enqueue_storage_request_expiration(file_key)?;
        let request = StorageRequestMetadata {
            requested_at: now,
            expires_at,
            owner: owner.clone(),
            bucket_id,
            location: location.clone(),
            fingerprint,
            size,
            msp_status,
            user_peer_ids: user_peer_ids.clone(),
            data_server_sps,
            bsps_required,
            bsps_confirmed: 0,
            bsps_volunteered: 0,
            deposit_paid: deposit,
            volunteer_seed: self.randomness_at(now).unwrap_or_default(),
        };
        self.state
            .file_system
            .storage_requests
            .insert(file_key, request);

        debug!(
            target: LOG_TARGET,
            "Storage request {:?} issued, expires at tick {}", file_key, expires_at
        );
        self.deposit_event(Event::NewStorageRequest {
            who: owner,
            file_key,
            bucket_id,
            location,
            fingerprint,
            size,
            peer_ids: user_peer_ids,
            expires_at,
        });

        Ok(file_key)
    }

    /// Finds the first tick, `StorageRequestTtl` ticks from now or later, that has room for one
    /// more expiration.
    fn enqueue_storage_request_expiration(&mut self, file_key: FileKey) -> Result<TickNumber, DispatchError> {
        let now = self.current_tick();
        let ttl = self.config.file_system.storage_request_ttl;
        let max_per_tick = self.config.file_system.max_expired_items_in_tick as usize;
        let file_system = &mut self.state.file_system;

        let mut expires_at = now
            .checked_add(ttl)
            .ok_or(Error::MaxTickNumberReached)?
            .max(file_system.next_available_storage_request_expiration_tick);

        while file_system
            .storage_request_expirations
            .get(&expires_at)
            .is_some_and(|file_keys| file_keys.len() >= max_per_tick)
        {
            expires_at = expires_at
                .checked_add(1)
                .ok_or(Error::MaxTickNumberReached)?;
        }

        file_system
            .storage_request_expirations
            .entry(expires_at)
            .or_default()
            .push(file_key);
        file_system.next_available_storage_request_expiration_tick = expires_at;

        Ok(expires_at)
    }

    /// Removes a storage request and its volunteers, returning it with the BSPs that confirmed.
    pub(crate) fn remove_storage_request(
        &mut self,
        file_key: &FileKey,
    ) -> Option<(StorageRequestMetadata, BTreeSet<ProviderId>)> {
        let file_system = &mut self.state.file_system;
        let request = file_system.storage_requests.remove(file_key)?;

        let volunteers: Vec<(ProviderId, bool)> = file_system
            .storage_request_bsps
            .range((*file_key, ProviderId::zero())..=(*file_key, ProviderId::repeat_byte(0xff)))
            .map(|((_, bsp_id), metadata)| (*bsp_id, metadata.confirmed))
            .collect();

        let mut confirmed = BTreeSet::new();
        for (bsp_id, has_confirmed) in volunteers {
            file_system.storage_request_bsps.remove(&(*file_key, bsp_id));
            if has_confirmed {
                confirmed.insert(bsp_id);
            }
        }

        Some((request, confirmed))
    }

    fn release_storage_request_deposit(&mut self, request: &StorageRequestMetadata) -> DispatchResult {
        if request.deposit_paid > 0 {
            self.ledger.release(
                &HoldReason::StorageRequestCreationHold,
                &request.owner,
                request.deposit_paid,
                Precision::BestEffort,
            )?;
        }
        Ok(())
    }

    /// Closes the storage request if enough BSPs confirmed and the MSP (if any) accepted.
    fn check_storage_request_fulfilled(&mut self, file_key: FileKey) -> DispatchResult {
        let fulfilled = self
            .get_storage_request(&file_key)
            .is_some_and(StorageRequestMetadata::is_fulfilled);
        if !fulfilled {
            return Ok(());
        }

        let (request, _) = expect_or_err!(
            self.remove_storage_request(&file_key),
            "Storage request was just checked to exist",
            Error::InconsistentState
        );
        self.release_storage_request_deposit(&request)?;

        info!(target: LOG_TARGET, "Storage request {:?} fulfilled", file_key);
        self.deposit_event(Event::StorageRequestFulfilled { file_key });

        Ok(())
    }

    /// Tracks the providers that still store the file of a storage request that was closed
    /// before being fulfilled, and challenges the BSPs to remove it.
    fn register_incomplete_storage_request(
        &mut self,
        file_key: FileKey,
        request: &StorageRequestMetadata,
        confirmed_bsps: BTreeSet<ProviderId>,
    ) {
        let pending_bucket_removal = matches!(
            request.msp_status,
            MspStorageRequestStatus::AcceptedNewFile(_)
        );
        if confirmed_bsps.is_empty() && !pending_bucket_removal {
            return;
        }
        let challenge_bsps = !confirmed_bsps.is_empty();

        let incomplete = self
            .state
            .file_system
            .incomplete_storage_requests
            .entry(file_key)
            .or_insert_with(|| IncompleteStorageRequestMetadata {
                owner: request.owner.clone(),
                bucket_id: request.bucket_id,
                location: request.location.clone(),
                file_size: request.size,
                fingerprint: request.fingerprint,
                pending_bsp_removals: BTreeSet::new(),
                pending_bucket_removal: false,
            });
        incomplete.pending_bsp_removals.extend(confirmed_bsps);
        incomplete.pending_bucket_removal |= pending_bucket_removal;

        // The BSPs get rid of the file when answering the checkpoint challenge. If the queue is
        // full, the file can still be removed with `delete_files_for_incomplete_storage_request`.
        if challenge_bsps {
            if let Err(e) = self.enqueue_priority_challenge(file_key, true) {
                warn!(
                    target: LOG_TARGET,
                    "Could not challenge removal of {:?}: {:?}", file_key, e
                );
            }
        }

        self.deposit_event(Event::IncompleteStorageRequest { file_key });
    }

    pub(crate) fn do_revoke_storage_request(&mut self, who: AccountId, file_key: FileKey) -> DispatchResult {
        let request = self
            .get_storage_request(&file_key)
            .ok_or(Error::StorageRequestNotFound)?;
        ensure!(request.owner == who, Error::StorageRequestNotAuthorized);

        let (request, confirmed_bsps) = expect_or_err!(
            self.remove_storage_request(&file_key),
            "Storage request was just checked to exist",
            Error::InconsistentState
        );
        self.release_storage_request_deposit(&request)?;

        if request.is_partially_committed() {
            self.register_incomplete_storage_request(file_key, &request, confirmed_bsps);
        }

        self.deposit_event(Event::StorageRequestRevoked { file_key });

        Ok(())
    }

    // BSPs

    /// Tick from which a BSP can volunteer for a storage request.
    pub fn query_earliest_file_volunteer_tick(
        &self,
        bsp_id: &ProviderId,
        file_key: &FileKey,
    ) -> Result<TickNumber, DispatchError> {
        let request = self
            .get_storage_request(file_key)
            .ok_or(Error::StorageRequestNotFound)?;
        let bsp = self
            .state
            .providers
            .backup_storage_providers
            .get(bsp_id)
            .ok_or(Error::NotABsp)?;

        let window = VolunteerWindow::new(
            bsp.reputation_weight,
            self.state.providers.global_bsps_reputation_weight,
            request.bsps_required,
            self.config.file_system.tick_range_to_maximum_threshold,
        );
        let value = bsp_volunteer_value(request.volunteer_seed, bsp_id, file_key);

        Ok(request
            .requested_at
            .saturating_add(window.ticks_until_eligible(value)))
    }

    pub(crate) fn do_bsp_volunteer(&mut self, who: AccountId, file_key: FileKey) -> DispatchResult {
        let bsp_id = self.get_bsp_id_of(&who).ok_or(Error::NotABsp)?;
        ensure!(
            !self.is_provider_insolvent(bsp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        // Check that the storage request exists.
        let request = self
            .get_storage_request(&file_key)
            .ok_or(Error::StorageRequestNotFound)?
            .clone();

        expect_or_err!(
            request.bsps_confirmed < request.bsps_required,
            "Storage request should never have confirmed bsps equal to or greater than required bsps, since they are deleted when it is reached.",
            Error::StorageRequestBspsRequiredFulfilled,
            bool
        );

        // Check that the BSP has not already volunteered for the storage request.
        ensure!(
            !self
                .state
                .file_system
                .storage_request_bsps
                .contains_key(&(file_key, bsp_id)),
            Error::BspAlreadyVolunteered
        );

        ensure!(
            self.available_capacity(&bsp_id) >= request.size,
            Error::InsufficientAvailableCapacity
        );

        let earliest_volunteer_tick = self.query_earliest_file_volunteer_tick(&bsp_id, &file_key)?;
        ensure!(
            self.current_tick() >= earliest_volunteer_tick,
            Error::BspNotEligibleToVolunteer
        );

        let file_system = &mut self.state.file_system;
        file_system
            .storage_request_bsps
            .insert((file_key, bsp_id), StorageRequestBspsMetadata::default());
        if let Some(request) = file_system.storage_requests.get_mut(&file_key) {
            request.bsps_volunteered = request.bsps_volunteered.saturating_add(1);
        }

        let multiaddresses = self
            .state
            .providers
            .backup_storage_providers
            .get(&bsp_id)
            .map(|bsp| bsp.multiaddresses.clone())
            .unwrap_or_default();

        self.deposit_event(Event::AcceptedBspVolunteer {
            bsp_id,
            file_key,
            bucket_id: request.bucket_id,
            location: request.location,
            fingerprint: request.fingerprint,
            multiaddresses,
            owner: request.owner,
            size: request.size,
        });

        Ok(())
    }

    pub(crate) fn do_bsp_confirm_storing(
        &mut self,
        who: AccountId,
        non_inclusion_forest_proof: CompactProof,
        file_keys_and_proofs: Vec<FileKeyWithProof>,
    ) -> DispatchResult {
        let bsp_id = self.get_bsp_id_of(&who).ok_or(Error::NotABsp)?;
        ensure!(
            !self.is_provider_insolvent(bsp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        ensure!(!file_keys_and_proofs.is_empty(), Error::NoFileKeysToConfirm);
        ensure!(
            file_keys_and_proofs.len()
                <= self.config.file_system.max_batch_confirm_storage_requests as usize,
            Error::TooManyStorageRequestResponses
        );

        let mut seen = BTreeSet::new();
        let mut to_confirm: Vec<(FileKey, StorageRequestMetadata, FileMetadata)> = Vec::new();
        let mut skipped_file_keys = Vec::new();

        for FileKeyWithProof { file_key, proof } in &file_keys_and_proofs {
            ensure!(seen.insert(*file_key), Error::DuplicateFileKeyInBatch);

            // Check that the storage request exists.
            let request = self
                .get_storage_request(file_key)
                .ok_or(Error::StorageRequestNotFound)?
                .clone();

            // Check that the BSP has volunteered for the storage request.
            let volunteer = self
                .state
                .file_system
                .storage_request_bsps
                .get(&(*file_key, bsp_id))
                .ok_or(Error::BspNotVolunteered)?;

            // Check that the storage provider has not already confirmed storing the file.
            ensure!(!volunteer.confirmed, Error::BspAlreadyConfirmed);

            expect_or_err!(
                request.bsps_confirmed < request.bsps_required,
                "Storage request should never have confirmed bsps equal to or greater than required bsps, since they are deleted when it is reached.",
                Error::StorageRequestBspsRequiredFulfilled,
                bool
            );

            // The BSP would never get paid for it.
            if self.is_user_without_funds(&request.owner) {
                warn!(
                    target: LOG_TARGET,
                    "Skipping {:?}: owner {:?} is without funds", file_key, request.owner
                );
                skipped_file_keys.push(*file_key);
                continue;
            }

            let metadata = request
                .to_file_metadata()
                .map_err(|_| Error::InvalidFileKeyMetadata)?;
            verify_commitment_key_proof(&bsp_id, file_key, &metadata, proof)?;

            to_confirm.push((*file_key, request, metadata));
        }

        ensure!(!to_confirm.is_empty(), Error::NoFileKeysToConfirm);

        let size_to_confirm = total_size(to_confirm.iter().map(|(_, request, _)| &request.size))?;
        ensure!(
            self.available_capacity(&bsp_id) >= size_to_confirm,
            Error::InsufficientAvailableCapacity
        );

        // None of the files can be in the BSP's forest already.
        let file_keys: Vec<FileKey> = to_confirm.iter().map(|(file_key, _, _)| *file_key).collect();
        let root = self
            .get_forest_root(TrieId::Bsp(bsp_id))
            .ok_or(Error::NotABsp)?;
        let proven = verify_forest_proof(&root, &file_keys, &non_inclusion_forest_proof)
            .map_err(|_| Error::ForestProofVerificationFailed)?;
        ensure!(
            file_keys.iter().all(|file_key| !proven.contains(file_key)),
            Error::ExpectedNonInclusionProof
        );

        let mutations: Vec<(FileKey, TrieMutation)> = to_confirm
            .iter()
            .map(|(file_key, _, metadata)| (*file_key, TrieAddMutation::new(metadata.encode()).into()))
            .collect();
        let applied = self
            .apply_mutations(TrieId::Bsp(bsp_id), &mutations, &non_inclusion_forest_proof)
            .map_err(|_| Error::ForestProofVerificationFailed)?;

        // A BSP without a challenge cycle stored nothing until now, so its users only start
        // paying from this tick.
        let starts_cycle = self.get_proof_submission_record(&bsp_id).is_none();
        if starts_cycle {
            let tick = self.current_tick();
            let price_index = self.state.payment_streams.accumulated_price_index;
            self.update_last_chargeable_info(bsp_id, tick, price_index)?;
        }

        for (file_key, request, _) in &to_confirm {
            self.increase_capacity_used(&bsp_id, request.size)?;
            self.increase_dynamic_amount_provided(&bsp_id, &request.owner, request.size)?;

            let file_system = &mut self.state.file_system;
            if let Some(volunteer) = file_system.storage_request_bsps.get_mut(&(*file_key, bsp_id)) {
                volunteer.confirmed = true;
            }
            if let Some(request) = file_system.storage_requests.get_mut(file_key) {
                request.bsps_confirmed = request
                    .bsps_confirmed
                    .checked_add(1)
                    .ok_or(ArithmeticError::Overflow)?;
            }
        }

        // The first files in the forest start the BSP's challenge cycle.
        if starts_cycle {
            self.initialise_challenge_cycle(bsp_id)?;
        }

        self.deposit_event(Event::BspConfirmedStoring {
            who,
            bsp_id,
            confirmed_file_keys: file_keys.clone(),
            skipped_file_keys,
            new_root: applied.new_root,
        });

        for file_key in file_keys {
            self.check_storage_request_fulfilled(file_key)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn do_bsp_request_stop_storing(
        &mut self,
        who: AccountId,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        owner: AccountId,
        fingerprint: Fingerprint,
        size: StorageData,
        can_serve: bool,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let bsp_id = self.get_bsp_id_of(&who).ok_or(Error::NotABsp)?;

        // Check that the metadata provided corresponds to the file key.
        let metadata = file_metadata_for(&owner, &bucket_id, &location, size, fingerprint)?;
        ensure!(metadata.file_key() == file_key, Error::InvalidFileKeyMetadata);

        ensure!(
            !self
                .state
                .file_system
                .pending_stop_storing_requests
                .contains_key(&(bsp_id, file_key)),
            Error::PendingStopStoringRequestAlreadyExists
        );

        let root = self
            .get_forest_root(TrieId::Bsp(bsp_id))
            .ok_or(Error::NotABsp)?;
        ensure_all_included(&root, &[file_key], &inclusion_forest_proof)?;

        let treasury = self.config.treasury_account.clone();
        self.ledger
            .transfer(
                &who,
                &treasury,
                self.config.file_system.bsp_stop_storing_file_penalty,
                Precision::Exact,
            )
            .map_err(|_| Error::PenaltyChargeFailed)?;

        // Another BSP has to take over the file.
        let file_system = &mut self.state.file_system;
        if let Some(request) = file_system.storage_requests.get_mut(&file_key) {
            match file_system.storage_request_bsps.remove(&(file_key, bsp_id)) {
                Some(volunteer) => {
                    if volunteer.confirmed {
                        request.bsps_confirmed = request.bsps_confirmed.saturating_sub(1);
                    }
                    request.bsps_volunteered = request.bsps_volunteered.saturating_sub(1);
                }
                None => {
                    request.bsps_required = request.bsps_required.saturating_add(1);
                }
            }
            if can_serve {
                request.data_server_sps.push(bsp_id);
            }
        } else {
            let data_server_sps = if can_serve { vec![bsp_id] } else { Vec::new() };
            self.create_storage_request(
                owner.clone(),
                bucket_id,
                location.clone(),
                fingerprint,
                size,
                MspStorageRequestStatus::None,
                Vec::new(),
                1,
                0,
                data_server_sps,
            )?;
        }

        let tick_when_requested = self.current_tick();
        self.state.file_system.pending_stop_storing_requests.insert(
            (bsp_id, file_key),
            PendingStopStoringRequest {
                tick_when_requested,
                file_owner: owner.clone(),
                file_size: size,
            },
        );

        self.deposit_event(Event::BspRequestedToStopStoring {
            bsp_id,
            file_key,
            owner,
            location,
        });

        Ok(())
    }

    pub(crate) fn do_bsp_confirm_stop_storing(
        &mut self,
        who: AccountId,
        file_key: FileKey,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let bsp_id = self.get_bsp_id_of(&who).ok_or(Error::NotABsp)?;

        let pending = self
            .get_pending_stop_storing_request(&bsp_id, &file_key)
            .cloned()
            .ok_or(Error::PendingStopStoringRequestNotFound)?;

        ensure!(
            self.current_tick()
                >= pending
                    .tick_when_requested
                    .saturating_add(self.config.file_system.min_wait_for_stop_storing),
            Error::MinWaitForStopStoringNotReached
        );

        let root = self
            .get_forest_root(TrieId::Bsp(bsp_id))
            .ok_or(Error::NotABsp)?;
        ensure_all_included(&root, &[file_key], &inclusion_forest_proof)?;

        let applied = self
            .apply_mutation(
                TrieId::Bsp(bsp_id),
                file_key,
                TrieRemoveMutation::default().into(),
                &inclusion_forest_proof,
            )
            .map_err(|_| Error::ForestProofVerificationFailed)?;

        self.decrease_capacity_used(&bsp_id, pending.file_size)?;
        self.decrease_dynamic_amount_provided(&bsp_id, &pending.file_owner, pending.file_size)?;

        if applied.new_root == default_forest_root() {
            self.stop_challenge_cycle(bsp_id);
        }
        self.file_system_on_bsp_key_removed(&bsp_id, &file_key);

        self.deposit_event(Event::BspConfirmStoppedStoring {
            bsp_id,
            file_key,
            new_root: applied.new_root,
        });

        Ok(())
    }

    // MSPs

    /// The storage request of `file_key` if it is waiting for `msp_id` to answer it.
    fn pending_request_for_msp(
        &self,
        msp_id: ProviderId,
        bucket_id: BucketId,
        file_key: FileKey,
    ) -> Result<StorageRequestMetadata, DispatchError> {
        let request = self
            .get_storage_request(&file_key)
            .ok_or(Error::StorageRequestNotFound)?;
        ensure!(
            request.bucket_id == bucket_id,
            Error::InvalidBucketIdFileKeyPair
        );

        match request.msp_status {
            MspStorageRequestStatus::Pending(id) if id == msp_id => Ok(request.clone()),
            MspStorageRequestStatus::AcceptedNewFile(id)
            | MspStorageRequestStatus::AcceptedExistingFile(id)
                if id == msp_id =>
            {
                Err(Error::MspAlreadyConfirmed.into())
            }
            _ => Err(Error::NotSelectedMsp.into()),
        }
    }

    pub(crate) fn do_msp_respond_storage_requests(
        &mut self,
        who: AccountId,
        responses: StorageRequestMspResponse,
    ) -> DispatchResult {
        let msp_id = self.get_msp_id_of(&who).ok_or(Error::NotAMsp)?;
        ensure!(
            !self.is_provider_insolvent(msp_id),
            Error::OperationNotAllowedForInsolventProvider
        );

        let answered: usize = responses
            .iter()
            .map(|response| {
                response.reject.len()
                    + response
                        .accept
                        .as_ref()
                        .map_or(0, |accepted| accepted.file_keys_and_proofs.len())
            })
            .sum();
        ensure!(
            answered <= self.config.file_system.max_batch_confirm_storage_requests as usize,
            Error::TooManyStorageRequestResponses
        );

        for response in responses {
            // Check that the MSP is storing the bucket.
            let bucket = self
                .get_bucket(&response.bucket_id)
                .ok_or(Error::BucketNotFound)?;
            ensure!(bucket.msp_id == Some(msp_id), Error::MspNotStoringBucket);

            for rejected in response.reject {
                self.reject_storage_request(
                    msp_id,
                    response.bucket_id,
                    rejected.file_key,
                    rejected.reason,
                )?;
            }

            if let Some(accepted) = response.accept {
                self.accept_storage_requests(msp_id, response.bucket_id, accepted)?;
            }
        }

        Ok(())
    }

    fn reject_storage_request(
        &mut self,
        msp_id: ProviderId,
        bucket_id: BucketId,
        file_key: FileKey,
        reason: RejectedStorageRequestReason,
    ) -> DispatchResult {
        self.pending_request_for_msp(msp_id, bucket_id, file_key)?;

        let (request, confirmed_bsps) = expect_or_err!(
            self.remove_storage_request(&file_key),
            "Storage request was just checked to exist",
            Error::InconsistentState
        );
        self.release_storage_request_deposit(&request)?;

        // BSPs that already confirmed have to remove the file.
        if request.is_partially_committed() {
            self.register_incomplete_storage_request(file_key, &request, confirmed_bsps);
        }

        self.deposit_event(Event::StorageRequestRejected {
            file_key,
            msp_id,
            bucket_id,
            reason,
        });

        Ok(())
    }

    fn accept_storage_requests(
        &mut self,
        msp_id: ProviderId,
        bucket_id: BucketId,
        accepted: MspAcceptedStorageRequests,
    ) -> DispatchResult {
        ensure!(
            !accepted.file_keys_and_proofs.is_empty(),
            Error::NoFileKeysToConfirm
        );

        let mut seen = BTreeSet::new();
        let mut requests: Vec<(FileKey, StorageRequestMetadata, FileMetadata)> = Vec::new();
        for FileKeyWithProof { file_key, proof } in &accepted.file_keys_and_proofs {
            ensure!(seen.insert(*file_key), Error::DuplicateFileKeyInBatch);

            let request = self.pending_request_for_msp(msp_id, bucket_id, *file_key)?;
            let metadata = request
                .to_file_metadata()
                .map_err(|_| Error::InvalidFileKeyMetadata)?;
            verify_commitment_key_proof(&msp_id, file_key, &metadata, proof)?;

            requests.push((*file_key, request, metadata));
        }

        let bucket = self
            .get_bucket(&bucket_id)
            .ok_or(Error::BucketNotFound)?
            .clone();
        ensure!(
            !self.is_user_without_funds(&bucket.user_id),
            Error::OperationNotAllowedWithInsolventUser
        );

        // Keys the proof shows in the bucket's forest are accepted as they are.
        let file_keys: Vec<FileKey> = requests.iter().map(|(file_key, _, _)| *file_key).collect();
        let proven = verify_forest_proof(&bucket.root, &file_keys, &accepted.forest_proof)
            .map_err(|_| Error::ForestProofVerificationFailed)?;

        let new_files: Vec<&(FileKey, StorageRequestMetadata, FileMetadata)> = requests
            .iter()
            .filter(|(file_key, _, _)| !proven.contains(file_key))
            .collect();

        if !new_files.is_empty() {
            let new_size = total_size(new_files.iter().map(|(_, request, _)| &request.size))?;

            let value_prop = self
                .get_value_proposition(&msp_id, &bucket.value_prop_id)
                .ok_or(Error::ValuePropositionNotAvailable)?;
            ensure!(
                bucket
                    .size
                    .checked_add(new_size)
                    .is_some_and(|size| size <= value_prop.bucket_data_limit),
                Error::BucketSizeExceedsLimit
            );
            ensure!(
                self.available_capacity(&msp_id) >= new_size,
                Error::InsufficientAvailableCapacity
            );

            let mutations: Vec<(FileKey, TrieMutation)> = new_files
                .iter()
                .map(|(file_key, _, metadata)| {
                    (*file_key, TrieAddMutation::new(metadata.encode()).into())
                })
                .collect();
            let applied = self
                .apply_mutations(TrieId::Bucket(bucket_id), &mutations, &accepted.forest_proof)
                .map_err(|_| Error::ForestProofVerificationFailed)?;

            self.deposit_event(Event::BucketRootChanged {
                bucket_id,
                old_root: applied.old_root,
                new_root: applied.new_root,
                mutations,
            });

            self.increase_bucket_size(&bucket_id, new_size)?;
            self.update_user_msp_fixed_rate(&msp_id, &bucket.user_id)?;
        }

        for (file_key, _, _) in &requests {
            let status = if proven.contains(file_key) {
                MspStorageRequestStatus::AcceptedExistingFile(msp_id)
            } else {
                MspStorageRequestStatus::AcceptedNewFile(msp_id)
            };
            if let Some(request) = self.state.file_system.storage_requests.get_mut(file_key) {
                request.msp_status = status;
            }

            self.deposit_event(Event::MspAcceptedStorageRequest {
                file_key: *file_key,
                bucket_id,
            });
            self.check_storage_request_fulfilled(*file_key)?;
        }

        Ok(())
    }

    pub(crate) fn do_msp_stop_storing_bucket(&mut self, who: AccountId, bucket_id: BucketId) -> DispatchResult {
        let msp_id = self.get_msp_id_of(&who).ok_or(Error::NotAMsp)?;

        let bucket = self.get_bucket(&bucket_id).ok_or(Error::BucketNotFound)?;
        ensure!(bucket.msp_id == Some(msp_id), Error::MspNotStoringBucket);
        let owner = bucket.user_id.clone();

        ensure!(
            !self.is_bucket_being_moved(&bucket_id),
            Error::BucketIsBeingMoved
        );

        self.unassign_msp_from_bucket(&bucket_id)?;
        self.update_user_msp_fixed_rate(&msp_id, &owner)?;

        self.deposit_event(Event::MspStoppedStoringBucket {
            msp_id,
            owner,
            bucket_id,
        });

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn do_sp_stop_storing_for_insolvent_user(
        &mut self,
        who: AccountId,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        owner: AccountId,
        fingerprint: Fingerprint,
        size: StorageData,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let provider = self.get_provider_id_of(&who).ok_or(Error::NotASp)?;

        ensure!(self.is_user_without_funds(&owner), Error::UserNotInsolvent);

        let metadata = file_metadata_for(&owner, &bucket_id, &location, size, fingerprint)?;
        ensure!(metadata.file_key() == file_key, Error::InvalidFileKeyMetadata);

        let removal: TrieMutation = TrieRemoveMutation::default().into();
        let (sp_id, new_root) = match provider {
            StorageProviderId::MainStorageProvider(msp_id) => {
                let bucket = self.get_bucket(&bucket_id).ok_or(Error::BucketNotFound)?;
                ensure!(bucket.msp_id == Some(msp_id), Error::MspNotStoringBucket);
                ensure!(bucket.user_id == owner, Error::FileOwnerNotBucketOwner);
                let root = bucket.root;

                ensure_all_included(&root, &[file_key], &inclusion_forest_proof)?;
                let applied = self
                    .apply_mutation(
                        TrieId::Bucket(bucket_id),
                        file_key,
                        removal.clone(),
                        &inclusion_forest_proof,
                    )
                    .map_err(|_| Error::ForestProofVerificationFailed)?;

                self.deposit_event(Event::BucketRootChanged {
                    bucket_id,
                    old_root: applied.old_root,
                    new_root: applied.new_root,
                    mutations: vec![(file_key, removal)],
                });

                self.decrease_bucket_size(&bucket_id, size)?;
                self.update_user_msp_fixed_rate(&msp_id, &owner)?;
                self.file_system_on_bucket_key_removed(&bucket_id, &file_key);

                (msp_id, applied.new_root)
            }
            StorageProviderId::BackupStorageProvider(bsp_id) => {
                let root = self
                    .get_forest_root(TrieId::Bsp(bsp_id))
                    .ok_or(Error::NotABsp)?;

                ensure_all_included(&root, &[file_key], &inclusion_forest_proof)?;
                let applied = self
                    .apply_mutation(TrieId::Bsp(bsp_id), file_key, removal, &inclusion_forest_proof)
                    .map_err(|_| Error::ForestProofVerificationFailed)?;

                self.decrease_capacity_used(&bsp_id, size)?;
                self.decrease_dynamic_amount_provided(&bsp_id, &owner, size)?;

                if applied.new_root == default_forest_root() {
                    self.stop_challenge_cycle(bsp_id);
                }
                self.file_system_on_bsp_key_removed(&bsp_id, &file_key);

                (bsp_id, applied.new_root)
            }
        };

        self.deposit_event(Event::SpStopStoringInsolventUser {
            sp_id,
            file_key,
            owner,
            location,
            new_root,
        });

        Ok(())
    }

    // Bucket moves

    pub(crate) fn do_request_move_bucket(
        &mut self,
        who: AccountId,
        bucket_id: BucketId,
        new_msp_id: ProviderId,
        new_value_prop_id: ValuePropId,
    ) -> DispatchResult {
        ensure!(
            !self.is_user_without_funds(&who),
            Error::OperationNotAllowedWithInsolventUser
        );

        let bucket = self
            .get_bucket(&bucket_id)
            .ok_or(Error::BucketNotFound)?
            .clone();
        ensure!(bucket.user_id == who, Error::NotBucketOwner);
        ensure!(
            !self.is_bucket_being_moved(&bucket_id),
            Error::BucketIsBeingMoved
        );

        ensure!(self.is_msp(&new_msp_id), Error::NotAMsp);
        ensure!(
            !self.is_provider_insolvent(new_msp_id),
            Error::OperationNotAllowedForInsolventProvider
        );
        ensure!(
            bucket.msp_id != Some(new_msp_id),
            Error::MspAlreadyStoringBucket
        );

        let value_prop = self
            .get_value_proposition(&new_msp_id, &new_value_prop_id)
            .filter(|value_prop| value_prop.available)
            .ok_or(Error::ValuePropositionNotAvailable)?;
        ensure!(
            bucket.size <= value_prop.bucket_data_limit,
            Error::BucketSizeExceedsLimit
        );
        ensure!(
            self.available_capacity(&new_msp_id) >= bucket.size,
            Error::InsufficientAvailableCapacity
        );

        let expires_at = self
            .current_tick()
            .checked_add(self.config.file_system.move_bucket_request_ttl)
            .ok_or(Error::MaxTickNumberReached)?;

        let file_system = &mut self.state.file_system;
        file_system.pending_move_bucket_requests.insert(
            bucket_id,
            MoveBucketRequestMetadata {
                requester: who.clone(),
                new_msp_id,
                new_value_prop_id,
                expires_at,
            },
        );
        file_system
            .move_bucket_request_expirations
            .entry(expires_at)
            .or_default()
            .push(bucket_id);

        self.deposit_event(Event::MoveBucketRequested {
            who,
            bucket_id,
            new_msp_id,
            new_value_prop_id,
        });

        Ok(())
    }

    pub(crate) fn do_msp_respond_move_bucket_request(
        &mut self,
        who: AccountId,
        bucket_id: BucketId,
        response: BucketMoveRequestResponse,
    ) -> DispatchResult {
        let msp_id = self.get_msp_id_of(&who).ok_or(Error::NotAMsp)?;

        let request = self
            .get_pending_move_bucket_request(&bucket_id)
            .cloned()
            .ok_or(Error::MoveBucketRequestNotFound)?;
        ensure!(request.new_msp_id == msp_id, Error::NotSelectedMsp);

        self.state
            .file_system
            .pending_move_bucket_requests
            .remove(&bucket_id);

        let bucket = self
            .get_bucket(&bucket_id)
            .ok_or(Error::BucketNotFound)?
            .clone();
        let old_msp_id = bucket.msp_id;

        match response {
            BucketMoveRequestResponse::Rejected => {
                self.deposit_event(Event::MoveBucketRejected {
                    bucket_id,
                    old_msp_id,
                    new_msp_id: msp_id,
                });
            }
            BucketMoveRequestResponse::Accepted => {
                ensure!(
                    !self.is_provider_insolvent(msp_id),
                    Error::OperationNotAllowedForInsolventProvider
                );
                ensure!(
                    self.available_capacity(&msp_id) >= bucket.size,
                    Error::InsufficientAvailableCapacity
                );

                self.unassign_msp_from_bucket(&bucket_id)?;
                if let Some(old_msp_id) = old_msp_id {
                    self.update_user_msp_fixed_rate(&old_msp_id, &bucket.user_id)?;
                }

                self.assign_msp_to_bucket(&bucket_id, msp_id, request.new_value_prop_id)?;
                self.update_user_msp_fixed_rate(&msp_id, &bucket.user_id)?;

                info!(
                    target: LOG_TARGET,
                    "Bucket {:?} moved from {:?} to {:?}", bucket_id, old_msp_id, msp_id
                );
                self.deposit_event(Event::MoveBucketAccepted {
                    bucket_id,
                    old_msp_id,
                    new_msp_id: msp_id,
                    value_prop_id: request.new_value_prop_id,
                });
            }
        }

        Ok(())
    }

    // Tick hooks

    /// Expires storage requests and bucket moves due this tick and drops the providers that
    /// can't remove files of incomplete storage requests anymore.
    pub(crate) fn file_system_on_idle(&mut self) {
        let tick = self.current_tick();

        let expired_requests = self
            .state
            .file_system
            .storage_request_expirations
            .remove(&tick)
            .unwrap_or_default();
        for file_key in expired_requests {
            if let Err(e) = self.transactional(|rt| rt.expire_storage_request(file_key, tick)) {
                error!(
                    target: LOG_TARGET,
                    "Failed to expire storage request {:?}: {:?}", file_key, e
                );
            }
        }

        let expired_moves = self
            .state
            .file_system
            .move_bucket_request_expirations
            .remove(&tick)
            .unwrap_or_default();
        for bucket_id in expired_moves {
            let file_system = &mut self.state.file_system;
            let due = file_system
                .pending_move_bucket_requests
                .get(&bucket_id)
                .is_some_and(|request| request.expires_at <= tick);
            if due {
                file_system.pending_move_bucket_requests.remove(&bucket_id);
                self.deposit_event(Event::MoveBucketRequestExpired { bucket_id });
            }
        }

        self.prune_incomplete_storage_requests();
    }

    fn expire_storage_request(&mut self, file_key: FileKey, tick: TickNumber) -> DispatchResult {
        // The request may have been fulfilled, revoked or issued again since.
        let due = self
            .get_storage_request(&file_key)
            .is_some_and(|request| request.expires_at <= tick);
        if !due {
            return Ok(());
        }

        let (request, confirmed_bsps) = expect_or_err!(
            self.remove_storage_request(&file_key),
            "Storage request was just checked to exist",
            Error::InconsistentState
        );
        self.release_storage_request_deposit(&request)?;

        // BSPs that confirmed a request replacing another BSP keep the file.
        if request.msp_status != MspStorageRequestStatus::None && request.is_partially_committed() {
            self.register_incomplete_storage_request(file_key, &request, confirmed_bsps);
        }

        debug!(target: LOG_TARGET, "Storage request {:?} expired", file_key);
        self.deposit_event(Event::StorageRequestExpired { file_key });

        Ok(())
    }

    /// Stops waiting for providers that can't remove their files anymore: BSPs that left or are
    /// insolvent, and buckets that were deleted or lost their MSP.
    fn prune_incomplete_storage_requests(&mut self) {
        let file_keys: Vec<FileKey> = self
            .state
            .file_system
            .incomplete_storage_requests
            .keys()
            .copied()
            .collect();

        for file_key in file_keys {
            let Some(mut incomplete) = self
                .state
                .file_system
                .incomplete_storage_requests
                .get(&file_key)
                .cloned()
            else {
                continue;
            };

            incomplete
                .pending_bsp_removals
                .retain(|bsp_id| self.is_bsp(bsp_id) && !self.is_provider_insolvent(*bsp_id));
            if incomplete.pending_bucket_removal {
                incomplete.pending_bucket_removal = self
                    .get_bucket(&incomplete.bucket_id)
                    .is_some_and(|bucket| bucket.msp_id.is_some());
            }

            self.update_incomplete_storage_request(file_key, incomplete);
        }
    }

    /// Stores the new state of an incomplete storage request, removing it once nobody has
    /// anything left to remove.
    fn update_incomplete_storage_request(
        &mut self,
        file_key: FileKey,
        incomplete: IncompleteStorageRequestMetadata,
    ) {
        let file_system = &mut self.state.file_system;
        if incomplete.is_cleaned_up() {
            if file_system
                .incomplete_storage_requests
                .remove(&file_key)
                .is_some()
            {
                self.deposit_event(Event::IncompleteStorageRequestCleanedUp { file_key });
            }
        } else {
            file_system
                .incomplete_storage_requests
                .insert(file_key, incomplete);
        }
    }

    /// Bookkeeping after `file_key` left the forest of `bsp_id`, however it was removed.
    pub(crate) fn file_system_on_bsp_key_removed(&mut self, bsp_id: &ProviderId, file_key: &FileKey) {
        self.state
            .file_system
            .pending_stop_storing_requests
            .remove(&(*bsp_id, *file_key));

        let Some(mut incomplete) = self.get_incomplete_storage_request(file_key).cloned() else {
            return;
        };
        if incomplete.pending_bsp_removals.remove(bsp_id) {
            self.update_incomplete_storage_request(*file_key, incomplete);
        }
    }

    /// Bookkeeping after `file_key` left the forest of `bucket_id`.
    pub(crate) fn file_system_on_bucket_key_removed(&mut self, bucket_id: &BucketId, file_key: &FileKey) {
        let Some(mut incomplete) = self.get_incomplete_storage_request(file_key).cloned() else {
            return;
        };
        if incomplete.bucket_id == *bucket_id && incomplete.pending_bucket_removal {
            incomplete.pending_bucket_removal = false;
            self.update_incomplete_storage_request(*file_key, incomplete);
        }
    }
}
