//! # File System
//!
//! Storage requests and the files they leave in the forests of buckets and BSPs.
//!
//! A user issues a storage request for a file in one of its buckets. BSPs volunteer for it once
//! their volunteering threshold allows it (see [`threshold`]) and confirm storing it with a
//! non-inclusion proof against their forest. The MSP of the bucket answers the requests of its
//! buckets in batches, accepting them with a non-inclusion proof against the bucket's forest or
//! rejecting them. A request is fulfilled once enough BSPs confirmed and the MSP accepted.
//!
//! Requests that expire or get revoked after some provider already stored the file become
//! incomplete storage requests, which track the providers that still have to remove it.
//!
//! Files leave forests when a BSP stops storing them, when a provider drops the files of a user
//! without funds, when a checkpoint challenge asks to remove them, or when their owner deletes
//! them (see [`deletion`]).

use std::collections::{BTreeMap, BTreeSet};

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_traits::TrieMutation;
use sp_trie::CompactProof;
use thiserror::Error;

use crate::{
    ensure_signed,
    error::DispatchResult,
    types::{
        AccountId, Balance, BucketId, FileKey, Fingerprint, MerkleHash, MultiAddress, Origin,
        PeerId, ProviderId, StorageData, TickNumber, ValuePropId,
    },
    Ledger, Runtime,
};

pub mod deletion;
pub mod threshold;
pub mod types;
mod utils;


pub use deletion::{FileDeletionRequest, FileOperation, FileOperationIntention};
pub use types::*;

pub(crate) const LOG_TARGET: &str = "runtime::file_system";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSystemState {
    pub storage_requests: BTreeMap<FileKey, StorageRequestMetadata>,
    /// BSPs that volunteered for a storage request.
    pub storage_request_bsps: BTreeMap<(FileKey, ProviderId), StorageRequestBspsMetadata>,
    /// File keys of the storage requests that expire at a given tick.
    pub storage_request_expirations: BTreeMap<TickNumber, Vec<FileKey>>,
    pub next_available_storage_request_expiration_tick: TickNumber,
    pub pending_stop_storing_requests: BTreeMap<(ProviderId, FileKey), PendingStopStoringRequest>,
    pub pending_move_bucket_requests: BTreeMap<BucketId, MoveBucketRequestMetadata>,
    pub move_bucket_request_expirations: BTreeMap<TickNumber, Vec<BucketId>>,
    pub incomplete_storage_requests: BTreeMap<FileKey, IncompleteStorageRequestMetadata>,
    /// Deposit held from the owner of each bucket.
    pub bucket_deposits: BTreeMap<BucketId, Balance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Event {
    NewBucket {
        who: AccountId,
        msp_id: ProviderId,
        bucket_id: BucketId,
        name: Vec<u8>,
        root: MerkleHash,
        private: bool,
        value_prop_id: ValuePropId,
    },
    BucketPrivacyUpdated {
        who: AccountId,
        bucket_id: BucketId,
        private: bool,
    },
    BucketDeleted {
        who: AccountId,
        bucket_id: BucketId,
    },
    /// Notifies that a new file has been requested to be stored.
    NewStorageRequest {
        who: AccountId,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        fingerprint: Fingerprint,
        size: StorageData,
        peer_ids: Vec<PeerId>,
        expires_at: TickNumber,
    },
    /// Notifies that a BSP has been accepted to store a given file.
    AcceptedBspVolunteer {
        bsp_id: ProviderId,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        fingerprint: Fingerprint,
        multiaddresses: Vec<MultiAddress>,
        owner: AccountId,
        size: StorageData,
    },
    /// Notifies that a BSP confirmed storing a file(s).
    BspConfirmedStoring {
        who: AccountId,
        bsp_id: ProviderId,
        confirmed_file_keys: Vec<FileKey>,
        /// Keys of owners flagged as without funds, which were not added.
        skipped_file_keys: Vec<FileKey>,
        new_root: MerkleHash,
    },
    MspAcceptedStorageRequest {
        file_key: FileKey,
        bucket_id: BucketId,
    },
    StorageRequestRejected {
        file_key: FileKey,
        msp_id: ProviderId,
        bucket_id: BucketId,
        reason: RejectedStorageRequestReason,
    },
    /// Notifies that a storage request for a file key has been fulfilled.
    StorageRequestFulfilled {
        file_key: FileKey,
    },
    /// Notifies the expiration of a storage request.
    StorageRequestExpired {
        file_key: FileKey,
    },
    /// Notifies that a storage request has been revoked by the user who initiated it.
    StorageRequestRevoked {
        file_key: FileKey,
    },
    /// A storage request was closed with providers still storing the file.
    IncompleteStorageRequest {
        file_key: FileKey,
    },
    IncompleteStorageRequestCleanedUp {
        file_key: FileKey,
    },
    BucketRootChanged {
        bucket_id: BucketId,
        old_root: MerkleHash,
        new_root: MerkleHash,
        mutations: Vec<(FileKey, TrieMutation)>,
    },
    /// Notifies that a BSP has requested to stop storing a file.
    BspRequestedToStopStoring {
        bsp_id: ProviderId,
        file_key: FileKey,
        owner: AccountId,
        location: Vec<u8>,
    },
    BspConfirmStoppedStoring {
        bsp_id: ProviderId,
        file_key: FileKey,
        new_root: MerkleHash,
    },
    /// A provider dropped a file of a user flagged as without funds.
    SpStopStoringInsolventUser {
        sp_id: ProviderId,
        file_key: FileKey,
        owner: AccountId,
        location: Vec<u8>,
        new_root: MerkleHash,
    },
    MspStoppedStoringBucket {
        msp_id: ProviderId,
        owner: AccountId,
        bucket_id: BucketId,
    },
    MoveBucketRequested {
        who: AccountId,
        bucket_id: BucketId,
        new_msp_id: ProviderId,
        new_value_prop_id: ValuePropId,
    },
    MoveBucketAccepted {
        bucket_id: BucketId,
        old_msp_id: Option<ProviderId>,
        new_msp_id: ProviderId,
        value_prop_id: ValuePropId,
    },
    MoveBucketRejected {
        bucket_id: BucketId,
        old_msp_id: Option<ProviderId>,
        new_msp_id: ProviderId,
    },
    MoveBucketRequestExpired {
        bucket_id: BucketId,
    },
    BucketFileDeletionsCompleted {
        user: AccountId,
        file_keys: Vec<FileKey>,
        bucket_id: BucketId,
        msp_id: Option<ProviderId>,
        old_root: MerkleHash,
        new_root: MerkleHash,
    },
    BspFileDeletionsCompleted {
        users: Vec<AccountId>,
        file_keys: Vec<FileKey>,
        bsp_id: ProviderId,
        old_root: MerkleHash,
        new_root: MerkleHash,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("account is not a BSP")]
    NotABsp,
    #[error("account is not an MSP")]
    NotAMsp,
    #[error("account is not a storage provider")]
    NotASp,
    #[error("provider is insolvent")]
    OperationNotAllowedForInsolventProvider,
    #[error("user is flagged as without funds")]
    OperationNotAllowedWithInsolventUser,
    #[error("user is not flagged as without funds")]
    UserNotInsolvent,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("bucket already exists")]
    BucketAlreadyExists,
    #[error("caller is not the owner of the bucket")]
    NotBucketOwner,
    #[error("bucket still has files")]
    BucketNotEmpty,
    #[error("bucket is being moved")]
    BucketIsBeingMoved,
    #[error("MSP is not storing the bucket")]
    MspNotStoringBucket,
    #[error("MSP is already storing the bucket")]
    MspAlreadyStoringBucket,
    #[error("value proposition not available")]
    ValuePropositionNotAvailable,
    #[error("bucket would exceed the data limit of its value proposition")]
    BucketSizeExceedsLimit,
    #[error("failed to hold deposit")]
    CannotHoldDeposit,
    #[error("failed to charge the penalty")]
    PenaltyChargeFailed,
    #[error("file size can't be zero")]
    FileSizeCannotBeZero,
    #[error("file size is above the maximum")]
    FileSizeTooLarge,
    #[error("replication target can't be zero")]
    ReplicationTargetCannotBeZero,
    #[error("replication target is above the maximum")]
    ReplicationTargetExceedsMaximum,
    #[error("too many peer ids")]
    TooManyPeerIds,
    #[error("file metadata does not match the file key")]
    InvalidFileKeyMetadata,
    #[error("storage request already registered")]
    StorageRequestAlreadyRegistered,
    #[error("storage request not found")]
    StorageRequestNotFound,
    #[error("caller is not the owner of the storage request")]
    StorageRequestNotAuthorized,
    #[error("storage request already has every BSP it requires")]
    StorageRequestBspsRequiredFulfilled,
    #[error("file key does not belong to the bucket")]
    InvalidBucketIdFileKeyPair,
    #[error("BSP is not eligible to volunteer yet")]
    BspNotEligibleToVolunteer,
    #[error("BSP already volunteered")]
    BspAlreadyVolunteered,
    #[error("BSP did not volunteer")]
    BspNotVolunteered,
    #[error("BSP already confirmed storing the file")]
    BspAlreadyConfirmed,
    #[error("provider does not have enough available capacity")]
    InsufficientAvailableCapacity,
    #[error("no file keys to confirm")]
    NoFileKeysToConfirm,
    #[error("too many storage request responses")]
    TooManyStorageRequestResponses,
    #[error("MSP already accepted the storage request")]
    MspAlreadyConfirmed,
    #[error("caller is not the selected MSP")]
    NotSelectedMsp,
    #[error("forest proof verification failed")]
    ForestProofVerificationFailed,
    #[error("key proof verification failed")]
    KeyProofVerificationFailed,
    #[error("expected an inclusion proof")]
    ExpectedInclusionProof,
    #[error("expected a non-inclusion proof")]
    ExpectedNonInclusionProof,
    #[error("pending stop storing request already exists")]
    PendingStopStoringRequestAlreadyExists,
    #[error("pending stop storing request not found")]
    PendingStopStoringRequestNotFound,
    #[error("minimum wait for stop storing not reached")]
    MinWaitForStopStoringNotReached,
    #[error("move bucket request not found")]
    MoveBucketRequestNotFound,
    #[error("file deletions must all belong to the same bucket")]
    BatchFileDeletionMustContainSingleBucket,
    #[error("no file deletions")]
    FileDeletionsEmpty,
    #[error("too many file deletions")]
    TooManyFileDeletions,
    #[error("file key appears more than once in the batch")]
    DuplicateFileKeyInBatch,
    #[error("invalid signature of the file operation intention")]
    InvalidSignature,
    #[error("file owner is not the owner of the bucket")]
    FileOwnerNotBucketOwner,
    #[error("incomplete storage request not found")]
    IncompleteStorageRequestNotFound,
    #[error("file key is not pending removal from the given forest")]
    FileKeyNotPendingDeletion,
    #[error("maximum tick number reached")]
    MaxTickNumberReached,
    #[error("inconsistent file system state")]
    InconsistentState,
}

impl<L: Ledger> Runtime<L> {
    /// Create a bucket stored by `msp_id` under the given value proposition.
    ///
    /// Holds `BucketDeposit` from the caller and opens (or raises) the fixed rate payment stream
    /// from the caller to the MSP.
    ///
    /// Emits `NewBucket` event when successful.
    pub fn create_bucket(
        &mut self,
        origin: Origin,
        msp_id: ProviderId,
        name: Vec<u8>,
        private: bool,
        value_prop_id: ValuePropId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_create_bucket(who, msp_id, name, private, value_prop_id))
    }

    pub fn update_bucket_privacy(
        &mut self,
        origin: Origin,
        bucket_id: BucketId,
        private: bool,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            let bucket = rt
                .state
                .providers
                .buckets
                .get_mut(&bucket_id)
                .ok_or(Error::BucketNotFound)?;
            if bucket.user_id != who {
                return Err(Error::NotBucketOwner.into());
            }
            bucket.private = private;

            rt.deposit_event(Event::BucketPrivacyUpdated {
                who,
                bucket_id,
                private,
            });
            Ok(())
        })
    }

    /// Delete an empty bucket, releasing its deposit.
    ///
    /// Emits `BucketDeleted` event when successful.
    pub fn delete_bucket(&mut self, origin: Origin, bucket_id: BucketId) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_delete_bucket(who, bucket_id))
    }

    /// Issue a new storage request for a file.
    ///
    /// Holds `StorageRequestCreationDeposit` from the caller until the request is closed.
    ///
    /// Emits `NewStorageRequest` event when successful.
    #[allow(clippy::too_many_arguments)]
    pub fn issue_storage_request(
        &mut self,
        origin: Origin,
        bucket_id: BucketId,
        location: Vec<u8>,
        fingerprint: Fingerprint,
        size: StorageData,
        msp_id: ProviderId,
        peer_ids: Vec<PeerId>,
        replication_target: ReplicationTarget,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_issue_storage_request(
                who,
                bucket_id,
                location,
                fingerprint,
                size,
                msp_id,
                peer_ids,
                replication_target,
            )?;
            Ok(())
        })
    }

    /// Revoke a storage request of the caller.
    ///
    /// If providers already stored the file, the request becomes an incomplete storage request
    /// and a priority challenge asks the BSPs to remove the file.
    ///
    /// Emits `StorageRequestRevoked` event when successful.
    pub fn revoke_storage_request(&mut self, origin: Origin, file_key: FileKey) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_revoke_storage_request(who, file_key))
    }

    /// Used by a BSP to volunteer for storing a file.
    ///
    /// Emits `AcceptedBspVolunteer` event when successful.
    pub fn bsp_volunteer(&mut self, origin: Origin, file_key: FileKey) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_bsp_volunteer(who, file_key))
    }

    /// Used by a BSP to confirm it is storing files it volunteered for.
    ///
    /// `non_inclusion_forest_proof` has to show that none of the keys is in the BSP's forest.
    ///
    /// Emits `BspConfirmedStoring` event when successful.
    pub fn bsp_confirm_storing(
        &mut self,
        origin: Origin,
        non_inclusion_forest_proof: CompactProof,
        file_keys_and_proofs: Vec<FileKeyWithProof>,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_bsp_confirm_storing(who, non_inclusion_forest_proof, file_keys_and_proofs)
        })
    }

    /// Used by an MSP to accept or reject the storage requests of its buckets.
    ///
    /// Each bucket is answered independently, but the whole batch is applied atomically.
    pub fn msp_respond_storage_requests_multiple_buckets(
        &mut self,
        origin: Origin,
        responses: StorageRequestMspResponse,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_msp_respond_storage_requests(who, responses))
    }

    /// Used by a BSP to request to stop storing a file.
    ///
    /// Charges `BspStopStoringFilePenalty` and opens a storage request to replace the BSP. The
    /// file is removed from its forest with `bsp_confirm_stop_storing` after
    /// `MinWaitForStopStoring` ticks.
    ///
    /// Emits `BspRequestedToStopStoring` event when successful.
    #[allow(clippy::too_many_arguments)]
    pub fn bsp_request_stop_storing(
        &mut self,
        origin: Origin,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        owner: AccountId,
        fingerprint: Fingerprint,
        size: StorageData,
        can_serve: bool,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_bsp_request_stop_storing(
                who,
                file_key,
                bucket_id,
                location,
                owner,
                fingerprint,
                size,
                can_serve,
                inclusion_forest_proof,
            )
        })
    }

    /// Emits `BspConfirmStoppedStoring` event when successful.
    pub fn bsp_confirm_stop_storing(
        &mut self,
        origin: Origin,
        file_key: FileKey,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_bsp_confirm_stop_storing(who, file_key, inclusion_forest_proof))
    }

    /// Used by a provider to stop storing a file of a user flagged as without funds, with no
    /// penalty.
    ///
    /// Emits `SpStopStoringInsolventUser` event when successful.
    #[allow(clippy::too_many_arguments)]
    pub fn sp_stop_storing_for_insolvent_user(
        &mut self,
        origin: Origin,
        file_key: FileKey,
        bucket_id: BucketId,
        location: Vec<u8>,
        owner: AccountId,
        fingerprint: Fingerprint,
        size: StorageData,
        inclusion_forest_proof: CompactProof,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_sp_stop_storing_for_insolvent_user(
                who,
                file_key,
                bucket_id,
                location,
                owner,
                fingerprint,
                size,
                inclusion_forest_proof,
            )
        })
    }

    /// Used by an MSP to stop storing a bucket, which is left without MSP.
    ///
    /// Emits `MspStoppedStoringBucket` event when successful.
    pub fn msp_stop_storing_bucket(&mut self, origin: Origin, bucket_id: BucketId) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_msp_stop_storing_bucket(who, bucket_id))
    }

    /// Request to move a bucket to another MSP. The new MSP has `MoveBucketRequestTtl` ticks to
    /// answer.
    ///
    /// Emits `MoveBucketRequested` event when successful.
    pub fn request_move_bucket(
        &mut self,
        origin: Origin,
        bucket_id: BucketId,
        new_msp_id: ProviderId,
        new_value_prop_id: ValuePropId,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_request_move_bucket(who, bucket_id, new_msp_id, new_value_prop_id))
    }

    /// Emits `MoveBucketAccepted` or `MoveBucketRejected` event when successful.
    pub fn msp_respond_move_bucket_request(
        &mut self,
        origin: Origin,
        bucket_id: BucketId,
        response: BucketMoveRequestResponse,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| rt.do_msp_respond_move_bucket_request(who, bucket_id, response))
    }

    pub fn get_storage_request(&self, file_key: &FileKey) -> Option<&StorageRequestMetadata> {
        self.state.file_system.storage_requests.get(file_key)
    }

    /// BSPs that volunteered for a storage request, with whether they confirmed.
    pub fn get_storage_request_bsps(&self, file_key: &FileKey) -> BTreeMap<ProviderId, bool> {
        self.state
            .file_system
            .storage_request_bsps
            .range((*file_key, ProviderId::zero())..=(*file_key, ProviderId::repeat_byte(0xff)))
            .map(|((_, bsp_id), metadata)| (*bsp_id, metadata.confirmed))
            .collect()
    }

    pub fn get_pending_stop_storing_request(
        &self,
        bsp_id: &ProviderId,
        file_key: &FileKey,
    ) -> Option<&PendingStopStoringRequest> {
        self.state
            .file_system
            .pending_stop_storing_requests
            .get(&(*bsp_id, *file_key))
    }

    pub fn get_incomplete_storage_request(
        &self,
        file_key: &FileKey,
    ) -> Option<&IncompleteStorageRequestMetadata> {
        self.state.file_system.incomplete_storage_requests.get(file_key)
    }

    pub fn get_pending_move_bucket_request(
        &self,
        bucket_id: &BucketId,
    ) -> Option<&MoveBucketRequestMetadata> {
        self.state.file_system.pending_move_bucket_requests.get(bucket_id)
    }

    pub fn is_bucket_being_moved(&self, bucket_id: &BucketId) -> bool {
        self.state
            .file_system
            .pending_move_bucket_requests
            .contains_key(bucket_id)
    }

    /// Storage requests a BSP volunteered for and has not confirmed yet.
    pub fn pending_volunteered_file_keys(&self, bsp_id: &ProviderId) -> BTreeSet<FileKey> {
        self.state
            .file_system
            .storage_request_bsps
            .iter()
            .filter(|((_, volunteer), metadata)| volunteer == bsp_id && !metadata.confirmed)
            .map(|((file_key, _), _)| *file_key)
            .collect()
    }
}
