use std::collections::BTreeSet;

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_file_key_verifier::FileKeyProof;
use shp_file_metadata::{FileMetadata, FileMetadataError};
use sp_trie::CompactProof;

use crate::{
    config::ReplicationTargetsConfig,
    types::{
        AccountId, Balance, BucketId, FileKey, Fingerprint, PeerId, ProviderId, RandomnessSeed,
        StorageData, TickNumber, ValuePropId,
    },
};

/// How many BSPs have to confirm storing a file for its storage request to be fulfilled.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReplicationTarget {
    Basic,
    Standard,
    HighSecurity,
    SuperHighSecurity,
    UltraHighSecurity,
    Custom(u32),
}

impl ReplicationTarget {
    pub fn bsps_required(&self, targets: &ReplicationTargetsConfig) -> u32 {
        match self {
            ReplicationTarget::Basic => targets.basic,
            ReplicationTarget::Standard => targets.standard,
            ReplicationTarget::HighSecurity => targets.high_security,
            ReplicationTarget::SuperHighSecurity => targets.super_high_security,
            ReplicationTarget::UltraHighSecurity => targets.ultra_high_security,
            ReplicationTarget::Custom(bsps) => *bsps,
        }
    }
}

/// Where the MSP of a storage request stands.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub enum MspStorageRequestStatus {
    /// No MSP is involved, e.g. a request replacing a BSP that stopped storing a file.
    None,
    Pending(ProviderId),
    /// The MSP added the file to the bucket's forest.
    AcceptedNewFile(ProviderId),
    /// The file was already in the bucket's forest.
    AcceptedExistingFile(ProviderId),
}

impl MspStorageRequestStatus {
    pub fn msp_id(&self) -> Option<ProviderId> {
        match self {
            MspStorageRequestStatus::None => None,
            MspStorageRequestStatus::Pending(msp_id)
            | MspStorageRequestStatus::AcceptedNewFile(msp_id)
            | MspStorageRequestStatus::AcceptedExistingFile(msp_id) => Some(*msp_id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MspStorageRequestStatus::Pending(_))
    }
}

/// Ephemeral metadata of a storage request.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct StorageRequestMetadata {
    /// Tick at which the storage request was made.
    pub requested_at: TickNumber,
    /// Tick at which the storage request expires if it is not fulfilled by then.
    pub expires_at: TickNumber,
    /// AccountId of the user who owns the data being stored.
    pub owner: AccountId,
    pub bucket_id: BucketId,
    /// User defined name of the file being stored.
    pub location: Vec<u8>,
    /// Identifier of the data being stored.
    pub fingerprint: Fingerprint,
    /// Size of the data being stored.
    ///
    /// SPs will use this to determine if they have enough space to store the data.
    pub size: StorageData,
    pub msp_status: MspStorageRequestStatus,
    /// Peer Ids of the user who requested the storage.
    ///
    /// SPs will expect a connection request to be initiated by the user with this Peer Id.
    pub user_peer_ids: Vec<PeerId>,
    /// Providers that already store the file and can serve it to the volunteers.
    pub data_server_sps: Vec<ProviderId>,
    /// Number of BSPs requested to store the data.
    pub bsps_required: u32,
    /// Number of BSPs that have successfully volunteered AND confirmed that they are storing the data.
    ///
    /// This starts at 0 and increases up to `bsps_required`.
    pub bsps_confirmed: u32,
    /// Number of BSPs that have volunteered to store the data.
    ///
    /// There can be more than `bsps_required` volunteers, but it is essentially a race for BSPs to confirm that they are storing the data.
    pub bsps_volunteered: u32,
    /// Held from the owner when the request was issued, released when it is closed.
    pub deposit_paid: Balance,
    /// Randomness the volunteering thresholds of BSPs are derived from.
    pub volunteer_seed: RandomnessSeed,
}

impl StorageRequestMetadata {
    pub fn to_file_metadata(&self) -> Result<FileMetadata, FileMetadataError> {
        FileMetadata::new(
            self.owner.encode(),
            self.bucket_id.as_bytes().to_vec(),
            self.location.clone(),
            self.size,
            self.fingerprint,
        )
    }

    pub fn is_fulfilled(&self) -> bool {
        self.bsps_confirmed >= self.bsps_required && !self.msp_status.is_pending()
    }

    /// Whether some provider already committed to the file, so closing the request leaves files
    /// to remove from forests.
    pub fn is_partially_committed(&self) -> bool {
        self.bsps_confirmed > 0
            || matches!(self.msp_status, MspStorageRequestStatus::AcceptedNewFile(_))
    }
}

/// Ephemeral BSP storage request tracking metadata.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Default)]
pub struct StorageRequestBspsMetadata {
    /// Confirmed that the data is being stored.
    pub confirmed: bool,
}

/// Why an MSP rejected a storage request.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub enum RejectedStorageRequestReason {
    ReachedMaximumCapacity,
    ReceivedInvalidProof,
    FileKeyAlreadyStored,
    RequestExpired,
    InternalError,
}

/// A file key with the proof of the chunks challenged for it.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct FileKeyWithProof {
    pub file_key: FileKey,
    pub proof: FileKeyProof,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct MspAcceptedStorageRequests {
    pub file_keys_and_proofs: Vec<FileKeyWithProof>,
    /// Non-inclusion proof of the accepted keys in the bucket's forest. Keys it shows as
    /// included are accepted as existing files.
    pub forest_proof: CompactProof,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct RejectedStorageRequest {
    pub file_key: FileKey,
    pub reason: RejectedStorageRequestReason,
}

/// The answer of an MSP to the storage requests of one bucket.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct MspStorageRequestsBucketResponse {
    pub bucket_id: BucketId,
    pub accept: Option<MspAcceptedStorageRequests>,
    pub reject: Vec<RejectedStorageRequest>,
}

pub type StorageRequestMspResponse = Vec<MspStorageRequestsBucketResponse>;

/// A BSP that asked to stop storing a file, waiting for `MinWaitForStopStoring` ticks to pass.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct PendingStopStoringRequest {
    pub tick_when_requested: TickNumber,
    pub file_owner: AccountId,
    pub file_size: StorageData,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct MoveBucketRequestMetadata {
    pub requester: AccountId,
    pub new_msp_id: ProviderId,
    pub new_value_prop_id: ValuePropId,
    pub expires_at: TickNumber,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub enum BucketMoveRequestResponse {
    Accepted,
    Rejected,
}

/// A storage request that was closed after some providers stored the file. Every provider
/// listed here still has to remove the file from its forest.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct IncompleteStorageRequestMetadata {
    pub owner: AccountId,
    pub bucket_id: BucketId,
    pub location: Vec<u8>,
    pub file_size: StorageData,
    pub fingerprint: Fingerprint,
    pub pending_bsp_removals: BTreeSet<ProviderId>,
    pub pending_bucket_removal: bool,
}

impl IncompleteStorageRequestMetadata {
    pub fn is_cleaned_up(&self) -> bool {
        self.pending_bsp_removals.is_empty() && !self.pending_bucket_removal
    }
}
