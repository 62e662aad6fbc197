//! Primitive types shared by every component of the coordination core.

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_forest_verifier::ForestVerifier;
use shp_file_key_verifier::FileKeyVerifier;
use sp_core::H256;
use sp_runtime::traits::{BlakeTwo256, Hash as HashT};
use sp_runtime::{AccountId32, MultiSignature};

pub type AccountId = AccountId32;
pub type Balance = u128;
pub type TickNumber = u64;
pub type Signature = MultiSignature;

/// Identifier of a Main or Backup Storage Provider.
pub type ProviderId = H256;
pub type BucketId = H256;
pub type FileKey = H256;
pub type Fingerprint = H256;
/// Root of a forest (a bucket's or a BSP's Merkle Patricia trie of file keys).
pub type MerkleHash = H256;
pub type ValuePropId = H256;
pub type RandomnessSeed = H256;

/// Amount of storage, in bytes.
pub type StorageData = u64;
pub type ReputationWeight = u32;
/// The type used for the volunteering thresholds of BSPs.
pub type ThresholdType = u32;

pub type MultiAddress = Vec<u8>;
pub type PeerId = Vec<u8>;

/// The accumulated price of storing a giga-unit of data since genesis.
pub type PriceIndex = Balance;

/// Trie layout of every forest and file trie in the system.
pub type StorageProofsMerkleTrieLayout = sp_trie::LayoutV1<BlakeTwo256>;

pub type ForestVerifierFor = ForestVerifier<StorageProofsMerkleTrieLayout, { shp_constants::H_LENGTH }>;
pub type FileKeyVerifierFor = FileKeyVerifier<StorageProofsMerkleTrieLayout>;

/// Hashes the concatenation of the encodings of `parts`.
pub(crate) fn hash_concat(parts: &[&[u8]]) -> H256 {
    let mut preimage = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        preimage.extend_from_slice(part);
    }
    BlakeTwo256::hash(&preimage)
}

/// Who is calling an operation.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Origin {
    Signed(AccountId),
    /// Governance.
    Root,
}

impl Origin {
    pub fn signed(who: &AccountId) -> Self {
        Origin::Signed(who.clone())
    }
}

/// The kind of a registered provider, carrying its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Encode, Decode, TypeInfo)]
pub enum StorageProviderId {
    BackupStorageProvider(ProviderId),
    MainStorageProvider(ProviderId),
}

impl StorageProviderId {
    pub fn id(&self) -> ProviderId {
        match self {
            StorageProviderId::BackupStorageProvider(id) => *id,
            StorageProviderId::MainStorageProvider(id) => *id,
        }
    }
}

/// Reasons under which the core holds funds of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Encode, Decode, TypeInfo)]
pub enum HoldReason {
    /// Deposit backing the capacity of a storage provider (its stake).
    StorageProviderDeposit,
    /// Deposit paid by the owner of a bucket.
    BucketDeposit,
    /// Deposit paid when issuing a storage request.
    StorageRequestCreationHold,
    /// Deposit that a user has to pay to open payment streams.
    PaymentStreamDeposit,
}
