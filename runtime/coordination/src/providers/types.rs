use codec::{Decode, Encode};
use scale_info::TypeInfo;
use sp_runtime::traits::{BlakeTwo256, Hash};

use crate::types::{
    AccountId, Balance, BucketId, MerkleHash, MultiAddress, ProviderId, ReputationWeight,
    StorageData, TickNumber, ValuePropId,
};

/// An offer of an MSP: the price of storing data and the maximum size of a bucket.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct ValueProposition {
    pub price_per_giga_unit_of_data_per_tick: Balance,
    /// Free-form terms of the offer (e.g. a hash of a service agreement).
    pub commitment: Vec<u8>,
    pub bucket_data_limit: StorageData,
    /// Unavailable value propositions can't be chosen for new buckets.
    pub available: bool,
}

impl ValueProposition {
    pub fn new(
        price_per_giga_unit_of_data_per_tick: Balance,
        commitment: Vec<u8>,
        bucket_data_limit: StorageData,
    ) -> Self {
        Self {
            price_per_giga_unit_of_data_per_tick,
            commitment,
            bucket_data_limit,
            available: true,
        }
    }

    /// The id of a value proposition is the hash of its terms.
    pub fn derive_id(&self) -> ValuePropId {
        BlakeTwo256::hash_of(&(
            self.price_per_giga_unit_of_data_per_tick,
            &self.commitment,
            self.bucket_data_limit,
        ))
    }
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct MainStorageProvider {
    pub capacity: StorageData,
    pub capacity_used: StorageData,
    pub multiaddresses: Vec<MultiAddress>,
    pub amount_of_buckets: u32,
    pub amount_of_value_props: u32,
    pub last_capacity_change: TickNumber,
    pub owner_account: AccountId,
    pub payment_account: AccountId,
    pub sign_up_tick: TickNumber,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct BackupStorageProvider {
    pub capacity: StorageData,
    pub capacity_used: StorageData,
    pub multiaddresses: Vec<MultiAddress>,
    /// Root of the forest of every file the BSP stores.
    pub root: MerkleHash,
    pub last_capacity_change: TickNumber,
    pub owner_account: AccountId,
    pub payment_account: AccountId,
    pub reputation_weight: ReputationWeight,
    pub sign_up_tick: TickNumber,
}

/// A container of files owned by a user and stored by (at most) one MSP.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct Bucket {
    /// Root of the forest of the files in the bucket.
    pub root: MerkleHash,
    pub user_id: AccountId,
    /// `None` while the bucket is not stored by any MSP.
    pub msp_id: Option<ProviderId>,
    pub private: bool,
    pub size: StorageData,
    pub value_prop_id: ValuePropId,
    pub name: Vec<u8>,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct MainStorageProviderSignUpRequest {
    pub msp_info: MainStorageProvider,
    pub value_prop: ValueProposition,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub enum SignUpRequestSpParams {
    MainStorageProvider(MainStorageProviderSignUpRequest),
    BackupStorageProvider(BackupStorageProvider),
}

impl SignUpRequestSpParams {
    pub fn capacity(&self) -> StorageData {
        match self {
            SignUpRequestSpParams::MainStorageProvider(request) => request.msp_info.capacity,
            SignUpRequestSpParams::BackupStorageProvider(bsp) => bsp.capacity,
        }
    }
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct SignUpRequest {
    pub sp_sign_up_request: SignUpRequestSpParams,
    /// Tick in which the request was made.
    pub at: TickNumber,
}

/// Grace period of a provider whose deposit fell below what its capacity requires.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub struct TopUpMetadata {
    pub started_at: TickNumber,
    /// The provider becomes insolvent at this tick if it has not topped up by then.
    pub end_tick_grace_period: TickNumber,
}

/// A registered provider, as returned by [`crate::Runtime::get_provider`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StorageProvider {
    MainStorageProvider(MainStorageProvider),
    BackupStorageProvider(BackupStorageProvider),
}
