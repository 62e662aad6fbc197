#![cfg_attr(not(feature = "std"), no_std)]

use codec::{Compact, Decode, Encode};
use num_bigint::BigUint;
use scale_info::TypeInfo;
use shp_constants::{FILE_CHUNK_SIZE, FILE_SIZE_TO_CHALLENGES};
use shp_traits::AsCompact;
use sp_arithmetic::traits::SaturatedConversion;
use sp_core::{Hasher, H256};
use sp_runtime::traits::BlakeTwo256;
use sp_std::vec::Vec;

/// Identifier of a file: the hash of its SCALE-encoded [`FileMetadata`].
pub type FileKey = H256;

/// Root of the merklised file content.
pub type Fingerprint = H256;

/// Typed chunk of a file. This is what is stored in the leaves of a file trie.
pub type Chunk = Vec<u8>;

/// Everything that identifies a stored file.
///
/// The encoded metadata is also the value of the file's leaf in a forest, so whoever holds a
/// proof of a leaf can recover the file's owner and size from it.
#[derive(Clone, Debug, PartialEq, Eq, TypeInfo, Encode, Decode)]
pub struct FileMetadata {
    pub owner: Vec<u8>,
    pub bucket_id: Vec<u8>,
    pub location: Vec<u8>,
    #[codec(compact)]
    pub file_size: u64,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMetadataError {
    /// A file of zero bytes cannot be stored nor challenged.
    InvalidFileSize,
    /// The location of the file is empty.
    InvalidLocation,
    /// The leaf value could not be decoded as file metadata.
    InvalidEncoding,
}

impl FileMetadata {
    pub fn new(
        owner: Vec<u8>,
        bucket_id: Vec<u8>,
        location: Vec<u8>,
        file_size: u64,
        fingerprint: Fingerprint,
    ) -> Result<Self, FileMetadataError> {
        if file_size == 0 {
            return Err(FileMetadataError::InvalidFileSize);
        }
        if location.is_empty() {
            return Err(FileMetadataError::InvalidLocation);
        }

        Ok(Self {
            owner,
            bucket_id,
            location,
            file_size,
            fingerprint,
        })
    }

    /// Decode the metadata stored as the value of a forest leaf.
    pub fn from_leaf_value(value: &[u8]) -> Result<Self, FileMetadataError> {
        Self::decode(&mut &value[..]).map_err(|_| FileMetadataError::InvalidEncoding)
    }

    pub fn file_key(&self) -> FileKey {
        BlakeTwo256::hash(self.encode().as_slice())
    }

    /// Number of chunks that have to be proven for this file in every key proof.
    pub fn chunks_to_check(&self) -> u32 {
        // Saturating at u32::MAX challenges is already far beyond any realistic file.
        (self.file_size / FILE_SIZE_TO_CHALLENGES
            + (self.file_size % FILE_SIZE_TO_CHALLENGES != 0) as u64)
            .saturated_into::<u32>()
    }

    pub fn chunks_count(&self) -> u64 {
        self.file_size / FILE_CHUNK_SIZE + (self.file_size % FILE_CHUNK_SIZE != 0) as u64
    }

    pub fn last_chunk_id(&self) -> ChunkId {
        ChunkId::new(self.chunks_count().saturating_sub(1))
    }
}

/// Typed u64 representing the index of a file [`Chunk`]. Indexed from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypeInfo, Encode, Decode, Ord, PartialOrd, Hash)]
pub struct ChunkId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkIdError {
    InvalidChunkId,
}

impl ChunkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Map a challenge (a big endian hash) onto one of the `chunks_count` chunks of a file.
    ///
    /// `chunks_count` must be non-zero, which every valid [`FileMetadata`] guarantees.
    pub fn from_challenge(challenge: &[u8], chunks_count: u64) -> Self {
        let challenged_chunk = BigUint::from_bytes_be(challenge) % chunks_count.max(1);
        // The remainder of a division by a u64 always fits in a u64.
        ChunkId::new(challenged_chunk.try_into().unwrap_or_default())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_trie_key(&self) -> Vec<u8> {
        AsCompact(self.0).encode()
    }

    pub fn from_trie_key(key: &[u8]) -> Result<Self, ChunkIdError> {
        let id = Compact::<u64>::decode(&mut &key[..])
            .map_err(|_| ChunkIdError::InvalidChunkId)?
            .0;
        Ok(Self(id))
    }
}

/// A leaf of a trie, keyed by `K`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf<K, D> {
    pub key: K,
    pub data: D,
}

impl<K, D> Leaf<K, D> {
    pub fn new(key: K, data: D) -> Self {
        Self { key, data }
    }
}
