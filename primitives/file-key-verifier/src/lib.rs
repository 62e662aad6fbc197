#![cfg_attr(not(feature = "std"), no_std)]

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_file_metadata::{Chunk, ChunkId, ChunkIdError, FileMetadata, Leaf};
use shp_traits::CommitmentVerifier;
use sp_core::{Hasher, H256};
use sp_runtime::DispatchError;
use sp_std::{collections::btree_set::BTreeSet, vec::Vec};
use sp_trie::{CompactProof, Trie, TrieDBBuilder, TrieLayout};


/// Proof that a provider holds some chunks of a file.
///
/// It carries the full metadata of the file, so that the verifier can recompute the file key
/// and learn the fingerprint (root of the file trie) the chunk proof is checked against.
#[derive(Clone, Debug, PartialEq, Eq, TypeInfo, Encode, Decode)]
pub struct FileKeyProof {
    pub file_metadata: FileMetadata,
    pub proof: CompactProof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenFileKeyError {
    /// The root hash of the trie does not match the fingerprint.
    TrieAndExpectedRootMismatch,
    /// Trie internal error: failed to get trie key iterator.
    FailedToGetTrieKeyIterator,
    /// Trie internal error: failed to get trie value.
    FailedToGetTrieValue,
    /// The key is not found in the trie.
    KeyNotFoundInTrie,
    /// A trie key is not a valid chunk id.
    ChunkIdFromKeyError(ChunkIdError),
}

impl FileKeyProof {
    pub fn new(file_metadata: FileMetadata, proof: CompactProof) -> Self {
        Self {
            file_metadata,
            proof,
        }
    }

    /// Every chunk whose leaf is fully contained in the proof.
    pub fn proven<T: TrieLayout>(&self) -> Result<Vec<Leaf<ChunkId, Chunk>>, ProvenFileKeyError>
    where
        T::Hash: Hasher<Out = H256>,
    {
        let (memdb, root) = self
            .proof
            .to_memory_db::<T::Hash>(Some(&self.file_metadata.fingerprint))
            .map_err(|_| ProvenFileKeyError::TrieAndExpectedRootMismatch)?;

        let trie = TrieDBBuilder::<T>::new(&memdb, &root).build();
        let trie_iter = trie
            .key_iter()
            .map_err(|_| ProvenFileKeyError::FailedToGetTrieKeyIterator)?;

        let mut proven = Vec::new();

        // Keys whose nodes are missing from the proof come out as errors and are skipped.
        for key in trie_iter.flatten() {
            let chunk_id =
                ChunkId::from_trie_key(&key).map_err(ProvenFileKeyError::ChunkIdFromKeyError)?;
            let chunk = trie
                .get(&key)
                .map_err(|_| ProvenFileKeyError::FailedToGetTrieValue)?
                .ok_or(ProvenFileKeyError::KeyNotFoundInTrie)?;
            proven.push(Leaf::new(chunk_id, chunk));
        }

        Ok(proven)
    }
}

/// A struct that implements the `CommitmentVerifier` trait, where the commitment is the file
/// key and the response to a challenge is the chunk at index `challenge % chunks_count`.
pub struct FileKeyVerifier<T: TrieLayout>(core::marker::PhantomData<T>)
where
    T::Hash: Hasher<Out = H256>;

impl<T: TrieLayout> CommitmentVerifier for FileKeyVerifier<T>
where
    T::Hash: Hasher<Out = H256>,
{
    type Proof = FileKeyProof;
    type Commitment = H256;
    type Challenge = H256;

    /// Verifies that `proof` answers every challenge for the file identified by
    /// `expected_file_key`.
    ///
    /// The number of challenges must match [`FileMetadata::chunks_to_check`], so a provider
    /// cannot get away with proving fewer chunks of a large file.
    fn verify_proof(
        expected_file_key: &Self::Commitment,
        challenges: &[Self::Challenge],
        proof: &Self::Proof,
    ) -> Result<BTreeSet<Self::Challenge>, DispatchError> {
        if challenges.is_empty() {
            return Err("No challenges provided.".into());
        }

        let metadata = &proof.file_metadata;

        if T::Hash::hash(&metadata.encode()) != *expected_file_key {
            return Err(
                "File key provided should be equal to the file key constructed from the proof."
                    .into(),
            );
        }

        if challenges.len() != metadata.chunks_to_check() as usize {
            return Err(
                "Number of challenges does not match the number of chunks that should have been challenged for a file of this size."
                    .into(),
            );
        }

        // Rebuilds the partial file trie, failing if its root is not the fingerprint.
        let (memdb, root) = proof
            .proof
            .to_memory_db::<T::Hash>(Some(&metadata.fingerprint))
            .map_err(|_| {
                "Failed to convert proof to memory DB, root doesn't match with expected."
            })?;

        let trie = TrieDBBuilder::<T>::new(&memdb, &root).build();

        let chunks_count = metadata.chunks_count();
        let mut proven_challenges = BTreeSet::new();

        for challenge in challenges {
            let chunk_id = ChunkId::from_challenge(challenge.as_ref(), chunks_count);

            let chunk = trie
                .get(&chunk_id.as_trie_key())
                .map_err(|_| "The proof is invalid. The challenge does not exist in the trie.")?;

            if chunk.is_none() {
                return Err(
                    "The proof is invalid. The challenged chunk was not found in the trie.".into(),
                );
            }

            proven_challenges.insert(*challenge);
        }

        Ok(proven_challenges)
    }
}
