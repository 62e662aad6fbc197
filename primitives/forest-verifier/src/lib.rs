#![cfg_attr(not(feature = "std"), no_std)]

use shp_traits::{CommitmentVerifier, TrieMutation, TrieProofDeltaApplier};
use sp_runtime::DispatchError;
use sp_std::{collections::btree_set::BTreeSet, vec::Vec};
use sp_trie::{
    CompactProof, MemoryDB, TrieConfiguration, TrieDBBuilder, TrieDBMutBuilder, TrieMut,
};
use trie_db::TrieIterator;

#[cfg(test)]
mod tests;

/// The root of a forest with no leaves for the trie layout `T`.
pub fn empty_forest_root<T: TrieConfiguration>() -> <T::Hash as sp_core::Hasher>::Out {
    sp_trie::empty_trie_root::<T>()
}

/// A struct that implements the `CommitmentVerifier` trait, where the commitment
/// is a Merkle Patricia Trie root hash and the response to a challenge is given
/// by either the exact key or the next and previous keys in the trie.
pub struct ForestVerifier<T: TrieConfiguration, const H_LENGTH: usize>(
    core::marker::PhantomData<T>,
)
where
    <T::Hash as sp_core::Hasher>::Out: for<'a> TryFrom<&'a [u8; H_LENGTH]>;

impl<T: TrieConfiguration, const H_LENGTH: usize> ForestVerifier<T, H_LENGTH>
where
    <T::Hash as sp_core::Hasher>::Out: for<'a> TryFrom<&'a [u8; H_LENGTH]>,
{
    fn to_key(raw: &[u8]) -> Result<<T::Hash as sp_core::Hasher>::Out, DispatchError> {
        let raw: &[u8; H_LENGTH] = raw
            .try_into()
            .map_err(|_| "Failed to convert proven key to a fixed size array.")?;

        raw.try_into()
            .map_err(|_| "Failed to convert proven key.".into())
    }
}

impl<T: TrieConfiguration, const H_LENGTH: usize> CommitmentVerifier for ForestVerifier<T, H_LENGTH>
where
    <T::Hash as sp_core::Hasher>::Out: for<'a> TryFrom<&'a [u8; H_LENGTH]>,
{
    type Proof = CompactProof;
    type Commitment = <T::Hash as sp_core::Hasher>::Out;
    type Challenge = <T::Hash as sp_core::Hasher>::Out;

    /// Verifies a proof against a root (i.e. commitment) and a set of challenges.
    ///
    /// For every challenge, the proof has to contain either the exact leaf, or the pair of
    /// consecutive leaves surrounding it (only one of them when the challenge falls before the
    /// first or after the last leaf). The returned set holds every leaf key the proof responded
    /// with, so a challenge is included in the forest if and only if it belongs to that set.
    ///
    /// An empty forest proves the absence of every key, so no leaves are returned for it.
    fn verify_proof(
        root: &Self::Commitment,
        challenges: &[Self::Challenge],
        proof: &Self::Proof,
    ) -> Result<BTreeSet<Self::Challenge>, DispatchError> {
        if challenges.is_empty() {
            return Err("No challenges provided.".into());
        }

        if *root == empty_forest_root::<T>() {
            return Ok(BTreeSet::new());
        }

        // Rebuilds the partial trie from the proof, failing if its root is not `root`.
        let (memdb, root) = proof.to_memory_db::<T::Hash>(Some(root)).map_err(|_| {
            "Failed to convert proof to memory DB, root doesn't match with expected."
        })?;

        let trie = TrieDBBuilder::<T>::new(&memdb, &root).build();

        let mut trie_de_iter = trie
            .into_double_ended_iter()
            .map_err(|_| "Failed to create trie iterator.")?;

        let mut proven_keys = BTreeSet::new();

        for challenge in challenges {
            trie_de_iter
                .seek(challenge.as_ref())
                .map_err(|_| "Failed to seek challenged key.")?;

            // After a seek, `next()` yields the challenged leaf or the first leaf after it.
            let next_leaf = trie_de_iter
                .next()
                .transpose()
                .map_err(|_| "Failed to get next leaf.")?;

            // And `next_back()` the challenged leaf or the last leaf before it.
            let prev_leaf = trie_de_iter
                .next_back()
                .transpose()
                .map_err(|_| "Failed to get previous leaf.")?;

            let challenged = challenge.as_ref();

            match (prev_leaf, next_leaf) {
                // The challenged key is a leaf of the forest.
                (_, Some((next_key, _))) if next_key.as_slice() == challenged => {
                    proven_keys.insert(Self::to_key(&next_key)?);
                }
                // The challenged key falls between two consecutive leaves.
                (Some((prev_key, _)), Some((next_key, _)))
                    if prev_key.as_slice() < challenged && challenged < next_key.as_slice() =>
                {
                    proven_keys.insert(Self::to_key(&prev_key)?);
                    proven_keys.insert(Self::to_key(&next_key)?);
                }
                // The challenged key is before the first leaf.
                (None, Some((next_key, _))) if challenged < next_key.as_slice() => {
                    proven_keys.insert(Self::to_key(&next_key)?);
                }
                // The challenged key is after the last leaf.
                (Some((prev_key, _)), None) if prev_key.as_slice() < challenged => {
                    proven_keys.insert(Self::to_key(&prev_key)?);
                }
                (None, None) => {
                    return Err("No leaves provided in proof.".into());
                }
                _ => {
                    return Err("Proof is invalid.".into());
                }
            }
        }

        Ok(proven_keys)
    }
}

impl<T: TrieConfiguration, const H_LENGTH: usize> TrieProofDeltaApplier<T::Hash>
    for ForestVerifier<T, H_LENGTH>
where
    <T::Hash as sp_core::Hasher>::Out: for<'a> TryFrom<&'a [u8; H_LENGTH]>,
{
    type Proof = CompactProof;
    type Key = <T::Hash as sp_core::Hasher>::Out;

    /// Applies `mutations`, in order, to the partial trie contained in `proof`.
    ///
    /// The proof must be built against `root` and cover every mutated key: the exact leaf for
    /// removals and the neighbouring leaves for additions. Adding a key that already exists or
    /// removing one that does not is an error. A root equal to the empty forest root needs no
    /// proof nodes.
    fn apply_delta(
        root: &Self::Key,
        mutations: &[(Self::Key, TrieMutation)],
        proof: &Self::Proof,
    ) -> Result<(MemoryDB<T::Hash>, Self::Key, Vec<(Self::Key, Option<Vec<u8>>)>), DispatchError>
    {
        if mutations.is_empty() {
            return Err("No mutations provided.".into());
        }

        let (mut memdb, mut root) = if *root == empty_forest_root::<T>() {
            MemoryDB::<T::Hash>::default_with_root()
        } else {
            // A `CompactProof` cannot back a mutable trie directly, so it is expanded first.
            let (storage_proof, root) = proof
                .to_storage_proof::<T::Hash>(Some(root))
                .map_err(|_| {
                    "Failed to convert proof to memory DB, root doesn't match with expected."
                })?;
            let memdb: MemoryDB<T::Hash> = storage_proof.to_memory_db();
            (memdb, root)
        };

        let mut mutated_keys_and_values = Vec::with_capacity(mutations.len());

        let mut trie = TrieDBMutBuilder::<T>::from_existing(&mut memdb, &mut root).build();

        for (key, mutation) in mutations {
            let previous = trie
                .get(key.as_ref())
                .map_err(|_| "Failed to read mutated key from the partial trie.")?;

            match mutation {
                TrieMutation::Add(add) => {
                    if previous.is_some() {
                        return Err("Key to add is already in the trie.".into());
                    }
                    trie.insert(key.as_ref(), &add.value)
                        .map_err(|_| "Failed to insert key into trie.")?;
                }
                TrieMutation::Remove(remove) => {
                    let Some(current) = previous.as_ref() else {
                        return Err("Key to remove is not in the trie.".into());
                    };
                    if let Some(expected) = &remove.maybe_value {
                        if expected != current {
                            return Err("Value of key to remove does not match.".into());
                        }
                    }
                    trie.remove(key.as_ref())
                        .map_err(|_| "Failed to remove key from trie.")?;
                }
            }

            mutated_keys_and_values.push((*key, previous));
        }

        let new_root = *trie.root();

        drop(trie);

        Ok((memdb, new_root, mutated_keys_and_values))
    }
}
