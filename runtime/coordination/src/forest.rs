//! Forests of buckets and BSPs.
//!
//! The runtime only keeps the root of every forest. Leaves map a file key to the encoded
//! [`FileMetadata`] of the file, and the file key is the hash of that value. Any change to a
//! forest has to come with a proof against its current root, so a proof built against an
//! outdated root is always rejected.

use std::collections::BTreeSet;

use log::warn;
use shp_file_metadata::FileMetadata;
use shp_forest_verifier::empty_forest_root;
use shp_traits::{CommitmentVerifier, TrieMutation, TrieProofDeltaApplier};
use sp_runtime::traits::BlakeTwo256;
use sp_trie::CompactProof;

use crate::{
    types::{
        BucketId, FileKey, ForestVerifierFor, MerkleHash, ProviderId, StorageProofsMerkleTrieLayout,
    },
    Ledger, Runtime,
};

const LOG_TARGET: &str = "runtime::forest";

/// Identifies one of the forests anchored in the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrieId {
    Bucket(BucketId),
    Bsp(ProviderId),
}

/// Root of a forest without files.
pub fn default_forest_root() -> MerkleHash {
    empty_forest_root::<StorageProofsMerkleTrieLayout>()
}

/// Verifies `proof` against `root` for `keys`, returning the file keys it proves to be in the
/// forest. A key is in the forest if and only if it belongs to the returned set.
pub fn verify_forest_proof(
    root: &MerkleHash,
    keys: &[FileKey],
    proof: &CompactProof,
) -> Result<BTreeSet<FileKey>, sp_runtime::DispatchError> {
    ForestVerifierFor::verify_proof(root, keys, proof)
}

pub fn verify_inclusion_proof(root: &MerkleHash, proof: &CompactProof, keys: &[FileKey]) -> bool {
    match verify_forest_proof(root, keys, proof) {
        Ok(proven) => keys.iter().all(|key| proven.contains(key)),
        Err(_) => false,
    }
}

pub fn verify_non_inclusion_proof(
    root: &MerkleHash,
    proof: &CompactProof,
    keys: &[FileKey],
) -> bool {
    match verify_forest_proof(root, keys, proof) {
        Ok(proven) => keys.iter().all(|key| !proven.contains(key)),
        Err(_) => false,
    }
}

/// Result of applying a batch of mutations to a forest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedMutations {
    pub old_root: MerkleHash,
    pub new_root: MerkleHash,
    /// Every mutated key with the value it held before the mutation.
    pub previous_values: Vec<(FileKey, Option<Vec<u8>>)>,
}

impl AppliedMutations {
    /// Metadata of the files that were removed by the batch.
    pub fn removed_files(&self) -> Vec<(FileKey, FileMetadata)> {
        self.previous_values
            .iter()
            .filter_map(|(key, value)| {
                let value = value.as_ref()?;
                match FileMetadata::from_leaf_value(value) {
                    Ok(metadata) => Some((*key, metadata)),
                    Err(_) => {
                        warn!(target: LOG_TARGET, "Removed leaf {:?} does not hold file metadata", key);
                        None
                    }
                }
            })
            .collect()
    }
}

impl<L: Ledger> Runtime<L> {
    /// The anchor of a forest, if its bucket or BSP exists.
    pub fn get_forest_root(&self, trie_id: TrieId) -> Option<MerkleHash> {
        match trie_id {
            TrieId::Bucket(bucket_id) => self
                .state
                .providers
                .buckets
                .get(&bucket_id)
                .map(|bucket| bucket.root),
            TrieId::Bsp(bsp_id) => self
                .state
                .providers
                .backup_storage_providers
                .get(&bsp_id)
                .map(|bsp| bsp.root),
        }
    }

    fn set_forest_root(&mut self, trie_id: TrieId, root: MerkleHash) -> Option<()> {
        match trie_id {
            TrieId::Bucket(bucket_id) => {
                self.state.providers.buckets.get_mut(&bucket_id)?.root = root;
            }
            TrieId::Bsp(bsp_id) => {
                self.state
                    .providers
                    .backup_storage_providers
                    .get_mut(&bsp_id)?
                    .root = root;
            }
        }
        Some(())
    }

    /// Applies `mutations` atomically to the forest `trie_id`, using `proof` against its current
    /// root. Either every mutation applies and the root is updated once, or nothing changes.
    pub fn apply_mutations(
        &mut self,
        trie_id: TrieId,
        mutations: &[(FileKey, TrieMutation)],
        proof: &CompactProof,
    ) -> Result<AppliedMutations, sp_runtime::DispatchError> {
        let old_root = self
            .get_forest_root(trie_id)
            .ok_or("Forest to mutate does not exist.")?;

        let (_, new_root, previous_values) =
            <ForestVerifierFor as TrieProofDeltaApplier<BlakeTwo256>>::apply_delta(
                &old_root, mutations, proof,
            )?;

        self.set_forest_root(trie_id, new_root)
            .ok_or("Forest to mutate does not exist.")?;

        Ok(AppliedMutations {
            old_root,
            new_root,
            previous_values,
        })
    }

    /// Single key form of [`Self::apply_mutations`].
    pub fn apply_mutation(
        &mut self,
        trie_id: TrieId,
        file_key: FileKey,
        mutation: TrieMutation,
        proof: &CompactProof,
    ) -> Result<AppliedMutations, sp_runtime::DispatchError> {
        self.apply_mutations(trie_id, &[(file_key, mutation)], proof)
    }
}

#[cfg(test)]
mod tests {
    use codec::Encode;
    use shp_traits::{TrieAddMutation, TrieRemoveMutation};

    use super::*;
    use crate::mock::*;

    const FILE_SIZE: usize = 1_024;

    /// Eve's bucket on Alice's MSP and two files of it, none stored yet.
    fn setup() -> (Test, BucketId, ProviderNode, TestFile, TestFile) {
        let mut rt = new_test_ext();
        let (msp_id, value_prop_id) = register_msp(&mut rt, &alice());
        let bucket_id = create_bucket(&mut rt, &eve(), msp_id, value_prop_id, b"photos");
        let first = TestFile::new(&eve(), bucket_id, b"photos/first.png", FILE_SIZE, 1);
        let second = TestFile::new(&eve(), bucket_id, b"photos/second.png", FILE_SIZE, 2);

        (rt, bucket_id, ProviderNode::new(msp_id), first, second)
    }

    fn add(file: &TestFile) -> (FileKey, TrieMutation) {
        (file.file_key, TrieAddMutation::new(file.metadata.encode()).into())
    }

    #[test]
    fn mutations_move_the_anchor_to_the_new_root() {
        let (mut rt, bucket_id, mut node, first, second) = setup();
        let trie_id = TrieId::Bucket(bucket_id);
        assert_eq!(rt.get_forest_root(trie_id), Some(default_forest_root()));

        let proof = node.forest_proof(&[first.file_key, second.file_key]);
        let applied = rt
            .apply_mutations(trie_id, &[add(&first), add(&second)], &proof)
            .unwrap();
        node.add_to_forest(&[&first, &second]);

        assert_eq!(applied.old_root, default_forest_root());
        assert_eq!(applied.new_root, node.root());
        assert!(applied.removed_files().is_empty());
        assert_eq!(rt.get_forest_root(trie_id), Some(node.root()));

        let proof = node.forest_proof(&[first.file_key]);
        let applied = rt
            .apply_mutation(
                trie_id,
                first.file_key,
                TrieRemoveMutation::default().into(),
                &proof,
            )
            .unwrap();
        node.remove_from_forest(&first.file_key);

        assert_eq!(applied.removed_files(), vec![(first.file_key, first.metadata.clone())]);
        assert_eq!(rt.get_forest_root(trie_id), Some(node.root()));
    }

    #[test]
    fn proofs_against_an_outdated_root_are_rejected() {
        let (mut rt, bucket_id, mut node, first, second) = setup();
        let trie_id = TrieId::Bucket(bucket_id);
        let empty_forest_proof = node.forest_proof(&[first.file_key]);

        assert!(rt
            .apply_mutation(trie_id, first.file_key, add(&first).1, &empty_forest_proof)
            .is_ok());
        node.add_to_forest(&[&first]);

        assert!(rt
            .apply_mutation(trie_id, second.file_key, add(&second).1, &empty_forest_proof)
            .is_err());
        assert_eq!(rt.get_forest_root(trie_id), Some(node.root()));
    }

    #[test]
    fn unknown_forests_cannot_be_mutated() {
        let (mut rt, _, node, first, _) = setup();
        let proof = node.forest_proof(&[first.file_key]);

        assert_eq!(rt.get_forest_root(TrieId::Bsp(ProviderId::repeat_byte(5))), None);
        assert!(rt
            .apply_mutation(
                TrieId::Bsp(ProviderId::repeat_byte(5)),
                first.file_key,
                add(&first).1,
                &proof,
            )
            .is_err());
    }

    #[test]
    fn inclusion_and_non_inclusion() {
        let (_, _, mut node, first, second) = setup();
        node.add_to_forest(&[&first]);
        let root = node.root();

        let proof = node.forest_proof(&[first.file_key]);
        assert!(verify_inclusion_proof(&root, &proof, &[first.file_key]));
        assert!(!verify_non_inclusion_proof(&root, &proof, &[first.file_key]));

        let proof = node.forest_proof(&[second.file_key]);
        assert!(verify_non_inclusion_proof(&root, &proof, &[second.file_key]));
        assert!(!verify_inclusion_proof(&root, &proof, &[second.file_key]));

        // A proof for another root proves nothing
        assert!(!verify_inclusion_proof(&default_forest_root(), &proof, &[first.file_key]));
    }
}
