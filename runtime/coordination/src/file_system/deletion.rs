//! Deletion of files by their owners.
//!
//! An owner signs a [`FileOperationIntention`] off-chain. Anyone holding the signed intention
//! (the MSP of the bucket, a BSP storing the file or a fisherman) can then remove the file from
//! the bucket's forest or from a BSP's forest, proving that the file is there.
//!
//! Files left behind by incomplete storage requests need no signature: the runtime already knows
//! which forests still have to drop them.

use std::collections::BTreeSet;

use codec::{Decode, Encode};
use log::info;
use scale_info::TypeInfo;
use shp_traits::{TrieMutation, TrieRemoveMutation};
use sp_runtime::traits::Verify;
use sp_trie::CompactProof;

use super::{
    utils::{ensure_all_included, file_metadata_for, total_size},
    Error, Event, LOG_TARGET,
};
use crate::{
    ensure_signed,
    error::{ensure, DispatchError, DispatchResult},
    forest::{default_forest_root, AppliedMutations, TrieId},
    types::{
        AccountId, BucketId, FileKey, Fingerprint, Origin, ProviderId, Signature, StorageData,
    },
    Ledger, Runtime,
};

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileOperation {
    Delete,
}

/// What the owner of a file signs to authorise an operation on it.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct FileOperationIntention {
    pub file_key: FileKey,
    pub operation: FileOperation,
}

#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct FileDeletionRequest {
    pub file_owner: AccountId,
    pub signed_intention: FileOperationIntention,
    /// Signature of `file_owner` over the encoded `signed_intention`.
    pub signature: Signature,
    pub bucket_id: BucketId,
    pub location: Vec<u8>,
    pub size: StorageData,
    pub fingerprint: Fingerprint,
}

/// A removal that was checked against the runtime and can be applied to a forest.
struct CheckedDeletion {
    file_key: FileKey,
    owner: AccountId,
    bucket_id: BucketId,
    size: StorageData,
}

impl<L: Ledger> Runtime<L> {
    /// Delete files of a bucket, either from the bucket's forest (`bsp_id` is `None`) or from the
    /// forest of `bsp_id`.
    ///
    /// Every deletion has to carry the owner's signature of the intention, and all of them have
    /// to belong to the same bucket.
    ///
    /// Emits `BucketFileDeletionsCompleted` or `BspFileDeletionsCompleted` event when successful.
    pub fn delete_files(
        &mut self,
        origin: Origin,
        file_deletions: Vec<FileDeletionRequest>,
        bsp_id: Option<ProviderId>,
        forest_proof: CompactProof,
    ) -> DispatchResult {
        ensure_signed(origin)?;

        self.transactional(|rt| rt.do_delete_files(file_deletions, bsp_id, forest_proof))
    }

    /// Remove files of incomplete storage requests from the forest that still holds them,
    /// either a bucket's (`bsp_id` is `None`) or a BSP's.
    ///
    /// Emits `BucketFileDeletionsCompleted` or `BspFileDeletionsCompleted` event when successful.
    pub fn delete_files_for_incomplete_storage_request(
        &mut self,
        origin: Origin,
        file_keys: Vec<FileKey>,
        bsp_id: Option<ProviderId>,
        forest_proof: CompactProof,
    ) -> DispatchResult {
        ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_delete_files_for_incomplete_storage_request(file_keys, bsp_id, forest_proof)
        })
    }

    fn do_delete_files(
        &mut self,
        file_deletions: Vec<FileDeletionRequest>,
        bsp_id: Option<ProviderId>,
        forest_proof: CompactProof,
    ) -> DispatchResult {
        self.ensure_deletion_batch_size(file_deletions.len())?;

        let bucket_id = file_deletions
            .first()
            .map(|deletion| deletion.bucket_id)
            .ok_or(Error::FileDeletionsEmpty)?;
        ensure!(
            file_deletions
                .iter()
                .all(|deletion| deletion.bucket_id == bucket_id),
            Error::BatchFileDeletionMustContainSingleBucket
        );

        let bucket_owner = self
            .get_bucket(&bucket_id)
            .ok_or(Error::BucketNotFound)?
            .user_id
            .clone();

        let mut seen = BTreeSet::new();
        let mut deletions = Vec::with_capacity(file_deletions.len());
        for deletion in file_deletions {
            let file_key = deletion.signed_intention.file_key;
            ensure!(seen.insert(file_key), Error::DuplicateFileKeyInBatch);

            // Check that the owner signed the intention.
            ensure!(
                deletion.signature.verify(
                    &deletion.signed_intention.encode()[..],
                    &deletion.file_owner
                ),
                Error::InvalidSignature
            );

            // Check that the metadata provided corresponds to the file key.
            let metadata = file_metadata_for(
                &deletion.file_owner,
                &bucket_id,
                &deletion.location,
                deletion.size,
                deletion.fingerprint,
            )?;
            ensure!(metadata.file_key() == file_key, Error::InvalidFileKeyMetadata);

            ensure!(
                deletion.file_owner == bucket_owner,
                Error::FileOwnerNotBucketOwner
            );

            deletions.push(CheckedDeletion {
                file_key,
                owner: deletion.file_owner,
                bucket_id,
                size: deletion.size,
            });
        }

        self.apply_deletions(deletions, bsp_id, &forest_proof)
    }

    fn do_delete_files_for_incomplete_storage_request(
        &mut self,
        file_keys: Vec<FileKey>,
        bsp_id: Option<ProviderId>,
        forest_proof: CompactProof,
    ) -> DispatchResult {
        self.ensure_deletion_batch_size(file_keys.len())?;

        let mut seen = BTreeSet::new();
        let mut deletions = Vec::with_capacity(file_keys.len());
        for file_key in file_keys {
            ensure!(seen.insert(file_key), Error::DuplicateFileKeyInBatch);

            let incomplete = self
                .get_incomplete_storage_request(&file_key)
                .ok_or(Error::IncompleteStorageRequestNotFound)?;

            let pending = match bsp_id {
                Some(bsp_id) => incomplete.pending_bsp_removals.contains(&bsp_id),
                None => incomplete.pending_bucket_removal,
            };
            ensure!(pending, Error::FileKeyNotPendingDeletion);

            deletions.push(CheckedDeletion {
                file_key,
                owner: incomplete.owner.clone(),
                bucket_id: incomplete.bucket_id,
                size: incomplete.file_size,
            });
        }

        if bsp_id.is_none() {
            let bucket_id = deletions
                .first()
                .map(|deletion| deletion.bucket_id)
                .ok_or(Error::FileDeletionsEmpty)?;
            ensure!(
                deletions
                    .iter()
                    .all(|deletion| deletion.bucket_id == bucket_id),
                Error::BatchFileDeletionMustContainSingleBucket
            );
        }

        self.apply_deletions(deletions, bsp_id, &forest_proof)
    }

    fn ensure_deletion_batch_size(&self, len: usize) -> DispatchResult {
        ensure!(len > 0, Error::FileDeletionsEmpty);
        ensure!(
            len <= self.config.file_system.max_file_deletions_per_extrinsic as usize,
            Error::TooManyFileDeletions
        );
        Ok(())
    }

    /// Removes the files from the target forest and updates what providers and users are
    /// accounted for.
    fn apply_deletions(
        &mut self,
        deletions: Vec<CheckedDeletion>,
        bsp_id: Option<ProviderId>,
        forest_proof: &CompactProof,
    ) -> DispatchResult {
        let file_keys: Vec<FileKey> = deletions.iter().map(|deletion| deletion.file_key).collect();
        let mutations: Vec<(FileKey, TrieMutation)> = file_keys
            .iter()
            .map(|file_key| (*file_key, TrieRemoveMutation::default().into()))
            .collect();

        match bsp_id {
            Some(bsp_id) => {
                ensure!(self.is_bsp(&bsp_id), Error::NotABsp);
                let applied = self.remove_from_forest(
                    TrieId::Bsp(bsp_id),
                    &file_keys,
                    &mutations,
                    forest_proof,
                )?;

                let mut users = BTreeSet::new();
                for deletion in &deletions {
                    self.decrease_capacity_used(&bsp_id, deletion.size)?;
                    self.decrease_dynamic_amount_provided(&bsp_id, &deletion.owner, deletion.size)?;
                    self.file_system_on_bsp_key_removed(&bsp_id, &deletion.file_key);
                    users.insert(deletion.owner.clone());
                }

                if applied.new_root == default_forest_root() {
                    self.stop_challenge_cycle(bsp_id);
                }

                info!(
                    target: LOG_TARGET,
                    "Deleted {} files from the forest of BSP {:?}",
                    file_keys.len(),
                    bsp_id
                );
                self.deposit_event(Event::BspFileDeletionsCompleted {
                    users: users.into_iter().collect(),
                    file_keys,
                    bsp_id,
                    old_root: applied.old_root,
                    new_root: applied.new_root,
                });
            }
            None => {
                let deletion = deletions.first().ok_or(Error::FileDeletionsEmpty)?;
                let bucket_id = deletion.bucket_id;
                let user = deletion.owner.clone();
                let bucket = self.get_bucket(&bucket_id).ok_or(Error::BucketNotFound)?;
                let msp_id = bucket.msp_id;
                let bucket_owner = bucket.user_id.clone();

                let applied = self.remove_from_forest(
                    TrieId::Bucket(bucket_id),
                    &file_keys,
                    &mutations,
                    forest_proof,
                )?;
                self.deposit_event(Event::BucketRootChanged {
                    bucket_id,
                    old_root: applied.old_root,
                    new_root: applied.new_root,
                    mutations,
                });

                let removed_size = total_size(deletions.iter().map(|deletion| &deletion.size))?;
                self.decrease_bucket_size(&bucket_id, removed_size)?;
                if let Some(msp_id) = msp_id {
                    self.update_user_msp_fixed_rate(&msp_id, &bucket_owner)?;
                }
                for deletion in &deletions {
                    self.file_system_on_bucket_key_removed(&bucket_id, &deletion.file_key);
                }

                info!(
                    target: LOG_TARGET,
                    "Deleted {} files from bucket {:?}",
                    file_keys.len(),
                    bucket_id
                );
                self.deposit_event(Event::BucketFileDeletionsCompleted {
                    user,
                    file_keys,
                    bucket_id,
                    msp_id,
                    old_root: applied.old_root,
                    new_root: applied.new_root,
                });
            }
        }

        Ok(())
    }

    fn remove_from_forest(
        &mut self,
        trie_id: TrieId,
        file_keys: &[FileKey],
        mutations: &[(FileKey, TrieMutation)],
        forest_proof: &CompactProof,
    ) -> Result<AppliedMutations, DispatchError> {
        let root = self.get_forest_root(trie_id).ok_or(match trie_id {
            TrieId::Bucket(_) => Error::BucketNotFound,
            TrieId::Bsp(_) => Error::NotABsp,
        })?;
        ensure_all_included(&root, file_keys, forest_proof)?;

        self.apply_mutations(trie_id, mutations, forest_proof)
            .map_err(|_| Error::ForestProofVerificationFailed.into())
    }
}
