use std::collections::BTreeSet;

use codec::Encode;
use log::{debug, warn};
use shp_file_metadata::{FileKey, FileMetadata};
use sp_core::{Hasher, H256};
use sp_trie::{recorder::Recorder, MemoryDB, Trie, TrieDBBuilder, TrieLayout, TrieMut};
use trie_db::TrieDBMutBuilder;

use crate::{
    error::{ErrorT, ForestStorageError},
    prove::{prove, to_leaf},
    traits::ForestStorage,
    types::ForestProof,
    LOG_TARGET,
};

/// A forest held entirely in memory.
///
/// Cloning it is how a provider keeps a snapshot of its forest at a given root.
#[derive(Clone)]
pub struct InMemoryForestStorage<T: TrieLayout + 'static>
where
    T::Hash: Hasher<Out = H256>,
{
    pub root: H256,
    pub memdb: MemoryDB<T::Hash>,
}

impl<T: TrieLayout> InMemoryForestStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    pub fn new() -> Self {
        let (memdb, root) = MemoryDB::<T::Hash>::default_with_root();
        Self { root, memdb }
    }

    pub fn is_empty(&self) -> bool {
        self.root == MemoryDB::<T::Hash>::default_with_root().1
    }
}

impl<T: TrieLayout> Default for InMemoryForestStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TrieLayout + 'static> ForestStorage<T> for InMemoryForestStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    fn root(&self) -> H256 {
        self.root
    }

    fn contains_file_key(&self, file_key: &FileKey) -> Result<bool, ErrorT<T>> {
        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root).build();
        Ok(trie.contains(file_key.as_ref())?)
    }

    fn get_file_metadata(&self, file_key: &FileKey) -> Result<Option<FileMetadata>, ErrorT<T>> {
        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root).build();
        let Some(raw_metadata) = trie.get(file_key.as_ref())? else {
            return Ok(None);
        };
        let leaf = to_leaf(file_key.as_ref(), &raw_metadata)?;
        Ok(Some(leaf.data))
    }

    fn get_all_files(&self) -> Result<Vec<(FileKey, FileMetadata)>, ErrorT<T>> {
        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root).build();
        let mut files = Vec::new();
        for item in trie.iter()? {
            let (key, value) = item?;
            let leaf = to_leaf(&key, &value)?;
            files.push((leaf.key, leaf.data));
        }
        Ok(files)
    }

    fn generate_proof(
        &self,
        challenged_keys: Vec<FileKey>,
    ) -> Result<ForestProof<FileKey, FileMetadata>, ErrorT<T>> {
        let recorder: Recorder<T::Hash> = Recorder::default();

        // A `TrieRecorder` is needed to create a proof of the "visited" leafs, by the end of this process.
        let mut trie_recorder = recorder.as_trie_recorder(self.root);

        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root)
            .with_recorder(&mut trie_recorder)
            .build();

        let proven = challenged_keys
            .iter()
            .map(|file_key| prove::<T>(&trie, file_key))
            .collect::<Result<Vec<_>, _>>()?;

        // Drop the `trie_recorder` to release the `recorder`
        drop(trie);
        drop(trie_recorder);

        let proof = recorder
            .drain_storage_proof()
            .to_compact_proof::<T::Hash>(self.root)
            .map_err(|_| ForestStorageError::FailedToGenerateCompactProof)?;

        debug!(
            target: LOG_TARGET,
            "Generated forest proof for {} challenges against root {:?}",
            challenged_keys.len(),
            self.root
        );

        Ok(ForestProof {
            proven,
            proof,
            root: self.root,
        })
    }

    fn insert_files_metadata(
        &mut self,
        files_metadata: &[FileMetadata],
    ) -> Result<Vec<FileKey>, ErrorT<T>> {
        let file_keys: Vec<FileKey> = files_metadata.iter().map(FileMetadata::file_key).collect();

        let mut seen = BTreeSet::new();
        for file_key in &file_keys {
            if !seen.insert(*file_key) || self.contains_file_key(file_key)? {
                warn!(target: LOG_TARGET, "File key {:?} already in the forest", file_key);
                return Err(ForestStorageError::FileKeyAlreadyExists(*file_key).into());
            }
        }

        let mut trie = TrieDBMutBuilder::<T>::from_existing(&mut self.memdb, &mut self.root).build();
        for (file_key, metadata) in file_keys.iter().zip(files_metadata) {
            trie.insert(file_key.as_ref(), &metadata.encode())?;
        }

        Ok(file_keys)
    }

    fn delete_file_key(&mut self, file_key: &FileKey) -> Result<(), ErrorT<T>> {
        let mut trie = TrieDBMutBuilder::<T>::from_existing(&mut self.memdb, &mut self.root).build();

        if trie.remove(file_key.as_ref())?.is_none() {
            return Err(ForestStorageError::FileKeyNotFound(*file_key).into());
        }

        Ok(())
    }
}
