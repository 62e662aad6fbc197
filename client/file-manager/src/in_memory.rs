use std::collections::{BTreeSet, HashMap};

use log::{debug, error};
use shp_constants::FILE_CHUNK_SIZE;
use shp_file_key_verifier::FileKeyProof;
use shp_file_metadata::{Chunk, ChunkId, FileKey, FileMetadata};
use sp_core::{Hasher, H256};
use sp_trie::{
    recorder::Recorder, CompactProof, MemoryDB, Trie, TrieDBBuilder, TrieDBMutBuilder, TrieLayout,
    TrieMut,
};

use crate::{
    traits::{
        FileDataTrie, FileStorage, FileStorageError, FileStorageWriteError,
        FileStorageWriteOutcome,
    },
    LOG_TARGET,
};

#[derive(Clone)]
pub struct InMemoryFileDataTrie<T: TrieLayout + 'static>
where
    T::Hash: Hasher<Out = H256>,
{
    root: H256,
    memdb: MemoryDB<T::Hash>,
}

impl<T: TrieLayout + 'static> InMemoryFileDataTrie<T>
where
    T::Hash: Hasher<Out = H256>,
{
    pub fn new() -> Self {
        let (memdb, root) = MemoryDB::<T::Hash>::default_with_root();

        Self { root, memdb }
    }

    /// Splits `data` in chunks of [`FILE_CHUNK_SIZE`] bytes and merklises them.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FileStorageWriteError> {
        let mut file_trie = Self::new();
        for (index, chunk) in data.chunks(FILE_CHUNK_SIZE as usize).enumerate() {
            file_trie.write_chunk(&ChunkId::new(index as u64), &chunk.to_vec())?;
        }
        Ok(file_trie)
    }

    fn chunks_count(&self) -> usize {
        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root).build();
        trie.key_iter().map(|iter| iter.count()).unwrap_or_default()
    }
}

impl<T: TrieLayout + 'static> Default for InMemoryFileDataTrie<T>
where
    T::Hash: Hasher<Out = H256>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TrieLayout> FileDataTrie<T> for InMemoryFileDataTrie<T>
where
    T::Hash: Hasher<Out = H256>,
{
    fn get_root(&self) -> &H256 {
        &self.root
    }

    fn generate_proof(
        &self,
        chunk_ids: &BTreeSet<ChunkId>,
    ) -> Result<CompactProof, FileStorageError> {
        let recorder: Recorder<T::Hash> = Recorder::default();

        // A `TrieRecorder` is needed to create a proof of the "visited" leafs, by the end of this process.
        let mut trie_recorder = recorder.as_trie_recorder(self.root);

        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root)
            .with_recorder(&mut trie_recorder)
            .build();

        for chunk_id in chunk_ids {
            trie.get(&chunk_id.as_trie_key())
                .map_err(|_| FileStorageError::FailedToGetFileChunk)?
                .ok_or(FileStorageError::FileChunkDoesNotExist)?;
        }

        // Drop the `trie_recorder` to release the `recorder`
        drop(trie);
        drop(trie_recorder);

        recorder
            .drain_storage_proof()
            .to_compact_proof::<T::Hash>(self.root)
            .map_err(|_| FileStorageError::FailedToGenerateCompactProof)
    }

    fn get_chunk(&self, chunk_id: &ChunkId) -> Result<Chunk, FileStorageError> {
        let trie = TrieDBBuilder::<T>::new(&self.memdb, &self.root).build();

        trie.get(&chunk_id.as_trie_key())
            .map_err(|_| FileStorageError::FailedToGetFileChunk)?
            .ok_or(FileStorageError::FileChunkDoesNotExist)
    }

    fn write_chunk(
        &mut self,
        chunk_id: &ChunkId,
        data: &Chunk,
    ) -> Result<(), FileStorageWriteError> {
        let mut trie = TrieDBMutBuilder::<T>::from_existing(&mut self.memdb, &mut self.root).build();

        if trie
            .contains(&chunk_id.as_trie_key())
            .map_err(|_| FileStorageWriteError::FailedToGetFileChunk)?
        {
            return Err(FileStorageWriteError::FileChunkAlreadyExists);
        }

        trie.insert(&chunk_id.as_trie_key(), data)
            .map_err(|_| FileStorageWriteError::FailedToInsertFileChunk)?;

        // dropping the trie automatically commits changes to the underlying db
        drop(trie);

        Ok(())
    }
}

pub struct InMemoryFileStorage<T: TrieLayout + 'static>
where
    T::Hash: Hasher<Out = H256>,
{
    pub metadata: HashMap<FileKey, FileMetadata>,
    pub file_data: HashMap<FileKey, InMemoryFileDataTrie<T>>,
}

impl<T: TrieLayout> InMemoryFileStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    pub fn new() -> Self {
        Self {
            metadata: HashMap::new(),
            file_data: HashMap::new(),
        }
    }

    /// Stores a file whose content is already merklised.
    pub fn insert_file_with_data(
        &mut self,
        key: FileKey,
        metadata: FileMetadata,
        file_data: InMemoryFileDataTrie<T>,
    ) -> Result<(), FileStorageError> {
        if self.metadata.contains_key(&key) {
            return Err(FileStorageError::FileAlreadyExists);
        }
        self.metadata.insert(key, metadata);
        self.file_data.insert(key, file_data);
        Ok(())
    }
}

impl<T: TrieLayout> Default for InMemoryFileStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TrieLayout + 'static> FileStorage<T> for InMemoryFileStorage<T>
where
    T::Hash: Hasher<Out = H256>,
{
    type FileDataTrie = InMemoryFileDataTrie<T>;

    fn new_file_data_trie(&self) -> Self::FileDataTrie {
        InMemoryFileDataTrie::new()
    }

    fn insert_file(&mut self, key: FileKey, metadata: FileMetadata) -> Result<(), FileStorageError> {
        let empty_file_trie = self.new_file_data_trie();
        self.insert_file_with_data(key, metadata, empty_file_trie)
    }

    fn get_metadata(&self, key: &FileKey) -> Result<Option<FileMetadata>, FileStorageError> {
        Ok(self.metadata.get(key).cloned())
    }

    fn stored_chunks_count(&self, key: &FileKey) -> Result<u64, FileStorageError> {
        self.file_data
            .get(key)
            .map(|file_data| file_data.chunks_count() as u64)
            .ok_or(FileStorageError::FileDoesNotExist)
    }

    fn is_file_complete(&self, key: &FileKey) -> Result<bool, FileStorageError> {
        let metadata = self
            .metadata
            .get(key)
            .ok_or(FileStorageError::FileDoesNotExist)?;
        let file_data = self
            .file_data
            .get(key)
            .ok_or(FileStorageError::FileDoesNotExist)?;

        if metadata.fingerprint != *file_data.get_root() {
            return Ok(false);
        }

        Ok(metadata.chunks_count() == self.stored_chunks_count(key)?)
    }

    fn get_chunk(&self, key: &FileKey, chunk_id: &ChunkId) -> Result<Chunk, FileStorageError> {
        self.file_data
            .get(key)
            .ok_or(FileStorageError::FileDoesNotExist)?
            .get_chunk(chunk_id)
    }

    fn write_chunk(
        &mut self,
        key: &FileKey,
        chunk_id: &ChunkId,
        data: &Chunk,
    ) -> Result<FileStorageWriteOutcome, FileStorageWriteError> {
        let last_chunk_id = self
            .metadata
            .get(key)
            .ok_or(FileStorageWriteError::FileDoesNotExist)?
            .last_chunk_id();
        if *chunk_id > last_chunk_id {
            return Err(FileStorageWriteError::ChunkOutOfRange(*chunk_id));
        }

        let file_data = self
            .file_data
            .get_mut(key)
            .ok_or(FileStorageWriteError::FileDoesNotExist)?;

        match file_data.write_chunk(chunk_id, data) {
            Ok(()) => {
                debug!(target: LOG_TARGET, "Chunk {:?} written for file key {:?}", chunk_id, key);
            }
            Err(FileStorageWriteError::FileChunkAlreadyExists) => {
                debug!(target: LOG_TARGET, "Chunk {:?} already stored for file key {:?}", chunk_id, key);
            }
            Err(other) => {
                error!(target: LOG_TARGET, "{:?}", other);
                return Err(FileStorageWriteError::FailedToInsertFileChunk);
            }
        }

        match self.is_file_complete(key) {
            Ok(true) => Ok(FileStorageWriteOutcome::FileComplete),
            Ok(false) => Ok(FileStorageWriteOutcome::FileIncomplete),
            Err(_) => Err(FileStorageWriteError::FileDoesNotExist),
        }
    }

    fn generate_proof(
        &self,
        key: &FileKey,
        chunk_ids: &BTreeSet<ChunkId>,
    ) -> Result<FileKeyProof, FileStorageError> {
        let metadata = self
            .metadata
            .get(key)
            .ok_or(FileStorageError::FileDoesNotExist)?;
        let file_data = self
            .file_data
            .get(key)
            .ok_or(FileStorageError::FileDoesNotExist)?;

        if metadata.chunks_count() != self.stored_chunks_count(key)? {
            return Err(FileStorageError::IncompleteFile);
        }

        if metadata.fingerprint != *file_data.get_root() {
            return Err(FileStorageError::FingerprintAndStoredFileMismatch);
        }

        let proof = file_data.generate_proof(chunk_ids)?;
        Ok(FileKeyProof::new(metadata.clone(), proof))
    }

    fn delete_file(&mut self, key: &FileKey) -> Result<(), FileStorageError> {
        self.metadata.remove(key);
        self.file_data.remove(key);

        Ok(())
    }
}
