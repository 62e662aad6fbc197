use std::collections::BTreeSet;

use shp_file_key_verifier::FileKeyProof;
use shp_file_metadata::{Chunk, ChunkId, FileKey, FileMetadata};
use sp_core::H256;
use sp_trie::CompactProof;
use trie_db::TrieLayout;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FileStorageWriteError {
    #[error("File does not exist")]
    FileDoesNotExist,
    #[error("File chunk already exists")]
    FileChunkAlreadyExists,
    #[error("Failed to insert file chunk")]
    FailedToInsertFileChunk,
    #[error("Failed to get file chunk")]
    FailedToGetFileChunk,
    #[error("Chunk {0:?} is out of the range of the file")]
    ChunkOutOfRange(ChunkId),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FileStorageError {
    #[error("File already exists")]
    FileAlreadyExists,
    #[error("File does not exist")]
    FileDoesNotExist,
    #[error("File chunk does not exist")]
    FileChunkDoesNotExist,
    #[error("Failed to get file chunk")]
    FailedToGetFileChunk,
    #[error("Failed to generate compact proof")]
    FailedToGenerateCompactProof,
    #[error("Not every chunk of the file is stored")]
    IncompleteFile,
    #[error("The stored chunks do not match the file fingerprint")]
    FingerprintAndStoredFileMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStorageWriteOutcome {
    FileComplete,
    FileIncomplete,
}

/// The merklised content of a single file, keyed by [`ChunkId::as_trie_key`].
pub trait FileDataTrie<T: TrieLayout> {
    /// The root of the file trie, which is the fingerprint once every chunk is written.
    fn get_root(&self) -> &H256;
    /// Proof of the chunks in `chunk_ids`, which must all be stored.
    fn generate_proof(&self, chunk_ids: &BTreeSet<ChunkId>) -> Result<CompactProof, FileStorageError>;
    fn get_chunk(&self, chunk_id: &ChunkId) -> Result<Chunk, FileStorageError>;
    fn write_chunk(&mut self, chunk_id: &ChunkId, data: &Chunk) -> Result<(), FileStorageWriteError>;
}

/// Storage of the files a provider has committed to.
pub trait FileStorage<T: TrieLayout>: 'static {
    type FileDataTrie: FileDataTrie<T>;

    fn new_file_data_trie(&self) -> Self::FileDataTrie;

    /// Start tracking a file with no chunks yet.
    fn insert_file(&mut self, key: FileKey, metadata: FileMetadata) -> Result<(), FileStorageError>;

    fn get_metadata(&self, key: &FileKey) -> Result<Option<FileMetadata>, FileStorageError>;

    fn stored_chunks_count(&self, key: &FileKey) -> Result<u64, FileStorageError>;

    /// Whether every chunk is stored and the content matches the fingerprint.
    fn is_file_complete(&self, key: &FileKey) -> Result<bool, FileStorageError>;

    fn get_chunk(&self, key: &FileKey, chunk_id: &ChunkId) -> Result<Chunk, FileStorageError>;

    fn write_chunk(
        &mut self,
        key: &FileKey,
        chunk_id: &ChunkId,
        data: &Chunk,
    ) -> Result<FileStorageWriteOutcome, FileStorageWriteError>;

    /// Proof of the given chunks of a complete file.
    fn generate_proof(
        &self,
        key: &FileKey,
        chunk_ids: &BTreeSet<ChunkId>,
    ) -> Result<FileKeyProof, FileStorageError>;

    /// Proof answering the given key challenges, each mapped to the chunk it points to.
    fn generate_proof_for_challenges(
        &self,
        key: &FileKey,
        challenges: &[H256],
    ) -> Result<FileKeyProof, FileStorageError> {
        let metadata = self
            .get_metadata(key)?
            .ok_or(FileStorageError::FileDoesNotExist)?;
        let chunks_count = metadata.chunks_count();
        let chunk_ids = challenges
            .iter()
            .map(|challenge| ChunkId::from_challenge(challenge.as_ref(), chunks_count))
            .collect();
        self.generate_proof(key, &chunk_ids)
    }

    fn delete_file(&mut self, key: &FileKey) -> Result<(), FileStorageError>;
}
