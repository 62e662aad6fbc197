use shp_file_metadata::{FileKey, FileMetadata};
use sp_core::H256;
use trie_db::TrieLayout;

use crate::{error::ErrorT, types::ForestProof};

/// Forest storage interface to be implemented by the storage providers.
pub trait ForestStorage<T: TrieLayout>: 'static {
    /// Get the root hash of the forest.
    fn root(&self) -> H256;
    /// Check if the file key exists in the storage.
    fn contains_file_key(&self, file_key: &FileKey) -> Result<bool, ErrorT<T>>;
    /// Get the file metadata for a file key.
    fn get_file_metadata(&self, file_key: &FileKey) -> Result<Option<FileMetadata>, ErrorT<T>>;
    /// Get all files stored in this forest, ordered by file key.
    fn get_all_files(&self) -> Result<Vec<(FileKey, FileMetadata)>, ErrorT<T>>;
    /// Generate a proof of the response of the forest to each of the challenged keys.
    fn generate_proof(
        &self,
        challenged_keys: Vec<FileKey>,
    ) -> Result<ForestProof<FileKey, FileMetadata>, ErrorT<T>>;
    /// Insert files metadata and get back the file keys (hash of the metadata) that were inserted.
    ///
    /// Nothing is inserted if any of the files is already in the forest.
    fn insert_files_metadata(
        &mut self,
        files_metadata: &[FileMetadata],
    ) -> Result<Vec<FileKey>, ErrorT<T>>;
    /// Delete a file key.
    fn delete_file_key(&mut self, file_key: &FileKey) -> Result<(), ErrorT<T>>;
    /// Get all the files that belong to a particular owner.
    fn get_files_by_user(&self, owner: &[u8]) -> Result<Vec<(FileKey, FileMetadata)>, ErrorT<T>> {
        Ok(self
            .get_all_files()?
            .into_iter()
            .filter(|(_, metadata)| metadata.owner == owner)
            .collect())
    }
}
