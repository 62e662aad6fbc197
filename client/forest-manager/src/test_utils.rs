use codec::Encode;
use shp_file_metadata::{FileMetadata, Fingerprint};
use sp_core::{Hasher, H256};
use sp_trie::MemoryDB;
use trie_db::{TrieDBMutBuilder, TrieLayout, TrieMut};

pub fn file_metadata(index: u32) -> FileMetadata {
    FileMetadata::new(
        format!("owner-{}", index % 3).into_bytes(),
        H256::repeat_byte(1).as_bytes().to_vec(),
        format!("bucket/file-{index}").into_bytes(),
        1_024 * (index as u64 + 1),
        Fingerprint::repeat_byte(index as u8),
    )
    .unwrap()
}

/// Builds a forest with the metadata of `n` files, returning the leaf keys in insertion order.
pub fn build_forest<T: TrieLayout>(n: u32) -> (MemoryDB<T::Hash>, H256, Vec<H256>)
where
    T::Hash: Hasher<Out = H256>,
{
    let mut memdb = MemoryDB::<T::Hash>::default();
    let mut root = Default::default();
    let mut file_keys = Vec::new();
    {
        let mut forest = TrieDBMutBuilder::<T>::new(&mut memdb, &mut root).build();
        for index in 0..n {
            let metadata = file_metadata(index);
            let file_key = metadata.file_key();
            forest
                .insert(file_key.as_ref(), &metadata.encode())
                .unwrap();
            file_keys.push(file_key);
        }
    }
    (memdb, root, file_keys)
}
