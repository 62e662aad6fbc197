use shp_file_metadata::{FileKey, FileMetadata, Leaf};
use sp_core::{Hasher, H256};
use trie_db::{TrieIterator, TrieLayout};

use crate::{
    error::{ErrorT, ForestStorageError},
    types::Proven,
};

pub(crate) fn to_file_key(raw: &[u8]) -> Result<FileKey, ForestStorageError> {
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| ForestStorageError::FailedToParseKey)?;
    Ok(H256::from(raw))
}

pub(crate) fn to_leaf(key: &[u8], value: &[u8]) -> Result<Leaf<FileKey, FileMetadata>, ForestStorageError> {
    let file_key = to_file_key(key)?;
    let metadata = FileMetadata::from_leaf_value(value)
        .map_err(|_| ForestStorageError::FailedToDecodeValue(file_key))?;
    Ok(Leaf::new(file_key, metadata))
}

/// Finds the response of the forest to `challenged_file_key`.
///
/// Every node read while seeking is recorded by the trie's recorder, if any, which is what
/// makes the resulting compact proof verifiable:
/// 1. An exact match. The neighbours are read as well, so that the proof is enough to remove
///    the key from the partial trie.
/// 2. The leaves right before and after the challenged key.
/// 3. Only the leaf after the challenged key, when it is smaller than every key in the forest.
/// 4. Only the leaf before the challenged key, when it is larger than every key in the forest.
pub(crate) fn prove<T: TrieLayout>(
    trie: &trie_db::TrieDB<'_, '_, T>,
    challenged_file_key: &FileKey,
) -> Result<Proven<FileKey, FileMetadata>, ErrorT<T>>
where
    T::Hash: Hasher<Out = H256>,
{
    let mut iter = trie
        .into_double_ended_iter()
        .map_err(|_| ForestStorageError::FailedToCreateTrieIterator)?;

    iter.seek(challenged_file_key.as_ref())?;

    let next = iter.next().transpose()?;
    let prev = iter.next_back().transpose()?;

    let challenged = challenged_file_key.as_bytes();

    match (prev, next) {
        (_, Some((key, value))) if challenged == key.as_slice() => {
            iter.next().transpose()?;
            iter.next_back().transpose()?;
            let leaf = to_leaf(&key, &value)?;
            Ok(Proven::ExactKey(leaf))
        }
        (Some((prev_key, prev_value)), Some((next_key, next_value)))
            if prev_key.as_slice() < challenged && next_key.as_slice() > challenged =>
        {
            let prev_leaf = to_leaf(&prev_key, &prev_value)?;
            let next_leaf = to_leaf(&next_key, &next_value)?;
            Ok(Proven::new_neighbour_keys(Some(prev_leaf), Some(next_leaf))
                .map_err(|_| ForestStorageError::FailedToConstructProvenLeaves)?)
        }
        (None, Some((key, value))) if challenged < key.as_slice() => {
            let leaf = to_leaf(&key, &value)?;
            Ok(Proven::new_neighbour_keys(None, Some(leaf))
                .map_err(|_| ForestStorageError::FailedToConstructProvenLeaves)?)
        }
        (Some((key, value)), None) if challenged > key.as_slice() => {
            let leaf = to_leaf(&key, &value)?;
            Ok(Proven::new_neighbour_keys(Some(leaf), None)
                .map_err(|_| ForestStorageError::FailedToConstructProvenLeaves)?)
        }
        _ => Ok(Proven::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::build_forest;
    use sp_runtime::traits::BlakeTwo256;
    use sp_trie::LayoutV1;
    use trie_db::TrieDBBuilder;

    type Layout = LayoutV1<BlakeTwo256>;

    /// The smallest key strictly greater than `key`.
    fn successor(mut key: H256) -> H256 {
        for byte in key.0.iter_mut().rev() {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;
            if !overflow {
                break;
            }
        }
        key
    }

    #[test]
    fn prove_exact_key_match() {
        let (memdb, root, keys) = build_forest::<Layout>(16);
        let trie = TrieDBBuilder::<Layout>::new(&memdb, &root).build();

        let result = prove::<Layout>(&trie, &keys[2]).unwrap();

        assert!(matches!(result, Proven::ExactKey(leaf) if leaf.key == keys[2]));
    }

    #[test]
    fn prove_key_between_two_leaves() {
        let (memdb, root, mut keys) = build_forest::<Layout>(16);
        keys.sort();
        let trie = TrieDBBuilder::<Layout>::new(&memdb, &root).build();

        let challenge = successor(keys[4]);
        assert!(challenge > keys[4] && challenge < keys[5]);

        let result = prove::<Layout>(&trie, &challenge).unwrap();

        assert!(matches!(
            result,
            Proven::NeighbourKeys((Some(left), Some(right)))
                if left.key == keys[4] && right.key == keys[5]
        ));
    }

    #[test]
    fn prove_key_after_last_leaf() {
        let (memdb, root, keys) = build_forest::<Layout>(16);
        let trie = TrieDBBuilder::<Layout>::new(&memdb, &root).build();

        let largest = *keys.iter().max().unwrap();
        let challenge = H256::repeat_byte(0xff);
        assert!(challenge > largest);

        let result = prove::<Layout>(&trie, &challenge).unwrap();

        assert!(matches!(
            result,
            Proven::NeighbourKeys((Some(leaf), None)) if leaf.key == largest
        ));
    }

    #[test]
    fn prove_key_before_first_leaf() {
        let (memdb, root, keys) = build_forest::<Layout>(16);
        let trie = TrieDBBuilder::<Layout>::new(&memdb, &root).build();

        let smallest = *keys.iter().min().unwrap();
        let challenge = H256::zero();
        assert!(challenge < smallest);

        let result = prove::<Layout>(&trie, &challenge).unwrap();

        assert!(matches!(
            result,
            Proven::NeighbourKeys((None, Some(leaf))) if leaf.key == smallest
        ));
    }

    #[test]
    fn proven_leaves_carry_the_file_metadata() {
        let (memdb, root, keys) = build_forest::<Layout>(4);
        let trie = TrieDBBuilder::<Layout>::new(&memdb, &root).build();

        let Proven::ExactKey(leaf) = prove::<Layout>(&trie, &keys[0]).unwrap() else {
            panic!("expected an exact match");
        };

        assert_eq!(leaf.data.file_key(), keys[0]);
    }
}
