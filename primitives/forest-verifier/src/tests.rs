use shp_traits::{
    CommitmentVerifier, TrieAddMutation, TrieMutation, TrieProofDeltaApplier, TrieRemoveMutation,
};
use sp_core::{Hasher, H256};
use sp_runtime::traits::BlakeTwo256;
use sp_trie::{
    recorder::Recorder, CompactProof, LayoutV1, MemoryDB, Trie, TrieDBBuilder, TrieDBMutBuilder,
    TrieMut,
};
use trie_db::TrieIterator;

use crate::{empty_forest_root, ForestVerifier};

type Layout = LayoutV1<BlakeTwo256>;
type Verifier = ForestVerifier<Layout, { BlakeTwo256::LENGTH }>;

/// Builds a forest with `n` (at most 30) leaves.
///
/// Keys are hashes of their index with the first byte overwritten to `8 * i + 4`, so that the
/// sorted order is known and there is room for keys between, before and after them.
fn build_forest(n: u8) -> (MemoryDB<BlakeTwo256>, H256, Vec<H256>) {
    let mut memdb = MemoryDB::<BlakeTwo256>::default();
    let mut root = H256::default();
    let mut keys = Vec::new();
    {
        let mut trie = TrieDBMutBuilder::<Layout>::new(&mut memdb, &mut root).build();
        for i in 0..n {
            let mut key = BlakeTwo256::hash(&[i]);
            key.0[0] = 8 * i + 4;
            trie.insert(key.as_ref(), format!("leaf-{i}").as_bytes())
                .unwrap();
            keys.push(key);
        }
    }
    (memdb, root, keys)
}

/// Records the nodes a provider would touch when answering `challenges`.
fn prove(memdb: &MemoryDB<BlakeTwo256>, root: H256, challenges: &[H256]) -> CompactProof {
    let recorder: Recorder<BlakeTwo256> = Recorder::default();
    {
        let mut trie_recorder = recorder.as_trie_recorder(root);
        let trie = TrieDBBuilder::<Layout>::new(memdb, &root)
            .with_recorder(&mut trie_recorder)
            .build();
        let mut iter = trie.into_double_ended_iter().unwrap();
        for challenge in challenges {
            iter.seek(challenge.as_ref()).unwrap();
            let next = iter.next().transpose().unwrap();
            iter.next_back().transpose().unwrap();
            // Exact matches also record the neighbours, so that the key can be removed.
            if matches!(next, Some((ref key, _)) if key.as_slice() == challenge.as_ref()) {
                iter.next().transpose().unwrap();
                iter.next_back().transpose().unwrap();
            }
        }
    }
    recorder
        .drain_storage_proof()
        .to_compact_proof::<BlakeTwo256>(root)
        .unwrap()
}

/// A key strictly between two consecutive leaves of [`build_forest`].
fn key_between(a: &H256, b: &H256) -> H256 {
    let mut key = H256::zero();
    key.0[0] = a.0[0] + 1;
    assert!(*a < key && key < *b);
    key
}

mod verify_proof {
    use super::*;

    #[test]
    fn exact_key_is_proven() {
        let (memdb, root, keys) = build_forest(10);
        let challenge = keys[3];
        let proof = prove(&memdb, root, &[challenge]);

        let proven = Verifier::verify_proof(&root, &[challenge], &proof).unwrap();

        assert!(proven.contains(&challenge));
    }

    #[test]
    fn key_between_leaves_proves_both_neighbours() {
        let (memdb, root, keys) = build_forest(10);
        let challenge = key_between(&keys[4], &keys[5]);
        let proof = prove(&memdb, root, &[challenge]);

        let proven = Verifier::verify_proof(&root, &[challenge], &proof).unwrap();

        assert!(!proven.contains(&challenge));
        assert!(proven.contains(&keys[4]));
        assert!(proven.contains(&keys[5]));
    }

    #[test]
    fn key_before_first_leaf_proves_first_leaf() {
        let (memdb, root, keys) = build_forest(10);
        let challenge = H256::zero();
        assert!(challenge < keys[0]);
        let proof = prove(&memdb, root, &[challenge]);

        let proven = Verifier::verify_proof(&root, &[challenge], &proof).unwrap();

        assert_eq!(proven.into_iter().collect::<Vec<_>>(), vec![keys[0]]);
    }

    #[test]
    fn key_after_last_leaf_proves_last_leaf() {
        let (memdb, root, keys) = build_forest(10);
        let challenge = H256::repeat_byte(0xff);
        let proof = prove(&memdb, root, &[challenge]);

        let proven = Verifier::verify_proof(&root, &[challenge], &proof).unwrap();

        assert_eq!(proven.into_iter().collect::<Vec<_>>(), vec![keys[9]]);
    }

    #[test]
    fn multiple_challenges_in_one_proof() {
        let (memdb, root, keys) = build_forest(20);
        let challenges = vec![keys[0], key_between(&keys[7], &keys[8]), keys[19]];
        let proof = prove(&memdb, root, &challenges);

        let proven = Verifier::verify_proof(&root, &challenges, &proof).unwrap();

        assert!(proven.contains(&keys[0]));
        assert!(proven.contains(&keys[7]));
        assert!(proven.contains(&keys[8]));
        assert!(proven.contains(&keys[19]));
    }

    #[test]
    fn proof_for_another_root_fails() {
        let (memdb, root, keys) = build_forest(10);
        let (_, other_root, _) = build_forest(11);
        let proof = prove(&memdb, root, &[keys[1]]);

        assert!(Verifier::verify_proof(&other_root, &[keys[1]], &proof).is_err());
    }

    #[test]
    fn challenge_not_covered_by_proof_fails() {
        let (memdb, root, keys) = build_forest(30);
        let proof = prove(&memdb, root, &[keys[0]]);

        assert!(Verifier::verify_proof(&root, &[keys[29]], &proof).is_err());
    }

    #[test]
    fn no_challenges_fails() {
        let (memdb, root, keys) = build_forest(3);
        let proof = prove(&memdb, root, &[keys[0]]);

        assert!(Verifier::verify_proof(&root, &[], &proof).is_err());
    }

    #[test]
    fn empty_forest_proves_nothing() {
        let root = empty_forest_root::<Layout>();
        let proof = CompactProof {
            encoded_nodes: vec![],
        };

        let proven = Verifier::verify_proof(&root, &[H256::random()], &proof).unwrap();

        assert!(proven.is_empty());
    }
}

mod apply_delta {
    use super::*;

    fn full_trie_root(
        memdb: &MemoryDB<BlakeTwo256>,
        root: H256,
        mutations: &[(H256, TrieMutation)],
    ) -> H256 {
        let mut memdb = memdb.clone();
        let mut root = root;
        let mut trie = TrieDBMutBuilder::<Layout>::from_existing(&mut memdb, &mut root).build();
        for (key, mutation) in mutations {
            match mutation {
                TrieMutation::Add(add) => {
                    trie.insert(key.as_ref(), &add.value).unwrap();
                }
                TrieMutation::Remove(_) => {
                    trie.remove(key.as_ref()).unwrap();
                }
            }
        }
        *trie.root()
    }

    #[test]
    fn adding_a_key_matches_full_trie() {
        let (memdb, root, keys) = build_forest(10);
        let new_key = key_between(&keys[2], &keys[3]);
        let mutations = vec![(new_key, TrieAddMutation::new(b"new".to_vec()).into())];
        let proof = prove(&memdb, root, &[new_key]);

        let (partial_db, new_root, mutated) =
            Verifier::apply_delta(&root, &mutations, &proof).unwrap();

        assert_eq!(new_root, full_trie_root(&memdb, root, &mutations));
        assert_eq!(mutated, vec![(new_key, None)]);
        let trie = TrieDBBuilder::<Layout>::new(&partial_db, &new_root).build();
        assert_eq!(trie.get(new_key.as_ref()).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn removing_a_key_matches_full_trie_and_returns_value() {
        let (memdb, root, keys) = build_forest(10);
        let removed = keys[6];
        let mutations = vec![(removed, TrieRemoveMutation::default().into())];
        let proof = prove(&memdb, root, &[removed]);

        let (_, new_root, mutated) = Verifier::apply_delta(&root, &mutations, &proof).unwrap();

        assert_eq!(new_root, full_trie_root(&memdb, root, &mutations));
        assert_eq!(mutated.len(), 1);
        assert_eq!(mutated[0].0, removed);
        assert!(mutated[0].1.is_some());
    }

    #[test]
    fn add_and_remove_in_one_batch() {
        let (memdb, root, keys) = build_forest(16);
        let added = key_between(&keys[0], &keys[1]);
        let removed = keys[15];
        let mutations = vec![
            (added, TrieAddMutation::new(vec![1]).into()),
            (removed, TrieRemoveMutation::default().into()),
        ];
        let proof = prove(&memdb, root, &[added, removed]);

        let (_, new_root, _) = Verifier::apply_delta(&root, &mutations, &proof).unwrap();

        assert_eq!(new_root, full_trie_root(&memdb, root, &mutations));
    }

    #[test]
    fn removing_with_wrong_expected_value_fails() {
        let (memdb, root, keys) = build_forest(5);
        let mutations = vec![(
            keys[1],
            TrieRemoveMutation::with_value(b"not-the-value".to_vec()).into(),
        )];
        let proof = prove(&memdb, root, &[keys[1]]);

        assert!(Verifier::apply_delta(&root, &mutations, &proof).is_err());
    }

    #[test]
    fn adding_an_existing_key_fails() {
        let (memdb, root, keys) = build_forest(5);
        let mutations = vec![(keys[2], TrieAddMutation::new(vec![0]).into())];
        let proof = prove(&memdb, root, &[keys[2]]);

        assert!(Verifier::apply_delta(&root, &mutations, &proof).is_err());
    }

    #[test]
    fn stale_proof_is_rejected() {
        let (memdb, root, keys) = build_forest(8);
        let stale_proof = prove(&memdb, root, &[keys[0]]);
        let first = vec![(keys[0], TrieRemoveMutation::default().into())];
        let (_, new_root, _) = Verifier::apply_delta(&root, &first, &stale_proof).unwrap();

        // The proof was built for the previous root.
        let second = vec![(keys[1], TrieRemoveMutation::default().into())];
        assert!(Verifier::apply_delta(&new_root, &second, &stale_proof).is_err());
    }

    #[test]
    fn adding_to_an_empty_forest_needs_no_proof() {
        let root = empty_forest_root::<Layout>();
        let key = H256::repeat_byte(3);
        let mutations = vec![(key, TrieAddMutation::new(vec![9]).into())];
        let empty = CompactProof {
            encoded_nodes: vec![],
        };

        let (_, new_root, _) = Verifier::apply_delta(&root, &mutations, &empty).unwrap();

        let (memdb, _) = MemoryDB::<BlakeTwo256>::default_with_root();
        assert_eq!(new_root, full_trie_root(&memdb, root, &mutations));
        assert_ne!(new_root, root);
    }

    #[test]
    fn no_mutations_fails() {
        let (memdb, root, keys) = build_forest(2);
        let proof = prove(&memdb, root, &[keys[0]]);

        assert!(Verifier::apply_delta(&root, &[], &proof).is_err());
    }
}
