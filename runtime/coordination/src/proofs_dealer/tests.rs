use std::collections::BTreeMap;

use sp_trie::CompactProof;

use crate::{
    error::DispatchError,
    forest::{default_forest_root, TrieId},
    mock::*,
    proofs_dealer::{CustomChallenge, Error, Event, Proof, ProofSubmissionRecord},
    types::{FileKey, Origin, ProviderId, TickNumber},
};

const LOCATION: &[u8] = b"backups/archive.tar";
const FILE_SIZE: usize = 2_048;

/// Rolls ticks until the challenges ticker reaches `ticker`.
fn roll_to_ticker(rt: &mut Test, ticker: TickNumber) {
    while rt.get_challenges_ticker() < ticker {
        roll_one_tick(rt);
    }
}

/// Alice as an MSP with a bucket of Eve, and Bob as a BSP storing one file of it.
fn setup_bsp_with_file() -> (Test, ProviderNode, TestFile) {
    let mut rt = new_test_ext();
    let (msp_id, value_prop_id) = register_msp(&mut rt, &alice());
    let bucket_id = create_bucket(&mut rt, &eve(), msp_id, value_prop_id, b"backups");
    let bsp_id = register_bsp(&mut rt, &bob());

    let mut msp = ProviderNode::new(msp_id);
    let mut bsp = ProviderNode::new(bsp_id);
    let file = TestFile::new(&eve(), bucket_id, LOCATION, FILE_SIZE, 3);
    store_file(&mut rt, &file, &mut msp, vec![(&bob(), &mut bsp)]);

    (rt, bsp, file)
}

/// Waits for the next challenges tick of Bob's BSP to be reachable and proves it.
fn prove_next_tick(rt: &mut Test, node: &ProviderNode) -> ProofSubmissionRecord {
    let record = rt.get_proof_submission_record(&node.provider_id).unwrap();
    roll_to_ticker(rt, record.next_tick_to_submit_proof_for + 1);
    let proof = node.storage_proof(rt);
    assert_ok!(rt.submit_proof(Origin::signed(&bob()), proof, None));
    record
}

mod challenge {
    use super::*;

    #[test]
    fn users_pay_a_fee_to_challenge() {
        let mut rt = new_test_ext();
        let key = FileKey::repeat_byte(1);
        let ferdie_before = free_balance(&rt, &ferdie());
        let treasury_before = free_balance(&rt, &treasury());

        assert_ok!(rt.challenge(Origin::signed(&ferdie()), key));

        assert_last_event(
            &rt,
            Event::NewChallenge {
                who: ferdie(),
                key_challenged: key,
            },
        );
        assert_eq!(rt.state.proofs_dealer.challenges_queue, vec![key]);
        // ChallengesFee is 10
        assert_eq!(free_balance(&rt, &ferdie()), ferdie_before - 10);
        assert_eq!(free_balance(&rt, &treasury()), treasury_before + 10);

        // Challenging a queued key again does not queue it twice
        assert_ok!(rt.challenge(Origin::signed(&ferdie()), key));
        assert_eq!(rt.state.proofs_dealer.challenges_queue.len(), 1);
    }

    #[test]
    fn providers_challenge_for_free() {
        let mut rt = new_test_ext();
        register_msp(&mut rt, &alice());
        let alice_before = free_balance(&rt, &alice());

        assert_ok!(rt.challenge(Origin::signed(&alice()), FileKey::repeat_byte(1)));

        assert_eq!(free_balance(&rt, &alice()), alice_before);
    }

    #[test]
    fn challenge_failures() {
        let mut rt = new_test_ext();
        register_msp(&mut rt, &alice());

        assert_noop!(
            rt,
            rt.challenge(Origin::signed(&penniless()), FileKey::repeat_byte(1)),
            Error::FeeChargeFailed
        );
        assert_noop!(
            rt,
            rt.challenge(Origin::Root, FileKey::repeat_byte(1)),
            DispatchError::BadOrigin
        );

        // ChallengesQueueLength is 20
        for i in 0..20u8 {
            assert_ok!(rt.challenge(Origin::signed(&alice()), FileKey::repeat_byte(i)));
        }
        assert_noop!(
            rt,
            rt.challenge(Origin::signed(&alice()), FileKey::repeat_byte(20)),
            Error::ChallengesQueueOverflow
        );
    }

    #[test]
    fn priority_challenges_are_root_only() {
        let mut rt = new_test_ext();
        let key = FileKey::repeat_byte(7);

        assert_noop!(
            rt,
            rt.priority_challenge(Origin::signed(&alice()), key, true),
            DispatchError::BadOrigin
        );

        assert_ok!(rt.priority_challenge(Origin::Root, key, true));
        assert_last_event(
            &rt,
            Event::NewPriorityChallenge {
                key_challenged: key,
                should_remove_key: true,
            },
        );

        // PriorityChallengesQueueLength is 20
        for i in 0..19u8 {
            assert_ok!(rt.priority_challenge(Origin::Root, FileKey::repeat_byte(i), false));
        }
        assert_noop!(
            rt,
            rt.priority_challenge(Origin::Root, FileKey::repeat_byte(100), false),
            Error::PriorityChallengesQueueOverflow
        );
    }

    #[test]
    fn checkpoint_takes_priority_challenges_first() {
        let mut rt = new_test_ext();
        register_msp(&mut rt, &alice());

        for i in 0..4u8 {
            assert_ok!(rt.challenge(Origin::signed(&alice()), FileKey::repeat_byte(i)));
        }
        for i in 10..13u8 {
            assert_ok!(rt.priority_challenge(Origin::Root, FileKey::repeat_byte(i), true));
        }

        // CheckpointChallengePeriod is 20
        roll_to_ticker(&mut rt, 20);

        // MaxCustomChallengesPerTick is 5
        let expected = vec![
            CustomChallenge {
                key: FileKey::repeat_byte(10),
                should_remove_key: true,
            },
            CustomChallenge {
                key: FileKey::repeat_byte(11),
                should_remove_key: true,
            },
            CustomChallenge {
                key: FileKey::repeat_byte(12),
                should_remove_key: true,
            },
            CustomChallenge {
                key: FileKey::repeat_byte(0),
                should_remove_key: false,
            },
            CustomChallenge {
                key: FileKey::repeat_byte(1),
                should_remove_key: false,
            },
        ];
        assert_eq!(rt.get_checkpoint_challenges(20), Some(&expected[..]));
        assert_has_event(
            &rt,
            Event::NewCheckpointChallenge {
                challenges_ticker: 20,
                challenges: expected,
            },
        );
        assert!(rt.state.proofs_dealer.priority_challenges_queue.is_empty());
        assert_eq!(
            rt.state.proofs_dealer.challenges_queue,
            vec![FileKey::repeat_byte(2), FileKey::repeat_byte(3)]
        );

        // Empty checkpoints are announced but not stored
        roll_to_ticker(&mut rt, 60);
        assert_has_event(
            &rt,
            Event::NewCheckpointChallenge {
                challenges_ticker: 40,
                challenges: vec![
                    CustomChallenge {
                        key: FileKey::repeat_byte(2),
                        should_remove_key: false,
                    },
                    CustomChallenge {
                        key: FileKey::repeat_byte(3),
                        should_remove_key: false,
                    },
                ],
            },
        );
        assert_has_event(
            &rt,
            Event::NewCheckpointChallenge {
                challenges_ticker: 60,
                challenges: Vec::new(),
            },
        );
        assert!(rt.get_checkpoint_challenges(60).is_none());
    }
}

mod challenge_cycle {
    use super::*;

    #[test]
    fn first_file_starts_the_cycle() {
        let (rt, bsp, _) = setup_bsp_with_file();
        let ticker = rt.get_challenges_ticker();

        // The BSP's stake puts it on MinChallengePeriod, with ChallengeTicksTolerance of 5
        assert_eq!(rt.get_challenge_period(&bsp.provider_id), 4);
        assert_eq!(
            rt.get_proof_submission_record(&bsp.provider_id),
            Some(ProofSubmissionRecord {
                last_tick_proven: ticker,
                next_tick_to_submit_proof_for: ticker + 4,
            })
        );
        assert_eq!(rt.get_next_deadline_tick(&bsp.provider_id), Some(ticker + 9));
        assert_has_event(
            &rt,
            Event::NewChallengeCycleInitialised {
                current_tick: ticker,
                next_challenge_deadline: ticker + 9,
                provider: bsp.provider_id,
            },
        );
    }

    #[test]
    fn missing_the_deadline_makes_the_provider_slashable() {
        let (mut rt, bsp, _) = setup_bsp_with_file();
        let deadline = rt.get_next_deadline_tick(&bsp.provider_id).unwrap();
        let record = rt.get_proof_submission_record(&bsp.provider_id).unwrap();

        // A proof is still accepted in the deadline tick itself
        roll_to_ticker(&mut rt, deadline);
        assert!(!rt.state.proofs_dealer.slashable_providers.contains_key(&bsp.provider_id));

        roll_to_ticker(&mut rt, deadline + 1);
        assert_eq!(rt.state.proofs_dealer.slashable_providers.get(&bsp.provider_id), Some(&1));

        // The cycle goes on, but nothing was proven
        let next = record.next_tick_to_submit_proof_for + 4;
        assert_eq!(
            rt.get_proof_submission_record(&bsp.provider_id),
            Some(ProofSubmissionRecord {
                last_tick_proven: record.last_tick_proven,
                next_tick_to_submit_proof_for: next,
            })
        );
        assert_has_event(
            &rt,
            Event::SlashableProvider {
                provider: bsp.provider_id,
                next_challenge_deadline: next + 5,
            },
        );

        roll_to_ticker(&mut rt, next + 6);
        assert_eq!(rt.state.proofs_dealer.slashable_providers.get(&bsp.provider_id), Some(&2));
    }

    #[test]
    fn checkpoints_of_a_missed_window_are_still_demanded() {
        let (mut rt, mut bsp, file) = setup_bsp_with_file();
        let record = rt.get_proof_submission_record(&bsp.provider_id).unwrap();
        let missed = record.next_tick_to_submit_proof_for;

        // A removal for Bob's file is checkpointed in the window Bob is about to miss
        rt.state.proofs_dealer.tick_to_checkpoint_challenges.insert(
            missed,
            vec![CustomChallenge {
                key: file.file_key,
                should_remove_key: true,
            }],
        );
        roll_to_ticker(&mut rt, missed + 5 + 1);
        assert_eq!(rt.state.proofs_dealer.slashable_providers.get(&bsp.provider_id), Some(&1));

        let root_with_file = bsp.root();
        let proved = prove_next_tick(&mut rt, &bsp);
        assert_eq!(proved.last_tick_proven, record.last_tick_proven);
        assert_eq!(proved.next_tick_to_submit_proof_for, missed + 4);
        bsp.remove_from_forest(&file.file_key);

        assert_has_event(
            &rt,
            Event::MutationsAppliedForProvider {
                provider_id: bsp.provider_id,
                mutations: vec![(file.file_key, shp_traits::TrieRemoveMutation::default().into())],
                old_root: root_with_file,
                new_root: default_forest_root(),
            },
        );
        assert_eq!(rt.get_forest_root(TrieId::Bsp(bsp.provider_id)), Some(default_forest_root()));
        assert!(rt.get_proof_submission_record(&bsp.provider_id).is_none());
    }

    #[test]
    fn force_initialise_challenge_cycle() {
        let mut rt = new_test_ext();
        let bsp_id = register_bsp(&mut rt, &bob());
        let (msp_id, _) = register_msp(&mut rt, &alice());
        let ticker = rt.get_challenges_ticker();

        assert_noop!(
            rt,
            rt.force_initialise_challenge_cycle(Origin::signed(&bob()), bsp_id),
            DispatchError::BadOrigin
        );
        assert_noop!(
            rt,
            rt.force_initialise_challenge_cycle(Origin::Root, msp_id),
            Error::NotProvider
        );

        assert_ok!(rt.force_initialise_challenge_cycle(Origin::Root, bsp_id));

        assert_last_event(
            &rt,
            Event::NewChallengeCycleInitialised {
                current_tick: ticker,
                next_challenge_deadline: ticker + 9,
                provider: bsp_id,
            },
        );
        assert_eq!(rt.state.proofs_dealer.challenge_deadlines[&(ticker + 9)].len(), 1);

        // Initialising again replaces the previous deadline
        roll_one_tick(&mut rt);
        assert_ok!(rt.force_initialise_challenge_cycle(Origin::Root, bsp_id));
        assert!(!rt.state.proofs_dealer.challenge_deadlines.contains_key(&(ticker + 9)));
        assert!(rt.state.proofs_dealer.challenge_deadlines[&(ticker + 10)].contains(&bsp_id));
    }

    #[test]
    fn tolerance_change_moves_pending_deadlines() {
        let (mut rt, bsp, _) = setup_bsp_with_file();
        let record = rt.get_proof_submission_record(&bsp.provider_id).unwrap();
        let old_deadline = record.next_tick_to_submit_proof_for + 5;

        assert_ok!(rt.set_parameter(
            Origin::Root,
            crate::config::RuntimeParameter::ChallengeTicksTolerance(8)
        ));
        roll_one_tick(&mut rt);

        let new_deadline = record.next_tick_to_submit_proof_for + 8;
        assert_eq!(rt.get_next_deadline_tick(&bsp.provider_id), Some(new_deadline));
        assert!(!rt.state.proofs_dealer.challenge_deadlines.contains_key(&old_deadline));
        assert!(rt.state.proofs_dealer.challenge_deadlines[&new_deadline].contains(&bsp.provider_id));

        // The old deadline passes without consequences
        roll_to_ticker(&mut rt, new_deadline);
        assert!(rt.state.proofs_dealer.slashable_providers.is_empty());
        roll_to_ticker(&mut rt, new_deadline + 1);
        assert_eq!(rt.state.proofs_dealer.slashable_providers.get(&bsp.provider_id), Some(&1));
    }

    #[test]
    fn paused_ticker_freezes_challenges() {
        let (mut rt, bsp, _) = setup_bsp_with_file();
        let ticker = rt.get_challenges_ticker();
        let deadline = rt.get_next_deadline_tick(&bsp.provider_id).unwrap();

        assert_noop!(
            rt,
            rt.set_paused(Origin::signed(&alice()), true),
            DispatchError::BadOrigin
        );
        assert_ok!(rt.set_paused(Origin::Root, true));
        assert_last_event(&rt, Event::ChallengesTickerSet { paused: true });

        // Pausing again is announced again
        let events_before = events(&rt).len();
        assert_ok!(rt.set_paused(Origin::Root, true));
        assert_eq!(events(&rt).len(), events_before + 1);
        assert_last_event(&rt, Event::ChallengesTickerSet { paused: true });
        assert!(rt.state.proofs_dealer.challenges_ticker_paused);

        // Ticks go by without seeds or deadlines
        let tick = rt.current_tick();
        roll_to(&mut rt, tick + 30);
        assert_eq!(rt.get_challenges_ticker(), ticker);
        assert!(rt.get_challenge_seed(ticker + 1).is_none());
        assert!(rt.state.proofs_dealer.slashable_providers.is_empty());

        assert_ok!(rt.set_paused(Origin::Root, false));
        roll_one_tick(&mut rt);
        assert_eq!(rt.get_challenges_ticker(), ticker + 1);
        assert_eq!(rt.get_next_deadline_tick(&bsp.provider_id), Some(deadline));
    }
}

mod submit_proof {
    use super::*;

    #[test]
    fn submit_proof_moves_the_cycle_forward() {
        let (mut rt, bsp, _) = setup_bsp_with_file();

        let record = prove_next_tick(&mut rt, &bsp);

        let proven = record.next_tick_to_submit_proof_for;
        assert_last_event(
            &rt,
            Event::ProofAccepted {
                provider_id: bsp.provider_id,
                last_tick_proven: proven,
            },
        );
        assert_eq!(
            rt.get_proof_submission_record(&bsp.provider_id),
            Some(ProofSubmissionRecord {
                last_tick_proven: proven,
                next_tick_to_submit_proof_for: proven + 4,
            })
        );
        assert!(rt.state.proofs_dealer.slashable_providers.is_empty());

        // The BSP can now charge its users up to this tick
        let chargeable = rt.state.payment_streams.last_chargeable_info[&bsp.provider_id];
        assert_eq!(chargeable.last_chargeable_tick, rt.current_tick());
        assert_eq!(
            chargeable.price_index,
            rt.state.payment_streams.accumulated_price_index
        );

        // Proving keeps the deadline away for good
        for _ in 0..5 {
            prove_next_tick(&mut rt, &bsp);
        }
        assert!(rt.state.proofs_dealer.slashable_providers.is_empty());
    }

    #[test]
    fn submit_proof_checks_the_submitter() {
        let (mut rt, bsp, _) = setup_bsp_with_file();
        let record = rt.get_proof_submission_record(&bsp.provider_id).unwrap();
        roll_to_ticker(&mut rt, record.next_tick_to_submit_proof_for + 1);
        let proof = bsp.storage_proof(&rt);

        assert_noop!(
            rt,
            rt.submit_proof(Origin::Root, proof.clone(), None),
            DispatchError::BadOrigin
        );
        // MSPs are not challenged
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&alice()), proof.clone(), None),
            Error::NotProvider
        );
        // A BSP can't submit for another provider
        assert_noop!(
            rt,
            rt.submit_proof(
                Origin::signed(&bob()),
                proof.clone(),
                Some(ProviderId::repeat_byte(9))
            ),
            Error::NotProvider
        );

        assert_ok!(rt.submit_proof(Origin::signed(&bob()), proof, Some(bsp.provider_id)));
    }

    #[test]
    fn submit_proof_checks_the_challenges_tick() {
        let (mut rt, bsp, _) = setup_bsp_with_file();
        let empty_proof = Proof {
            forest_proof: CompactProof {
                encoded_nodes: Vec::new(),
            },
            key_proofs: BTreeMap::new(),
        };

        // The challenges tick to prove is still in the future
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), empty_proof.clone(), None),
            Error::ChallengesTickNotReached
        );

        roll_to_ticker(&mut rt, 50);
        let ticker = rt.get_challenges_ticker();
        let set_record = |rt: &mut Test, next: TickNumber| {
            rt.state.proofs_dealer.provider_to_proof_submission_record.insert(
                bsp.provider_id,
                ProofSubmissionRecord {
                    last_tick_proven: next - 4,
                    next_tick_to_submit_proof_for: next,
                },
            );
        };

        // ChallengeHistoryLength is 40
        set_record(&mut rt, ticker - 41);
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), empty_proof.clone(), None),
            Error::ChallengesTickTooOld
        );

        set_record(&mut rt, ticker - 6);
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), empty_proof.clone(), None),
            Error::ChallengesTickTooLate
        );

        set_record(&mut rt, ticker - 2);
        rt.state.proofs_dealer.tick_to_challenges_seed.remove(&(ticker - 2));
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), empty_proof.clone(), None),
            Error::SeedNotFound
        );

        rt.state
            .proofs_dealer
            .provider_to_proof_submission_record
            .remove(&bsp.provider_id);
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), empty_proof, None),
            Error::NoRecordOfLastSubmittedProof
        );
    }

    #[test]
    fn bsp_without_files_has_nothing_to_prove() {
        let mut rt = new_test_ext();
        let bsp_id = register_bsp(&mut rt, &bob());
        assert_eq!(rt.get_forest_root(TrieId::Bsp(bsp_id)), Some(default_forest_root()));

        let proof = Proof {
            forest_proof: CompactProof {
                encoded_nodes: Vec::new(),
            },
            key_proofs: BTreeMap::new(),
        };
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), proof, None),
            Error::ZeroRoot
        );
    }

    #[test]
    fn submit_proof_checks_forest_and_key_proofs() {
        let (mut rt, mut bsp, file) = setup_bsp_with_file();
        let record = rt.get_proof_submission_record(&bsp.provider_id).unwrap();
        roll_to_ticker(&mut rt, record.next_tick_to_submit_proof_for + 1);
        let proof = bsp.storage_proof(&rt);
        assert!(proof.key_proofs.contains_key(&file.file_key));

        let without_forest_proof = Proof {
            forest_proof: CompactProof {
                encoded_nodes: Vec::new(),
            },
            ..proof.clone()
        };
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), without_forest_proof, None),
            Error::ForestProofVerificationFailed
        );

        let without_key_proofs = Proof {
            key_proofs: BTreeMap::new(),
            ..proof.clone()
        };
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), without_key_proofs, None),
            Error::IncorrectNumberOfKeyProofs
        );

        let mut misplaced = proof.clone();
        let key_proof = misplaced.key_proofs.remove(&file.file_key).unwrap();
        misplaced.key_proofs.insert(FileKey::repeat_byte(1), key_proof);
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), misplaced, None),
            Error::KeyProofNotFound
        );

        // A key proof of another file does not prove this one
        let other = TestFile::new(&eve(), file.bucket_id, b"other", FILE_SIZE, 4);
        let mut forged = proof.clone();
        forged
            .key_proofs
            .insert(file.file_key, bsp.commitment_proof(&other).proof);
        assert_noop!(
            rt,
            rt.submit_proof(Origin::signed(&bob()), forged, None),
            Error::KeyProofVerificationFailed
        );

        assert_ok!(rt.submit_proof(Origin::signed(&bob()), proof, None));
    }

    #[test]
    fn checkpoint_challenge_removes_file_of_incomplete_request() {
        let mut rt = new_test_ext();
        let (msp_id, value_prop_id) = register_msp(&mut rt, &alice());
        let bucket_id = create_bucket(&mut rt, &eve(), msp_id, value_prop_id, b"backups");
        let bsp_id = register_bsp(&mut rt, &bob());
        let mut bsp = ProviderNode::new(bsp_id);
        let file = TestFile::new(&eve(), bucket_id, LOCATION, FILE_SIZE, 3);

        // The request needs two BSPs, only Bob stores the file before Eve revokes it
        issue_storage_request(&mut rt, &file, msp_id, 2);
        volunteer_and_confirm(&mut rt, &bob(), &mut bsp, &file);
        assert_ok!(rt.revoke_storage_request(Origin::signed(&eve()), file.file_key));
        assert!(rt
            .state
            .proofs_dealer
            .priority_challenges_queue
            .contains(&CustomChallenge {
                key: file.file_key,
                should_remove_key: true,
            }));
        let root_with_file = bsp.root();

        // Bob keeps proving until a proof answers the checkpoint with the removal
        let mut proofs = 0;
        while rt.get_proof_submission_record(&bsp_id).is_some() {
            prove_next_tick(&mut rt, &bsp);
            proofs += 1;
            assert!(proofs <= 10, "checkpoint challenge never reached the BSP");
        }
        bsp.remove_from_forest(&file.file_key);

        let checkpoint_tick = rt.state.proofs_dealer.last_checkpoint_tick;
        assert!(rt
            .get_checkpoint_challenges(checkpoint_tick)
            .is_some_and(|challenges| challenges.iter().any(|c| c.key == file.file_key)));
        assert_has_event(
            &rt,
            Event::MutationsAppliedForProvider {
                provider_id: bsp_id,
                mutations: vec![(file.file_key, shp_traits::TrieRemoveMutation::default().into())],
                old_root: root_with_file,
                new_root: default_forest_root(),
            },
        );
        assert_eq!(rt.get_forest_root(TrieId::Bsp(bsp_id)), Some(default_forest_root()));
        assert_eq!(bsp.root(), default_forest_root());

        // Nothing is left to store, prove or charge for
        assert_eq!(rt.available_capacity(&bsp_id), BSP_CAPACITY);
        assert!(rt.get_incomplete_storage_request(&file.file_key).is_none());
        assert_has_event(
            &rt,
            crate::file_system::Event::IncompleteStorageRequestCleanedUp {
                file_key: file.file_key,
            },
        );
        assert!(!rt
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .contains_key(&(bsp_id, eve())));
    }
}
