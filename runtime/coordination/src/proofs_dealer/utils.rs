use std::collections::{BTreeMap, BTreeSet};

use codec::Decode;
use log::{debug, warn};
use shp_traits::{CommitmentVerifier, HoldLedger, Precision, TrieMutation, TrieRemoveMutation};
use sp_trie::CompactProof;

use super::{Error, Event, LOG_TARGET};
use crate::{
    config::ProofsDealerConfig,
    error::{ensure, expect_or_err, DispatchError, DispatchResult},
    forest::{default_forest_root, verify_forest_proof, TrieId},
    proofs_dealer::types::*,
    types::{
        hash_concat, AccountId, Balance, FileKey, FileKeyVerifierFor, MerkleHash, ProviderId,
        RandomnessSeed, TickNumber,
    },
    Ledger, Runtime,
};

/// Derives `count` challenges for `provider_id` from `seed`.
///
/// The `i`-th challenge is `hash(seed ++ provider_id ++ i)`, with `i` as little endian `u32`.
pub fn generate_challenges_from_seed(
    seed: RandomnessSeed,
    provider_id: &ProviderId,
    count: u32,
) -> Vec<FileKey> {
    (0..count)
        .map(|index| {
            hash_concat(&[
                seed.as_bytes(),
                provider_id.as_bytes(),
                &index.to_le_bytes(),
            ])
        })
        .collect()
}

/// Challenges of the chunks of `file_key` that a key proof for the challenges tick with `seed`
/// has to answer.
pub fn generate_key_challenges(
    seed: RandomnessSeed,
    file_key: &FileKey,
    provider_id: &ProviderId,
    chunks_to_check: u32,
) -> Vec<FileKey> {
    let key_seed = hash_concat(&[seed.as_bytes(), file_key.as_bytes()]);
    generate_challenges_from_seed(key_seed, provider_id, chunks_to_check)
}

impl<L: Ledger> Runtime<L> {
    /// Add custom challenge to the challenges queue.
    ///
    /// Check if sender is a registered Provider. If it is not, charge a fee for the challenge.
    /// If the challenge is already queued, just return.
    ///
    /// Failures:
    /// - `FeeChargeFailed`: If the fee transfer to the treasury account fails.
    /// - `ChallengesQueueOverflow`: If the challenges queue is full.
    pub(crate) fn do_challenge(&mut self, who: &AccountId, key: &FileKey) -> DispatchResult {
        // Check if sender is a registered Provider.
        if self.get_provider_id_of(who).is_none() {
            // Charge a fee for the challenge if it is not.
            let treasury = self.config.treasury_account.clone();
            self.ledger
                .transfer(
                    who,
                    &treasury,
                    self.config.proofs_dealer.challenges_fee,
                    Precision::Exact,
                )
                .map_err(|_| Error::FeeChargeFailed)?;
        }

        let queue = &mut self.state.proofs_dealer.challenges_queue;

        // Check if challenge is already queued. If it is, just return.
        if queue.contains(key) {
            return Ok(());
        }

        ensure!(
            queue.len() < self.config.proofs_dealer.challenges_queue_length as usize,
            Error::ChallengesQueueOverflow
        );
        queue.push_back(*key);

        Ok(())
    }

    /// Add a challenge to the priority queue, dispatched before the challenges queue in the
    /// next checkpoint.
    pub(crate) fn enqueue_priority_challenge(
        &mut self,
        key: FileKey,
        should_remove_key: bool,
    ) -> DispatchResult {
        let challenge = CustomChallenge {
            key,
            should_remove_key,
        };
        let queue = &mut self.state.proofs_dealer.priority_challenges_queue;

        if queue.contains(&challenge) {
            return Ok(());
        }

        ensure!(
            queue.len() < self.config.proofs_dealer.priority_challenges_queue_length as usize,
            Error::PriorityChallengesQueueOverflow
        );
        queue.push_back(challenge);

        self.deposit_event(Event::NewPriorityChallenge {
            key_challenged: key,
            should_remove_key,
        });

        Ok(())
    }

    pub(crate) fn do_submit_proof(&mut self, provider_id: &ProviderId, proof: &Proof) -> DispatchResult {
        let root = self
            .get_forest_root(TrieId::Bsp(*provider_id))
            .ok_or(Error::NotProvider)?;

        // A provider with an empty forest has nothing to prove
        ensure!(root != default_forest_root(), Error::ZeroRoot);

        let record = self
            .get_proof_submission_record(provider_id)
            .ok_or(Error::NoRecordOfLastSubmittedProof)?;

        let ticker = self.state.proofs_dealer.challenges_ticker;
        let challenges_tick = record.next_tick_to_submit_proof_for;
        let config = &self.config.proofs_dealer;

        // The seed of the challenges tick has to exist already
        ensure!(challenges_tick < ticker, Error::ChallengesTickNotReached);

        // Seeds older than the challenge history are gone
        ensure!(
            challenges_tick >= ticker.saturating_sub(config.challenge_history_length),
            Error::ChallengesTickTooOld
        );

        ensure!(
            ticker <= challenges_tick.saturating_add(config.challenge_ticks_tolerance),
            Error::ChallengesTickTooLate
        );

        let seed = self
            .get_challenge_seed(challenges_tick)
            .ok_or(Error::SeedNotFound)?;

        // Random challenges, plus every checkpoint challenge since the last proof
        let mut challenges =
            generate_challenges_from_seed(seed, provider_id, config.random_challenges_per_tick);
        let checkpoint_challenges: Vec<CustomChallenge> = self
            .state
            .proofs_dealer
            .tick_to_checkpoint_challenges
            .range(record.last_tick_proven.saturating_add(1)..=challenges_tick)
            .flat_map(|(_, challenges)| challenges.iter().cloned())
            .collect();
        challenges.extend(checkpoint_challenges.iter().map(|challenge| challenge.key));

        let proven_keys = verify_forest_proof(&root, &challenges, &proof.forest_proof).map_err(|e| {
            warn!(target: LOG_TARGET, "Forest proof of provider {:?} rejected: {:?}", provider_id, e);
            Error::ForestProofVerificationFailed
        })?;

        self.verify_key_proofs(provider_id, seed, &proven_keys, proof)?;

        // Checkpoint challenges that ask to remove a key the provider still has
        let mutations: Vec<(FileKey, TrieMutation)> = checkpoint_challenges
            .iter()
            .filter(|challenge| challenge.should_remove_key && proven_keys.contains(&challenge.key))
            .map(|challenge| challenge.key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|key| (key, TrieRemoveMutation::default().into()))
            .collect();

        let mut new_root = root;
        if !mutations.is_empty() {
            new_root = self.apply_checkpoint_removals(provider_id, mutations, &proof.forest_proof)?;
        }

        let tick = self.current_tick();
        let price_index = self.state.payment_streams.accumulated_price_index;
        self.update_last_chargeable_info(*provider_id, tick, price_index)?;

        if new_root == default_forest_root() {
            // The provider does not store anything anymore
            self.stop_challenge_cycle(*provider_id);
        } else {
            let next_tick_to_submit_proof_for =
                challenges_tick.saturating_add(self.get_challenge_period(provider_id));
            self.set_proof_submission_record(
                *provider_id,
                ProofSubmissionRecord {
                    last_tick_proven: challenges_tick,
                    next_tick_to_submit_proof_for,
                },
            );
        }

        debug!(
            target: LOG_TARGET,
            "Proof of provider {:?} for challenges tick {} accepted",
            provider_id,
            challenges_tick
        );
        self.deposit_event(Event::ProofAccepted {
            provider_id: *provider_id,
            last_tick_proven: challenges_tick,
        });

        Ok(())
    }

    /// Every key the forest proof responds with needs a key proof answering the challenges of
    /// its chunks.
    fn verify_key_proofs(
        &self,
        provider_id: &ProviderId,
        seed: RandomnessSeed,
        proven_keys: &BTreeSet<FileKey>,
        proof: &Proof,
    ) -> DispatchResult {
        ensure!(
            proof.key_proofs.len() == proven_keys.len(),
            Error::IncorrectNumberOfKeyProofs
        );

        for file_key in proven_keys {
            let key_proof = proof
                .key_proofs
                .get(file_key)
                .ok_or(Error::KeyProofNotFound)?;
            let key_challenges = generate_key_challenges(
                seed,
                file_key,
                provider_id,
                key_proof.file_metadata.chunks_to_check(),
            );

            FileKeyVerifierFor::verify_proof(file_key, &key_challenges, key_proof).map_err(|e| {
                warn!(target: LOG_TARGET, "Key proof for {:?} rejected: {:?}", file_key, e);
                Error::KeyProofVerificationFailed
            })?;
        }

        Ok(())
    }

    fn apply_checkpoint_removals(
        &mut self,
        provider_id: &ProviderId,
        mutations: Vec<(FileKey, TrieMutation)>,
        forest_proof: &CompactProof,
    ) -> Result<MerkleHash, DispatchError> {
        let applied = self
            .apply_mutations(TrieId::Bsp(*provider_id), &mutations, forest_proof)
            .map_err(|_| Error::ForestProofVerificationFailed)?;

        for (file_key, metadata) in applied.removed_files() {
            self.decrease_capacity_used(provider_id, metadata.file_size)?;

            match AccountId::decode(&mut &metadata.owner[..]) {
                Ok(owner) => {
                    self.decrease_dynamic_amount_provided(provider_id, &owner, metadata.file_size)?
                }
                Err(_) => warn!(
                    target: LOG_TARGET,
                    "Owner of removed file {:?} is not an account", file_key
                ),
            }

            self.file_system_on_bsp_key_removed(provider_id, &file_key);
        }

        self.deposit_event(Event::MutationsAppliedForProvider {
            provider_id: *provider_id,
            mutations,
            old_root: applied.old_root,
            new_root: applied.new_root,
        });

        Ok(applied.new_root)
    }

    /// Number of challenges ticks between two proofs of a provider: the higher its stake, the
    /// shorter the period, within `[MinChallengePeriod, CheckpointChallengePeriod]`.
    pub fn get_challenge_period(&self, provider_id: &ProviderId) -> TickNumber {
        let stake = self.get_stake(provider_id).unwrap_or_default();
        stake_to_challenge_period(
            stake,
            self.config.proofs_dealer.stake_to_challenge_period,
            self.config.proofs_dealer.min_challenge_period,
            self.config.proofs_dealer.checkpoint_challenge_period,
        )
    }

    fn set_proof_submission_record(&mut self, provider_id: ProviderId, record: ProofSubmissionRecord) {
        let tolerance = self.config.proofs_dealer.challenge_ticks_tolerance;
        let dealer = &mut self.state.proofs_dealer;

        if let Some(old) = dealer
            .provider_to_proof_submission_record
            .insert(provider_id, record)
        {
            let old_deadline = old.next_tick_to_submit_proof_for.saturating_add(tolerance);
            remove_deadline(&mut dealer.challenge_deadlines, old_deadline, &provider_id);
        }

        let deadline = record.next_tick_to_submit_proof_for.saturating_add(tolerance);
        dealer
            .challenge_deadlines
            .entry(deadline)
            .or_default()
            .insert(provider_id);
    }

    /// Starts the challenge cycle of a BSP from the current challenges tick.
    pub(crate) fn initialise_challenge_cycle(&mut self, provider_id: ProviderId) -> DispatchResult {
        let ticker = self.state.proofs_dealer.challenges_ticker;
        let record = ProofSubmissionRecord {
            last_tick_proven: ticker,
            next_tick_to_submit_proof_for: ticker.saturating_add(self.get_challenge_period(&provider_id)),
        };
        self.set_proof_submission_record(provider_id, record);

        let next_challenge_deadline = expect_or_err!(
            self.get_next_deadline_tick(&provider_id),
            "Record was just inserted",
            Error::InconsistentState
        );
        self.deposit_event(Event::NewChallengeCycleInitialised {
            current_tick: ticker,
            next_challenge_deadline,
            provider: provider_id,
        });

        Ok(())
    }

    pub(crate) fn stop_challenge_cycle(&mut self, provider_id: ProviderId) {
        let tolerance = self.config.proofs_dealer.challenge_ticks_tolerance;
        let dealer = &mut self.state.proofs_dealer;
        if let Some(record) = dealer.provider_to_proof_submission_record.remove(&provider_id) {
            let deadline = record.next_tick_to_submit_proof_for.saturating_add(tolerance);
            remove_deadline(&mut dealer.challenge_deadlines, deadline, &provider_id);
        }
    }

    /// Re-indexes every deadline after a change of `ChallengeTicksTolerance`. Deadlines that
    /// would already be in the past are checked in the next challenges tick.
    pub(crate) fn rebuild_challenge_deadlines(&mut self) {
        let tolerance = self.config.proofs_dealer.challenge_ticks_tolerance;
        let dealer = &mut self.state.proofs_dealer;
        let earliest = dealer.challenges_ticker;

        let mut deadlines: BTreeMap<TickNumber, BTreeSet<ProviderId>> = BTreeMap::new();
        for (provider_id, record) in &dealer.provider_to_proof_submission_record {
            let deadline = record
                .next_tick_to_submit_proof_for
                .saturating_add(tolerance)
                .max(earliest);
            deadlines.entry(deadline).or_default().insert(*provider_id);
        }
        dealer.challenge_deadlines = deadlines;
    }

    /// Moves the challenges ticker forward, stores the tick's seed, dispatches checkpoint
    /// challenges and flags the providers that missed their deadline.
    pub(crate) fn proofs_dealer_on_poll(&mut self, seed: RandomnessSeed) {
        if self.state.proofs_dealer.challenges_ticker_paused {
            return;
        }

        let config = self.config.proofs_dealer.clone();
        let dealer = &mut self.state.proofs_dealer;
        dealer.challenges_ticker = dealer.challenges_ticker.saturating_add(1);
        let ticker = dealer.challenges_ticker;

        dealer.tick_to_challenges_seed.insert(ticker, seed);
        if let Some(oldest) = ticker.checked_sub(config.challenge_history_length) {
            dealer.tick_to_challenges_seed = dealer.tick_to_challenges_seed.split_off(&oldest);
        }
        self.deposit_event(Event::NewChallengeSeed {
            challenges_ticker: ticker,
            seed,
        });

        if ticker.saturating_sub(self.state.proofs_dealer.last_checkpoint_tick)
            >= config.checkpoint_challenge_period
        {
            self.new_checkpoint_challenge_round(ticker, &config);
        }

        // A deadline is missed once the ticker moves past it
        let missed = self
            .state
            .proofs_dealer
            .challenge_deadlines
            .remove(&ticker.saturating_sub(1))
            .unwrap_or_default();
        for provider_id in missed {
            self.mark_provider_slashable(provider_id, config.challenge_ticks_tolerance);
        }
    }

    fn new_checkpoint_challenge_round(&mut self, ticker: TickNumber, config: &ProofsDealerConfig) {
        let dealer = &mut self.state.proofs_dealer;
        let max = config.max_custom_challenges_per_tick as usize;

        let mut challenges = Vec::new();
        while challenges.len() < max {
            match dealer.priority_challenges_queue.pop_front() {
                Some(challenge) => challenges.push(challenge),
                None => break,
            }
        }
        while challenges.len() < max {
            match dealer.challenges_queue.pop_front() {
                Some(key) => challenges.push(CustomChallenge {
                    key,
                    should_remove_key: false,
                }),
                None => break,
            }
        }

        dealer.last_checkpoint_tick = ticker;
        if !challenges.is_empty() {
            dealer
                .tick_to_checkpoint_challenges
                .insert(ticker, challenges.clone());
        }

        // Checkpoints are needed as long as a proof for a tick after them can still arrive
        let retained = config
            .challenge_history_length
            .saturating_add(config.checkpoint_challenge_period);
        if let Some(oldest) = ticker.checked_sub(retained) {
            dealer.tick_to_checkpoint_challenges =
                dealer.tick_to_checkpoint_challenges.split_off(&oldest);
        }

        self.deposit_event(Event::NewCheckpointChallenge {
            challenges_ticker: ticker,
            challenges,
        });
    }

    fn mark_provider_slashable(&mut self, provider_id: ProviderId, tolerance: TickNumber) {
        let Some(record) = self.get_proof_submission_record(&provider_id) else {
            return;
        };

        let accrued = self
            .state
            .proofs_dealer
            .slashable_providers
            .entry(provider_id)
            .or_default();
        *accrued = accrued.saturating_add(1);

        // Only the next challenges tick moves on. `last_tick_proven` stays put, so checkpoint
        // challenges issued since the last proof are still due with the next one.
        let next_tick_to_submit_proof_for = record
            .next_tick_to_submit_proof_for
            .saturating_add(self.get_challenge_period(&provider_id));
        self.set_proof_submission_record(
            provider_id,
            ProofSubmissionRecord {
                last_tick_proven: record.last_tick_proven,
                next_tick_to_submit_proof_for,
            },
        );

        let next_challenge_deadline = next_tick_to_submit_proof_for.saturating_add(tolerance);
        warn!(
            target: LOG_TARGET,
            "Provider {:?} missed its deadline, next one is {}",
            provider_id,
            next_challenge_deadline
        );
        self.deposit_event(Event::SlashableProvider {
            provider: provider_id,
            next_challenge_deadline,
        });
    }
}

fn stake_to_challenge_period(
    stake: Balance,
    stake_to_challenge_period: Balance,
    min_challenge_period: TickNumber,
    checkpoint_challenge_period: TickNumber,
) -> TickNumber {
    if stake == 0 {
        return checkpoint_challenge_period;
    }
    let period = TickNumber::try_from(stake_to_challenge_period / stake).unwrap_or(TickNumber::MAX);
    period.clamp(min_challenge_period, checkpoint_challenge_period)
}

fn remove_deadline(
    deadlines: &mut BTreeMap<TickNumber, BTreeSet<ProviderId>>,
    deadline: TickNumber,
    provider_id: &ProviderId,
) {
    if let Some(providers) = deadlines.get_mut(&deadline) {
        providers.remove(provider_id);
        if providers.is_empty() {
            deadlines.remove(&deadline);
        }
    }
}
