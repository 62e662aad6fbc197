//! # Proofs Dealer
//!
//! Challenges BSPs to prove they still store the files in their forest.
//!
//! The dealer keeps its own challenges ticker, which moves with the ticks unless governance
//! pauses it. Every tick a new seed is stored, and each provider derives its random challenges
//! from the seed of the tick it has to answer. Every `CheckpointChallengePeriod` ticks, the
//! queued custom challenges become checkpoint challenges, which every provider has to answer in
//! its next proof.
//!
//! A provider has to prove every `challenge_period` ticks, a period that gets shorter the
//! higher its stake. Missing the deadline (the tick to prove plus `ChallengeTicksTolerance`)
//! makes the provider slashable. Slashing itself is a separate call of the providers module.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_traits::TrieMutation;
use thiserror::Error;

use crate::{
    ensure_root, ensure_signed,
    error::DispatchResult,
    types::{AccountId, FileKey, MerkleHash, Origin, ProviderId, RandomnessSeed, TickNumber},
    Ledger, Runtime,
};

pub mod types;
mod utils;

#[cfg(test)]
mod tests;

pub use types::*;
pub use utils::{generate_challenges_from_seed, generate_key_challenges};

pub(crate) const LOG_TARGET: &str = "runtime::proofs_dealer";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProofsDealerState {
    pub challenges_ticker: TickNumber,
    pub challenges_ticker_paused: bool,
    pub tick_to_challenges_seed: BTreeMap<TickNumber, RandomnessSeed>,
    pub tick_to_checkpoint_challenges: BTreeMap<TickNumber, Vec<CustomChallenge>>,
    pub last_checkpoint_tick: TickNumber,
    pub challenges_queue: VecDeque<FileKey>,
    pub priority_challenges_queue: VecDeque<CustomChallenge>,
    pub provider_to_proof_submission_record: BTreeMap<ProviderId, ProofSubmissionRecord>,
    /// Providers whose deadline to submit a proof is a given challenges tick.
    pub challenge_deadlines: BTreeMap<TickNumber, BTreeSet<ProviderId>>,
    /// Providers that missed a deadline, with how many they missed.
    pub slashable_providers: BTreeMap<ProviderId, u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Event {
    /// A manual challenge was submitted.
    NewChallenge {
        who: AccountId,
        key_challenged: FileKey,
    },
    NewPriorityChallenge {
        key_challenged: FileKey,
        should_remove_key: bool,
    },
    /// A proof was accepted.
    ProofAccepted {
        provider_id: ProviderId,
        last_tick_proven: TickNumber,
    },
    NewChallengeSeed {
        challenges_ticker: TickNumber,
        seed: RandomnessSeed,
    },
    NewCheckpointChallenge {
        challenges_ticker: TickNumber,
        challenges: Vec<CustomChallenge>,
    },
    /// A provider missed its deadline and can now be slashed.
    SlashableProvider {
        provider: ProviderId,
        next_challenge_deadline: TickNumber,
    },
    NewChallengeCycleInitialised {
        current_tick: TickNumber,
        next_challenge_deadline: TickNumber,
        provider: ProviderId,
    },
    /// Checkpoint challenges with `should_remove_key` removed files from a provider's forest.
    MutationsAppliedForProvider {
        provider_id: ProviderId,
        mutations: Vec<(FileKey, TrieMutation)>,
        old_root: MerkleHash,
        new_root: MerkleHash,
    },
    ChallengesTickerSet {
        paused: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The ChallengesQueue is full. No more manual challenges can be made
    /// until some of the challenges in the queue are dispatched.
    #[error("challenges queue is full")]
    ChallengesQueueOverflow,
    /// The PriorityChallengesQueue is full. No more priority challenges can be made
    /// until some of the challenges in the queue are dispatched.
    #[error("priority challenges queue is full")]
    PriorityChallengesQueueOverflow,
    /// The proof submitter is not a registered Provider.
    #[error("not a challengeable provider")]
    NotProvider,
    /// The fee for submitting a challenge could not be charged.
    #[error("failed to charge the challenge fee")]
    FeeChargeFailed,
    #[error("provider's forest is empty")]
    ZeroRoot,
    #[error("provider has no challenge cycle")]
    NoRecordOfLastSubmittedProof,
    #[error("challenges tick to prove has not been reached")]
    ChallengesTickNotReached,
    #[error("challenges tick to prove is older than the challenge history")]
    ChallengesTickTooOld,
    #[error("deadline to prove the challenges tick has passed")]
    ChallengesTickTooLate,
    #[error("no seed for the challenges tick")]
    SeedNotFound,
    #[error("forest proof verification failed")]
    ForestProofVerificationFailed,
    #[error("number of key proofs does not match the keys proven by the forest proof")]
    IncorrectNumberOfKeyProofs,
    #[error("missing key proof for a proven key")]
    KeyProofNotFound,
    #[error("key proof verification failed")]
    KeyProofVerificationFailed,
    #[error("inconsistent proofs dealer state")]
    InconsistentState,
}

impl<L: Ledger> Runtime<L> {
    /// Introduce a new challenge.
    ///
    /// Anyone can add a challenge to the challenges queue, which is dispatched in the next
    /// checkpoint. Regular users are charged `ChallengesFee`, which goes to the treasury.
    /// Providers challenge for free.
    ///
    /// Emits `NewChallenge` event when successful.
    pub fn challenge(&mut self, origin: Origin, key: FileKey) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            rt.do_challenge(&who, &key)?;
            rt.deposit_event(Event::NewChallenge {
                who,
                key_challenged: key,
            });
            Ok(())
        })
    }

    /// Governance: add a challenge to the priority queue, which is dispatched before any other
    /// custom challenge.
    ///
    /// Emits `NewPriorityChallenge` event when successful.
    pub fn priority_challenge(
        &mut self,
        origin: Origin,
        key: FileKey,
        should_remove_key: bool,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| rt.enqueue_priority_challenge(key, should_remove_key))
    }

    /// For a provider to submit a proof.
    ///
    /// If `provider` is `None`, the submitter is considered to be the provider. The proof has to
    /// answer the random challenges of the provider's next challenges tick and every checkpoint
    /// challenge since its last proof.
    ///
    /// If valid:
    /// - Applies the removals of checkpoint challenges with `should_remove_key`.
    /// - Pushes the provider's next challenges tick forward by its challenge period.
    /// - Lets the provider charge its users up to now.
    ///
    /// Emits `ProofAccepted` event when successful.
    pub fn submit_proof(
        &mut self,
        origin: Origin,
        proof: Proof,
        provider: Option<ProviderId>,
    ) -> DispatchResult {
        let who = ensure_signed(origin)?;

        self.transactional(|rt| {
            // Getting provider from the origin if none is provided.
            let caller_provider = rt.get_bsp_id_of(&who).ok_or(Error::NotProvider)?;
            let provider_id = provider.unwrap_or(caller_provider);
            if provider_id != caller_provider {
                return Err(Error::NotProvider.into());
            }

            rt.do_submit_proof(&provider_id, &proof)
        })
    }

    /// Governance: pause or resume the challenges ticker, which freezes every challenge cycle.
    ///
    /// Emits `ChallengesTickerSet` event on every successful call, also when the ticker already
    /// was in the requested state.
    pub fn set_paused(&mut self, origin: Origin, paused: bool) -> DispatchResult {
        ensure_root(origin)?;

        self.state.proofs_dealer.challenges_ticker_paused = paused;
        self.deposit_event(Event::ChallengesTickerSet { paused });

        Ok(())
    }

    /// Governance: restart the challenge cycle of a BSP from the current challenges tick.
    ///
    /// Emits `NewChallengeCycleInitialised` event when successful.
    pub fn force_initialise_challenge_cycle(
        &mut self,
        origin: Origin,
        provider: ProviderId,
    ) -> DispatchResult {
        ensure_root(origin)?;

        self.transactional(|rt| {
            if !rt.is_bsp(&provider) {
                return Err(Error::NotProvider.into());
            }
            rt.stop_challenge_cycle(provider);
            rt.initialise_challenge_cycle(provider)
        })
    }

    pub fn get_challenges_ticker(&self) -> TickNumber {
        self.state.proofs_dealer.challenges_ticker
    }

    pub fn get_proof_submission_record(&self, provider_id: &ProviderId) -> Option<ProofSubmissionRecord> {
        self.state
            .proofs_dealer
            .provider_to_proof_submission_record
            .get(provider_id)
            .copied()
    }

    /// The challenges tick by which the provider has to have submitted its next proof.
    pub fn get_next_deadline_tick(&self, provider_id: &ProviderId) -> Option<TickNumber> {
        self.get_proof_submission_record(provider_id).map(|record| {
            record
                .next_tick_to_submit_proof_for
                .saturating_add(self.config.proofs_dealer.challenge_ticks_tolerance)
        })
    }

    pub fn get_checkpoint_challenges(&self, tick: TickNumber) -> Option<&[CustomChallenge]> {
        self.state
            .proofs_dealer
            .tick_to_checkpoint_challenges
            .get(&tick)
            .map(Vec::as_slice)
    }

    pub fn get_challenge_seed(&self, tick: TickNumber) -> Option<RandomnessSeed> {
        self.state
            .proofs_dealer
            .tick_to_challenges_seed
            .get(&tick)
            .copied()
    }
}
