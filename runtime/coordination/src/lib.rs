//! # StorageHub coordination core
//!
//! A deterministic state machine that coordinates a decentralised storage network. It is driven
//! by discrete ticks (one per finalised block) and by calls from users, storage providers,
//! fishermen and governance:
//!
//! - [`providers`]: sign up, capacity, deposits, value propositions, buckets, slashing and
//!   insolvency of Main and Backup Storage Providers.
//! - [`forest`]: the Merkle Patricia forests of buckets and BSPs, mutated only through proofs
//!   against their current root.
//! - [`file_system`]: storage requests, BSP volunteering and confirmation, MSP acceptance,
//!   stop storing flows, bucket moves and file deletions.
//! - [`proofs_dealer`]: challenges and proofs of storage.
//! - [`payment_streams`]: fixed and dynamic rate billing of users by providers.
//!
//! Every call is atomic: it either succeeds or leaves state, balances and events untouched.
//! Balances live behind the [`HoldLedger`] seam, so the core never manages funds or keys by
//! itself.

use log::debug;
use shp_traits::HoldLedger;

pub mod balances;
pub mod config;
pub mod error;
pub mod events;
pub mod file_system;
pub mod forest;
pub mod payment_streams;
pub mod proofs_dealer;
pub mod providers;
pub mod types;

#[cfg(test)]
mod mock;

use config::{ConfigError, RuntimeConfig, RuntimeParameter};
use error::{DispatchError, DispatchResult};
use events::{Event, EventRecord};
use types::{AccountId, Balance, HoldReason, Origin, RandomnessSeed, TickNumber};

const LOG_TARGET: &str = "runtime::coordination";

/// The ledger the runtime holds and moves funds with.
pub trait Ledger: HoldLedger<AccountId, Balance = Balance, Reason = HoldReason> + Clone {}

impl<T: HoldLedger<AccountId, Balance = Balance, Reason = HoldReason> + Clone> Ledger for T {}

/// The whole state of the coordination core.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct State {
    pub tick: TickNumber,
    /// Randomness of the most recent ticks, used to derive provider ids.
    pub randomness: std::collections::BTreeMap<TickNumber, RandomnessSeed>,
    pub providers: providers::ProvidersState,
    pub file_system: file_system::FileSystemState,
    pub proofs_dealer: proofs_dealer::ProofsDealerState,
    pub payment_streams: payment_streams::PaymentStreamsState,
}

pub struct Runtime<L: Ledger> {
    state: State,
    ledger: L,
    /// Snapshot of the configuration for the current tick.
    config: RuntimeConfig,
    pending_parameters: Vec<RuntimeParameter>,
    events: Vec<EventRecord>,
}

pub fn ensure_signed(origin: Origin) -> Result<AccountId, DispatchError> {
    match origin {
        Origin::Signed(who) => Ok(who),
        Origin::Root => Err(DispatchError::BadOrigin),
    }
}

pub fn ensure_root(origin: Origin) -> DispatchResult {
    match origin {
        Origin::Root => Ok(()),
        Origin::Signed(_) => Err(DispatchError::BadOrigin),
    }
}

impl<L: Ledger> Runtime<L> {
    pub fn new(config: RuntimeConfig, ledger: L) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut runtime = Self {
            state: State::default(),
            ledger,
            config,
            pending_parameters: Vec::new(),
            events: Vec::new(),
        };
        runtime.state.payment_streams.current_price_per_giga_unit_per_tick =
            runtime.config.payment_streams.mostly_stable_price;

        Ok(runtime)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Direct access to the ledger, for embedders crediting accounts outside of any call.
    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn current_tick(&self) -> TickNumber {
        self.state.tick
    }

    pub fn randomness_at(&self, tick: TickNumber) -> Option<RandomnessSeed> {
        self.state.randomness.get(&tick).copied()
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// Drains the event log.
    pub fn take_events(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn deposit_event(&mut self, event: impl Into<Event>) {
        self.events.push(EventRecord {
            tick: self.state.tick,
            event: event.into(),
        });
    }

    /// Runs `f`, rolling back state, ledger and events if it fails.
    pub(crate) fn transactional<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let state = self.state.clone();
        let ledger = self.ledger.clone();
        let events_len = self.events.len();

        let result = f(self);

        if result.is_err() {
            self.state = state;
            self.ledger = ledger;
            self.events.truncate(events_len);
        }

        result
    }

    /// Queues a change of a tunable. It takes effect from the next tick on.
    pub fn set_parameter(&mut self, origin: Origin, parameter: RuntimeParameter) -> DispatchResult {
        ensure_root(origin)?;

        // Reject parameters that would leave the configuration invalid once applied.
        let mut config = self.config.clone();
        for queued in self.pending_parameters.iter().chain(Some(&parameter)) {
            config.apply(queued);
        }
        config.validate()?;

        self.pending_parameters.push(parameter);

        Ok(())
    }

    /// Starts a new tick with `seed` as its randomness and runs every tick hook.
    pub fn advance_tick(&mut self, seed: RandomnessSeed) {
        self.state.tick = self.state.tick.saturating_add(1);
        let tick = self.state.tick;

        let mut tolerance_changed = false;
        for parameter in std::mem::take(&mut self.pending_parameters) {
            debug!(target: LOG_TARGET, "Applying runtime parameter {:?} at tick {}", parameter, tick);
            tolerance_changed |= matches!(parameter, RuntimeParameter::ChallengeTicksTolerance(_));
            self.config.apply(&parameter);
        }
        if tolerance_changed {
            self.rebuild_challenge_deadlines();
        }

        self.state.randomness.insert(tick, seed);
        let retained = self
            .config
            .providers
            .max_ticks_for_randomness
            .max(self.config.proofs_dealer.challenge_history_length);
        if let Some(oldest) = tick.checked_sub(retained.saturating_add(1)) {
            self.state.randomness = self.state.randomness.split_off(&(oldest + 1));
        }

        self.proofs_dealer_on_poll(seed);
        self.payment_streams_on_poll();
        self.providers_on_idle();
        self.file_system_on_idle();
    }
}
