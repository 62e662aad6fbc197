#![cfg_attr(not(feature = "std"), no_std)]

use codec::{Decode, Encode, HasCompact};
use scale_info::{prelude::fmt::Debug, TypeInfo};
use sp_runtime::{
    traits::{AtLeast32BitUnsigned, Saturating},
    DispatchError,
};
use sp_std::{collections::btree_set::BTreeSet, vec::Vec};

#[cfg(feature = "std")]
pub trait MaybeDebug: Debug {}
#[cfg(feature = "std")]
impl<T: Debug> MaybeDebug for T {}
#[cfg(not(feature = "std"))]
pub trait MaybeDebug {}
#[cfg(not(feature = "std"))]
impl<T> MaybeDebug for T {}

/// Wrapper to SCALE-encode an integer in its compact form, used for trie keys.
#[derive(Encode)]
pub struct AsCompact<T: HasCompact>(#[codec(compact)] pub T);

/// The numerical bounds every balance or storage unit handled by the runtime satisfies.
pub trait NumericalParam: AtLeast32BitUnsigned + Saturating + Copy + Debug + Default {}
impl<T: AtLeast32BitUnsigned + Saturating + Copy + Debug + Default> NumericalParam for T {}

/// A trait to verify proofs based on commitments and challenges.
///
/// It is abstracted over the `Proof`, `Commitment` and `Challenge` types.
pub trait CommitmentVerifier {
    /// The type that represents the proof.
    type Proof: Clone + PartialEq + Debug;
    /// The type that represents the commitment (e.g. a Merkle root)
    type Commitment: MaybeDebug + Ord + Default + Copy + AsRef<[u8]> + AsMut<[u8]>;
    /// The type that represents the challenges which a proof is being verified against.
    type Challenge: MaybeDebug + Ord + Default + Copy + AsRef<[u8]> + AsMut<[u8]>;

    /// Verify a proof based on a commitment and a set of challenges.
    ///
    /// Returns the set of keys the proof responds with. For a forest this is either the
    /// challenged key itself (when it is in the trie) or its neighbouring leaves.
    fn verify_proof(
        commitment: &Self::Commitment,
        challenges: &[Self::Challenge],
        proof: &Self::Proof,
    ) -> Result<BTreeSet<Self::Challenge>, DispatchError>;
}

/// Enum representing the type of mutation (addition or removal of a key).
#[derive(Encode, Decode, TypeInfo, Clone, PartialEq, Eq, Debug)]
pub enum TrieMutation {
    Add(TrieAddMutation),
    Remove(TrieRemoveMutation),
}

#[derive(Encode, Decode, TypeInfo, Clone, PartialEq, Eq, Debug, Default)]
pub struct TrieAddMutation {
    pub value: Vec<u8>,
}

impl TrieAddMutation {
    pub fn new(value: Vec<u8>) -> Self {
        Self { value }
    }
}

impl From<TrieAddMutation> for TrieMutation {
    fn from(mutation: TrieAddMutation) -> Self {
        TrieMutation::Add(mutation)
    }
}

/// Removes a key. When `maybe_value` is set, the leaf must currently hold exactly that value.
#[derive(Encode, Decode, TypeInfo, Clone, PartialEq, Eq, Debug, Default)]
pub struct TrieRemoveMutation {
    pub maybe_value: Option<Vec<u8>>,
}

impl TrieRemoveMutation {
    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            maybe_value: Some(value),
        }
    }
}

impl From<TrieRemoveMutation> for TrieMutation {
    fn from(mutation: TrieRemoveMutation) -> Self {
        TrieMutation::Remove(mutation)
    }
}

/// A trait to apply mutations (delta) to a partial trie based on a proof and a commitment.
pub trait TrieProofDeltaApplier<H: sp_core::Hasher> {
    /// The type that represents the proof.
    type Proof: Clone + PartialEq + Debug;
    /// The type that represents the keys (e.g. a Merkle root, node keys, etc.)
    type Key: MaybeDebug + Ord + Default + Copy + AsRef<[u8]> + AsMut<[u8]>;

    /// Apply mutations (delta) to a partial trie based on a proof and a commitment.
    ///
    /// Returns the MemoryDB of the trie generated by the proof, the new root computed after applying
    /// the mutations and, for every mutated key, the value it held before the mutation.
    fn apply_delta(
        root: &Self::Key,
        mutations: &[(Self::Key, TrieMutation)],
        proof: &Self::Proof,
    ) -> Result<
        (
            sp_trie::MemoryDB<H>,
            Self::Key,
            Vec<(Self::Key, Option<Vec<u8>>)>,
        ),
        DispatchError,
    >;
}

/// How strictly a ledger operation has to move the requested amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    /// Move exactly the requested amount or fail.
    Exact,
    /// Move as much as possible, up to the requested amount.
    BestEffort,
}

/// The balance primitives the coordination core needs from the underlying ledger.
///
/// Balances are either free or held under a reason. Held funds can only leave the account
/// through [`HoldLedger::release`] or [`HoldLedger::transfer_on_hold`].
pub trait HoldLedger<AccountId> {
    type Balance: NumericalParam;
    type Reason: Clone + Ord + Debug;

    /// The free (spendable) balance of `who`.
    fn free_balance(&self, who: &AccountId) -> Self::Balance;

    /// The amount of `who`'s funds held under `reason`.
    fn balance_on_hold(&self, reason: &Self::Reason, who: &AccountId) -> Self::Balance;

    /// Move `amount` from the free balance of `who` to its hold under `reason`.
    fn hold(
        &mut self,
        reason: &Self::Reason,
        who: &AccountId,
        amount: Self::Balance,
    ) -> Result<(), DispatchError>;

    /// Move held funds back to the free balance. Returns the amount actually released.
    fn release(
        &mut self,
        reason: &Self::Reason,
        who: &AccountId,
        amount: Self::Balance,
        precision: Precision,
    ) -> Result<Self::Balance, DispatchError>;

    /// Move held funds of `source` to the free balance of `dest`. Returns the amount moved.
    fn transfer_on_hold(
        &mut self,
        reason: &Self::Reason,
        source: &AccountId,
        dest: &AccountId,
        amount: Self::Balance,
        precision: Precision,
    ) -> Result<Self::Balance, DispatchError>;

    /// Move free funds of `source` to the free balance of `dest`. Returns the amount moved.
    fn transfer(
        &mut self,
        source: &AccountId,
        dest: &AccountId,
        amount: Self::Balance,
        precision: Precision,
    ) -> Result<Self::Balance, DispatchError>;
}

/// Computes the new price of storage for the next tick based on the system utilisation.
pub trait UpdateStoragePrice {
    /// The numerical type used to represent the price of storage.
    type Price: NumericalParam;
    /// The numerical type used to represent storage data.
    type StorageDataUnit: NumericalParam + Into<u64>;

    fn update_storage_price(
        &self,
        current_price: Self::Price,
        used_capacity: Self::StorageDataUnit,
        total_capacity: Self::StorageDataUnit,
    ) -> Self::Price;
}

/// Computes the share of a charged payment that goes to the treasury.
pub trait TreasuryCutCalculator {
    /// The numerical type of the charged amount.
    type Balance: NumericalParam;
    /// The numerical type used to represent storage data.
    type ProvidedUnit: NumericalParam + Into<u64>;

    fn calculate_treasury_cut(
        &self,
        provided_amount: Self::ProvidedUnit,
        used_amount: Self::ProvidedUnit,
        amount_to_charge: Self::Balance,
    ) -> Self::Balance;
}
