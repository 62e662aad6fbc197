use std::collections::BTreeMap;

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use shp_file_key_verifier::FileKeyProof;
use sp_trie::CompactProof;

use crate::types::{FileKey, TickNumber};

/// A challenge queued by a user or governance, dispatched in the next checkpoint.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct CustomChallenge {
    pub key: FileKey,
    /// If the key is in the forest of a provider, proving it also removes it.
    pub should_remove_key: bool,
}

/// A proof of storage: a forest proof answering every challenge, and a key proof for each
/// file key the forest proof responds with.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct Proof {
    pub forest_proof: CompactProof,
    pub key_proofs: BTreeMap<FileKey, FileKeyProof>,
}

/// Where a provider stands in its challenge cycle.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ProofSubmissionRecord {
    /// The challenges tick of the last accepted proof.
    pub last_tick_proven: TickNumber,
    /// The challenges tick the next proof has to answer.
    pub next_tick_to_submit_proof_for: TickNumber,
}
