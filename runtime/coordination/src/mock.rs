//! Test harness: a runtime over the in-memory ledger with funded accounts, and the provider side
//! of the protocol (forests, file storage and proofs) the way a provider node runs it.

use std::collections::BTreeMap;

use codec::Encode;
use shc_file_manager::{
    in_memory::{InMemoryFileDataTrie, InMemoryFileStorage},
    traits::{FileDataTrie, FileStorage},
};
use shc_forest_manager::{in_memory::InMemoryForestStorage, traits::ForestStorage};
use shp_file_metadata::FileMetadata;
use sp_keyring::Sr25519Keyring;
use sp_runtime::traits::{BlakeTwo256, Hash};
use sp_trie::CompactProof;

use crate::{
    balances::Balances,
    config::RuntimeConfig,
    events::Event,
    file_system::{FileKeyWithProof, FileOperation, FileOperationIntention},
    forest::verify_forest_proof,
    proofs_dealer::{generate_challenges_from_seed, generate_key_challenges, Proof},
    providers::ValueProposition,
    types::{
        AccountId, Balance, BucketId, FileKey, Fingerprint, Origin, ProviderId, Signature,
        StorageData, StorageProofsMerkleTrieLayout, TickNumber, ValuePropId,
    },
    Runtime,
};

pub(crate) type Test = Runtime<Balances>;
type Layout = StorageProofsMerkleTrieLayout;

pub(crate) const INITIAL_BALANCE: Balance = 1_000_000_000_000;

pub(crate) const MSP_CAPACITY: StorageData = 1_000_000;
pub(crate) const BSP_CAPACITY: StorageData = 100_000;
pub(crate) const VALUE_PROP_PRICE: Balance = 1_000;
pub(crate) const BUCKET_DATA_LIMIT: StorageData = 500_000;

macro_rules! assert_ok {
    ($call:expr $(,)?) => {
        if let Err(e) = $call {
            panic!("Expected Ok(_). Got Err({:?})", e);
        }
    };
}

/// Asserts that a call fails with `$err` and leaves state, balances and events untouched.
macro_rules! assert_noop {
    ($rt:expr, $call:expr, $err:expr $(,)?) => {{
        let state_before = $rt.state().clone();
        let ledger_before = $rt.ledger().clone();
        let events_before = $rt.events().len();

        assert_eq!($call, Err($err.into()));

        assert_eq!(*$rt.state(), state_before, "state changed by a failed call");
        assert_eq!(*$rt.ledger(), ledger_before, "balances changed by a failed call");
        assert_eq!($rt.events().len(), events_before, "events deposited by a failed call");
    }};
}

pub(crate) use {assert_noop, assert_ok};

pub(crate) fn alice() -> AccountId {
    Sr25519Keyring::Alice.to_account_id()
}

pub(crate) fn bob() -> AccountId {
    Sr25519Keyring::Bob.to_account_id()
}

pub(crate) fn charlie() -> AccountId {
    Sr25519Keyring::Charlie.to_account_id()
}

pub(crate) fn dave() -> AccountId {
    Sr25519Keyring::Dave.to_account_id()
}

pub(crate) fn eve() -> AccountId {
    Sr25519Keyring::Eve.to_account_id()
}

pub(crate) fn ferdie() -> AccountId {
    Sr25519Keyring::Ferdie.to_account_id()
}

pub(crate) fn treasury() -> AccountId {
    RuntimeConfig::default().treasury_account
}

/// Account without any funds.
pub(crate) fn penniless() -> AccountId {
    AccountId::new([42; 32])
}

// Build the runtime with the default configuration and funded accounts, already at tick 1.
pub fn new_test_ext() -> Test {
    new_test_ext_with_config(RuntimeConfig::default())
}

pub fn new_test_ext_with_config(config: RuntimeConfig) -> Test {
    let mut balances = Balances::new();
    for account in [alice(), bob(), charlie(), dave(), eve(), ferdie()] {
        balances.deposit_creating(&account, INITIAL_BALANCE);
    }

    let mut rt = Runtime::new(config, balances).expect("test configuration is valid");
    roll_to(&mut rt, 1);
    rt
}

pub(crate) fn seed_for(tick: TickNumber) -> sp_core::H256 {
    BlakeTwo256::hash(&tick.to_le_bytes())
}

/// Rolls to the desired tick. Returns the number of ticks played.
pub(crate) fn roll_to(rt: &mut Test, n: TickNumber) -> TickNumber {
    let mut num_ticks = 0;
    while rt.current_tick() < n {
        roll_one_tick(rt);
        num_ticks += 1;
    }
    num_ticks
}

// Rolls forward one tick. Returns the new tick number.
pub(crate) fn roll_one_tick(rt: &mut Test) -> TickNumber {
    let next = rt.current_tick() + 1;
    rt.advance_tick(seed_for(next));
    next
}

pub(crate) fn events(rt: &Test) -> Vec<Event> {
    rt.events().iter().map(|record| record.event.clone()).collect()
}

pub(crate) fn last_event(rt: &Test) -> Event {
    rt.events()
        .last()
        .map(|record| record.event.clone())
        .expect("an event was deposited")
}

pub(crate) fn assert_last_event(rt: &Test, event: impl Into<Event>) {
    assert_eq!(last_event(rt), event.into());
}

pub(crate) fn assert_has_event(rt: &Test, event: impl Into<Event>) {
    let event = event.into();
    assert!(
        events(rt).contains(&event),
        "expected event {:?} was not deposited",
        event
    );
}

pub(crate) fn free_balance(rt: &Test, who: &AccountId) -> Balance {
    use shp_traits::HoldLedger;
    rt.ledger().free_balance(who)
}

pub(crate) fn held_balance(rt: &Test, reason: crate::types::HoldReason, who: &AccountId) -> Balance {
    use shp_traits::HoldLedger;
    rt.ledger().balance_on_hold(&reason, who)
}

// Providers

pub(crate) fn multiaddress(who: &AccountId) -> Vec<u8> {
    let mut multiaddress = b"/ip4/127.0.0.1/udp/1234/".to_vec();
    multiaddress.extend_from_slice(&who.encode()[..4]);
    multiaddress
}

pub(crate) fn default_value_prop() -> ValueProposition {
    ValueProposition::new(VALUE_PROP_PRICE, b"commitment".to_vec(), BUCKET_DATA_LIMIT)
}

/// Signs `who` up as an MSP offering [`default_value_prop`].
pub(crate) fn register_msp(rt: &mut Test, who: &AccountId) -> (ProviderId, ValuePropId) {
    let value_prop = default_value_prop();

    assert_ok!(rt.request_msp_sign_up(
        Origin::signed(who),
        MSP_CAPACITY,
        vec![multiaddress(who)],
        value_prop.price_per_giga_unit_of_data_per_tick,
        value_prop.commitment.clone(),
        value_prop.bucket_data_limit,
        who.clone(),
    ));
    roll_one_tick(rt);
    assert_ok!(rt.confirm_sign_up(Origin::signed(who), None));

    let msp_id = rt.get_msp_id_of(who).expect("MSP just signed up");
    (msp_id, value_prop.derive_id())
}

pub(crate) fn register_bsp(rt: &mut Test, who: &AccountId) -> ProviderId {
    register_bsp_with_capacity(rt, who, BSP_CAPACITY)
}

pub(crate) fn register_bsp_with_capacity(
    rt: &mut Test,
    who: &AccountId,
    capacity: StorageData,
) -> ProviderId {
    assert_ok!(rt.request_bsp_sign_up(
        Origin::signed(who),
        capacity,
        vec![multiaddress(who)],
        who.clone(),
    ));
    roll_one_tick(rt);
    assert_ok!(rt.confirm_sign_up(Origin::signed(who), None));

    rt.get_bsp_id_of(who).expect("BSP just signed up")
}

pub(crate) fn create_bucket(
    rt: &mut Test,
    owner: &AccountId,
    msp_id: ProviderId,
    value_prop_id: ValuePropId,
    name: &[u8],
) -> BucketId {
    assert_ok!(rt.create_bucket(
        Origin::signed(owner),
        msp_id,
        name.to_vec(),
        false,
        value_prop_id,
    ));
    Test::derive_bucket_id(owner, name)
}

// Files

/// A file as its owner has it before uploading it.
#[derive(Clone, Debug)]
pub(crate) struct TestFile {
    pub owner: AccountId,
    pub bucket_id: BucketId,
    pub location: Vec<u8>,
    pub data: Vec<u8>,
    pub fingerprint: Fingerprint,
    pub metadata: FileMetadata,
    pub file_key: FileKey,
}

impl TestFile {
    /// A file of `size` bytes whose content depends on `salt`.
    pub fn new(owner: &AccountId, bucket_id: BucketId, location: &[u8], size: usize, salt: u8) -> Self {
        let data: Vec<u8> = (0..size)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt))
            .collect();
        let trie = InMemoryFileDataTrie::<Layout>::from_bytes(&data).expect("file is merklised");
        let fingerprint = *trie.get_root();

        let metadata = FileMetadata::new(
            owner.encode(),
            bucket_id.as_bytes().to_vec(),
            location.to_vec(),
            data.len() as u64,
            fingerprint,
        )
        .expect("file metadata is valid");
        let file_key = metadata.file_key();

        Self {
            owner: owner.clone(),
            bucket_id,
            location: location.to_vec(),
            data,
            fingerprint,
            metadata,
            file_key,
        }
    }

    pub fn size(&self) -> StorageData {
        self.data.len() as StorageData
    }
}

pub(crate) fn issue_storage_request(
    rt: &mut Test,
    file: &TestFile,
    msp_id: ProviderId,
    bsps_required: u32,
) {
    assert_ok!(rt.issue_storage_request(
        Origin::signed(&file.owner),
        file.bucket_id,
        file.location.clone(),
        file.fingerprint,
        file.size(),
        msp_id,
        vec![b"peer".to_vec()],
        crate::file_system::ReplicationTarget::Custom(bsps_required),
    ));
}

/// What a provider node keeps: its forest (a BSP's or a bucket's) and the files it received.
pub(crate) struct ProviderNode {
    pub provider_id: ProviderId,
    pub forest: InMemoryForestStorage<Layout>,
    pub files: InMemoryFileStorage<Layout>,
}

impl ProviderNode {
    pub fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            forest: InMemoryForestStorage::new(),
            files: InMemoryFileStorage::new(),
        }
    }

    /// Stores the whole content of `file`, as downloaded from its owner.
    pub fn receive_file(&mut self, file: &TestFile) {
        if self.files.get_metadata(&file.file_key).ok().flatten().is_some() {
            return;
        }
        let trie = InMemoryFileDataTrie::<Layout>::from_bytes(&file.data).expect("file is merklised");
        self.files
            .insert_file_with_data(file.file_key, file.metadata.clone(), trie)
            .expect("file is stored");
    }

    /// Proof of the chunks challenged when committing to store `file`.
    pub fn commitment_proof(&mut self, file: &TestFile) -> FileKeyWithProof {
        self.receive_file(file);
        let challenges = generate_challenges_from_seed(
            file.file_key,
            &self.provider_id,
            file.metadata.chunks_to_check(),
        );
        let proof = self
            .files
            .generate_proof_for_challenges(&file.file_key, &challenges)
            .expect("file is complete");

        FileKeyWithProof {
            file_key: file.file_key,
            proof,
        }
    }

    /// Forest proof of the response of the forest to `keys`.
    pub fn forest_proof(&self, keys: &[FileKey]) -> CompactProof {
        if self.forest.is_empty() {
            return CompactProof {
                encoded_nodes: Vec::new(),
            };
        }
        self.forest
            .generate_proof(keys.to_vec())
            .expect("forest proof is generated")
            .proof
    }

    pub fn add_to_forest(&mut self, files: &[&TestFile]) {
        let metadata: Vec<FileMetadata> = files.iter().map(|file| file.metadata.clone()).collect();
        self.forest
            .insert_files_metadata(&metadata)
            .expect("files are not in the forest yet");
    }

    pub fn remove_from_forest(&mut self, file_key: &FileKey) {
        self.forest
            .delete_file_key(file_key)
            .expect("file is in the forest");
    }

    pub fn root(&self) -> sp_core::H256 {
        self.forest.root()
    }

    /// Proof answering the random and checkpoint challenges of the provider's next challenges
    /// tick.
    pub fn storage_proof(&self, rt: &Test) -> Proof {
        let record = rt
            .get_proof_submission_record(&self.provider_id)
            .expect("provider has a challenge cycle");
        let challenges_tick = record.next_tick_to_submit_proof_for;
        let seed = rt
            .get_challenge_seed(challenges_tick)
            .expect("seed of the challenges tick is stored");

        let mut challenges = generate_challenges_from_seed(
            seed,
            &self.provider_id,
            rt.config().proofs_dealer.random_challenges_per_tick,
        );
        for tick in record.last_tick_proven + 1..=challenges_tick {
            if let Some(checkpoint) = rt.get_checkpoint_challenges(tick) {
                challenges.extend(checkpoint.iter().map(|challenge| challenge.key));
            }
        }

        let forest_proof = self.forest_proof(&challenges);
        let proven = verify_forest_proof(&self.forest.root(), &challenges, &forest_proof)
            .expect("forest proof is valid");

        let key_proofs = proven
            .into_iter()
            .map(|file_key| {
                let metadata = self
                    .files
                    .get_metadata(&file_key)
                    .unwrap()
                    .expect("provider stores every file in its forest");
                let key_challenges = generate_key_challenges(
                    seed,
                    &file_key,
                    &self.provider_id,
                    metadata.chunks_to_check(),
                );
                let proof = self
                    .files
                    .generate_proof_for_challenges(&file_key, &key_challenges)
                    .unwrap();
                (file_key, proof)
            })
            .collect::<BTreeMap<_, _>>();

        Proof {
            forest_proof,
            key_proofs,
        }
    }
}

/// Runs a storage request from issuance to the BSPs' confirmations and the MSP's acceptance,
/// adding the file to the forest of every node involved.
pub(crate) fn store_file(
    rt: &mut Test,
    file: &TestFile,
    msp: &mut ProviderNode,
    bsps: Vec<(&AccountId, &mut ProviderNode)>,
) {
    issue_storage_request(rt, file, msp.provider_id, bsps.len() as u32);

    for (who, node) in bsps {
        volunteer_and_confirm(rt, who, node, file);
    }

    let msp_account = rt
        .get_provider(msp.provider_id)
        .map(|provider| match provider {
            crate::providers::StorageProvider::MainStorageProvider(msp) => msp.owner_account,
            crate::providers::StorageProvider::BackupStorageProvider(bsp) => bsp.owner_account,
        })
        .expect("MSP is registered");
    msp_accept(rt, &msp_account, msp, &[file]);
}

/// Waits until the BSP of `node` can volunteer for `file`, then volunteers and confirms storing
/// it.
pub(crate) fn volunteer_and_confirm(rt: &mut Test, who: &AccountId, node: &mut ProviderNode, file: &TestFile) {
    let earliest = rt
        .query_earliest_file_volunteer_tick(&node.provider_id, &file.file_key)
        .unwrap();
    roll_to(rt, earliest);
    assert_ok!(rt.bsp_volunteer(Origin::signed(who), file.file_key));
    let proof = node.commitment_proof(file);
    let non_inclusion = node.forest_proof(&[file.file_key]);
    assert_ok!(rt.bsp_confirm_storing(Origin::signed(who), non_inclusion, vec![proof]));
    node.add_to_forest(&[file]);
}

pub(crate) fn msp_accept(rt: &mut Test, msp_account: &AccountId, msp: &mut ProviderNode, files: &[&TestFile]) {
    let bucket_id = files[0].bucket_id;
    let keys: Vec<FileKey> = files.iter().map(|file| file.file_key).collect();
    let forest_proof = msp.forest_proof(&keys);
    let file_keys_and_proofs = files.iter().map(|file| msp.commitment_proof(file)).collect();

    assert_ok!(rt.msp_respond_storage_requests_multiple_buckets(
        Origin::signed(msp_account),
        vec![crate::file_system::MspStorageRequestsBucketResponse {
            bucket_id,
            accept: Some(crate::file_system::MspAcceptedStorageRequests {
                file_keys_and_proofs,
                forest_proof,
            }),
            reject: Vec::new(),
        }],
    ));
    msp.add_to_forest(files);
}

/// The owner's signed intention to delete `file_key`.
pub(crate) fn signed_deletion(
    keyring: Sr25519Keyring,
    file_key: FileKey,
) -> (FileOperationIntention, Signature) {
    let intention = FileOperationIntention {
        file_key,
        operation: FileOperation::Delete,
    };
    let signature = Signature::from(keyring.sign(&intention.encode()));
    (intention, signature)
}
