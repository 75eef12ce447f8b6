//! Mock collaborators and fixture builders shared by the crate's tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use veil_client_types::{
    Address, AppendOnlyTreeSnapshot, BlockHeader, BlockLogs, ByteReader, CompleteAddress,
    DeferredNoteDao, Deserializable, Field, L2Block, L2BlockContext, L2Tx, LogData, LogKind, Note,
    NoteDao, PublicKey, SecretKey, Serializable, TreeId, TreeSnapshots, TxHash, TxLogs,
    INITIAL_L2_BLOCK_NUM, MAX_NOTE_HASHES_PER_TX,
};

use crate::interpreter::{ContractInterpreter, InterpreterError, NoteHashAndNullifier};
use crate::keystore::{DecryptedNote, KeyStore, KeyStoreError, NoteDecryptor};
use crate::node::{NodeClient, NodeError, SnapshotTag};
use crate::processor::NoteProcessor;
use crate::store::{Database, DatabaseError, MemoryStore};
use crate::serial_queue::SerialQueue;
use crate::synchronizer::{SyncConfig, Synchronizer};

// TEST HARNESS
// ================================================================================================

/// Bundles one instance of every collaborator the synchronizer needs.
pub struct TestHarness {
    pub node: Arc<MockNode>,
    pub db: Arc<TestStore>,
    pub key_store: Arc<TestKeyStore>,
    pub decryptor: Arc<TestDecryptor>,
    pub interpreter: Arc<TestInterpreter>,
}

impl TestHarness {
    pub fn new() -> Self {
        // Best effort: the first harness of the test run wires the
        // subscriber, later ones fail to re-register and that is fine.
        let _ = veil_client_utils::logging::setup_tracing();
        Self {
            node: Arc::new(MockNode::new()),
            db: Arc::new(TestStore::new()),
            key_store: Arc::new(TestKeyStore::new()),
            decryptor: Arc::new(TestDecryptor),
            interpreter: Arc::new(TestInterpreter::new()),
        }
    }

    pub fn processor(&self, owner: PublicKey, starting_block: u64) -> NoteProcessor {
        NoteProcessor::new(
            owner,
            self.key_store.clone(),
            self.decryptor.clone(),
            self.interpreter.clone(),
            self.db.clone(),
            self.node.clone(),
            starting_block,
        )
    }

    /// Builds a synchronizer wired to this harness along with its serial
    /// queue. Must run inside a tokio runtime.
    pub fn synchronizer(&self, config: SyncConfig) -> (Synchronizer, Arc<SerialQueue>) {
        let queue = Arc::new(SerialQueue::new());
        let synchronizer = Synchronizer::new(
            self.node.clone(),
            self.db.clone(),
            self.decryptor.clone(),
            self.interpreter.clone(),
            queue.clone(),
            config,
        );
        (synchronizer, queue)
    }
}

/// Registers a fresh account in the harness key store and returns its key
/// pair. The secret is, by test convention, the x coordinate of the public
/// key.
pub fn test_account(harness: &TestHarness, seed: u64) -> (PublicKey, SecretKey) {
    let x = Field::from_u64(seed * 2 + 1);
    let y = Field::from_u64(seed * 2 + 2);
    let public_key = PublicKey::new(x, y);
    let secret = SecretKey::new(*x.as_bytes());
    harness.key_store.register_account(public_key, secret.clone());
    (public_key, secret)
}

/// The storage slot used by fixture notes.
pub fn test_slot() -> Field {
    Field::from_u64(1)
}

// MOCK NODE
// ================================================================================================

/// A scripted [`NodeClient`]: serves pre-built blocks and logs, records some
/// calls, and can inject failures.
pub struct MockNode {
    state: Mutex<MockNodeState>,
}

#[derive(Default)]
struct MockNodeState {
    blocks: Vec<L2Block>,
    logs: Vec<BlockLogs>,
    nullifier_leaves: Vec<Field>,
    fail_get_logs: u32,
    /// When set, `get_blocks` serves nothing past this block number even if
    /// logs for later blocks exist.
    max_served_block: Option<u64>,
    header_calls: u32,
}

impl MockNode {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockNodeState::default()) }
    }

    pub fn push_block(&self, block: L2Block, logs: BlockLogs) {
        let mut state = self.lock();
        assert_eq!(
            block.number,
            INITIAL_L2_BLOCK_NUM + state.blocks.len() as u64,
            "mock chain must stay contiguous"
        );
        state.blocks.push(block);
        state.logs.push(logs);
    }

    pub fn add_nullifier_leaf(&self, leaf: Field) {
        self.lock().nullifier_leaves.push(leaf);
    }

    /// Makes the next `count` calls to `get_logs` fail with a transport
    /// error.
    pub fn fail_next_get_logs(&self, count: u32) {
        self.lock().fail_get_logs = count;
    }

    pub fn set_max_served_block(&self, limit: Option<u64>) {
        self.lock().max_served_block = limit;
    }

    pub fn header_calls(&self) -> u32 {
        self.lock().header_calls
    }

    pub fn latest(&self) -> u64 {
        let state = self.lock();
        state.blocks.last().map_or(INITIAL_L2_BLOCK_NUM - 1, |block| block.number)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockNodeState> {
        self.state.lock().expect("mock node mutex poisoned")
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn get_block_number(&self) -> Result<u64, NodeError> {
        Ok(self.latest())
    }

    async fn get_block_header(&self) -> Result<BlockHeader, NodeError> {
        let mut state = self.lock();
        state.header_calls += 1;
        Ok(state.blocks.last().map_or_else(BlockHeader::default, L2Block::header))
    }

    async fn get_blocks(&self, from: u64, limit: usize) -> Result<Vec<L2Block>, NodeError> {
        let state = self.lock();
        let max = state.max_served_block.unwrap_or(u64::MAX);
        Ok(state
            .blocks
            .iter()
            .filter(|block| block.number >= from && block.number <= max)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_logs(
        &self,
        from: u64,
        limit: usize,
        kind: LogKind,
    ) -> Result<Vec<BlockLogs>, NodeError> {
        let mut state = self.lock();
        if state.fail_get_logs > 0 {
            state.fail_get_logs -= 1;
            return Err(NodeError::Transport("injected get_logs failure".to_string()));
        }

        let start = usize::try_from(from.saturating_sub(INITIAL_L2_BLOCK_NUM)).unwrap();
        if from < INITIAL_L2_BLOCK_NUM || start >= state.blocks.len() {
            return Ok(Vec::new());
        }
        let end = (start + limit).min(state.blocks.len());

        let bundles = match kind {
            LogKind::Encrypted => state.logs[start..end].to_vec(),
            // The mock chain carries no unencrypted logs; serve empty
            // bundles shaped like the blocks.
            LogKind::Unencrypted => state.blocks[start..end]
                .iter()
                .map(|block| BlockLogs::empty(block.txs.len()))
                .collect(),
        };
        Ok(bundles)
    }

    async fn find_leaf_index(
        &self,
        _snapshot: SnapshotTag,
        tree: TreeId,
        leaf: Field,
    ) -> Result<Option<u64>, NodeError> {
        if tree != TreeId::Nullifier {
            return Ok(None);
        }
        let state = self.lock();
        Ok(state
            .nullifier_leaves
            .iter()
            .position(|candidate| *candidate == leaf)
            .map(|position| position as u64))
    }
}

// TEST STORE
// ================================================================================================

/// A [`MemoryStore`] wrapper with failure injection.
pub struct TestStore {
    inner: MemoryStore,
    fail_add_notes: AtomicU32,
    fail_add_deferred_notes: AtomicU32,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_add_notes: AtomicU32::new(0),
            fail_add_deferred_notes: AtomicU32::new(0),
        }
    }

    /// Makes the next `add_notes` call fail.
    pub fn fail_next_add_notes(&self) {
        self.fail_add_notes.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes the next `add_deferred_notes` call fail.
    pub fn fail_next_add_deferred_notes(&self) {
        self.fail_add_deferred_notes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn register_address(&self, complete: CompleteAddress) -> bool {
        self.inner.register_address(complete)
    }

    pub fn notes(&self) -> Vec<NoteDao> {
        self.inner.notes()
    }

    pub fn deferred_notes(&self) -> Vec<DeferredNoteDao> {
        self.inner.deferred_notes()
    }
}

#[async_trait]
impl Database for TestStore {
    async fn get_block_number(&self) -> Result<Option<u64>, DatabaseError> {
        self.inner.get_block_number().await
    }

    async fn set_block_data(
        &self,
        block_number: u64,
        header: BlockHeader,
    ) -> Result<(), DatabaseError> {
        self.inner.set_block_data(block_number, header).await
    }

    async fn add_notes(&self, notes: Vec<NoteDao>) -> Result<(), DatabaseError> {
        if self.fail_add_notes.load(Ordering::SeqCst) > 0 {
            self.fail_add_notes.fetch_sub(1, Ordering::SeqCst);
            return Err(DatabaseError::Backend("injected add_notes failure".to_string()));
        }
        self.inner.add_notes(notes).await
    }

    async fn remove_nullified_notes(
        &self,
        nullifiers: &[Field],
        public_key: &PublicKey,
    ) -> Result<Vec<NoteDao>, DatabaseError> {
        self.inner.remove_nullified_notes(nullifiers, public_key).await
    }

    async fn add_deferred_notes(&self, notes: Vec<DeferredNoteDao>) -> Result<(), DatabaseError> {
        if self.fail_add_deferred_notes.load(Ordering::SeqCst) > 0 {
            self.fail_add_deferred_notes.fetch_sub(1, Ordering::SeqCst);
            return Err(DatabaseError::Backend(
                "injected add_deferred_notes failure".to_string(),
            ));
        }
        self.inner.add_deferred_notes(notes).await
    }

    async fn get_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError> {
        self.inner.get_deferred_notes_by_contract(contract).await
    }

    async fn remove_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError> {
        self.inner.remove_deferred_notes_by_contract(contract).await
    }

    async fn get_complete_address(
        &self,
        address: Address,
    ) -> Result<Option<CompleteAddress>, DatabaseError> {
        self.inner.get_complete_address(address).await
    }

    async fn estimate_size(&self) -> Result<u64, DatabaseError> {
        self.inner.estimate_size().await
    }
}

// TEST KEY STORE
// ================================================================================================

pub struct TestKeyStore {
    keys: Mutex<HashMap<PublicKey, SecretKey>>,
}

impl TestKeyStore {
    pub fn new() -> Self {
        Self { keys: Mutex::new(HashMap::new()) }
    }

    pub fn register_account(&self, public_key: PublicKey, secret: SecretKey) {
        self.keys.lock().expect("key store mutex poisoned").insert(public_key, secret);
    }
}

impl KeyStore for TestKeyStore {
    fn secret_key(&self, account: &PublicKey) -> Result<SecretKey, KeyStoreError> {
        self.keys
            .lock()
            .expect("key store mutex poisoned")
            .get(account)
            .cloned()
            .ok_or(KeyStoreError::AccountNotFound(*account))
    }
}

// TEST DECRYPTOR
// ================================================================================================

/// Stand-in for the real note encryption: the "ciphertext" is the recipient's
/// public key followed by the plaintext, and a log decrypts iff the secret
/// matches the embedded key (see [`test_account`]).
pub struct TestDecryptor;

/// Builds the log payload [`TestDecryptor`] understands.
pub fn encrypt_note_log(
    recipient: &PublicKey,
    contract: Address,
    storage_slot: Field,
    note: &Note,
) -> LogData {
    let mut bytes = Vec::new();
    recipient.write_into(&mut bytes);
    contract.write_into(&mut bytes);
    storage_slot.write_into(&mut bytes);
    note.write_into(&mut bytes);
    LogData::new(bytes)
}

impl NoteDecryptor for TestDecryptor {
    fn decrypt_note(&self, log: &LogData, secret: &SecretKey) -> Option<DecryptedNote> {
        let mut reader = ByteReader::new(log.as_bytes());
        let recipient = PublicKey::read_from(&mut reader).ok()?;
        if recipient.x.as_bytes() != secret.as_bytes() {
            return None;
        }
        let contract_address = Address::read_from(&mut reader).ok()?;
        let storage_slot = Field::read_from(&mut reader).ok()?;
        let note = Note::read_from(&mut reader).ok()?;
        reader.finish().ok()?;
        Some(DecryptedNote { contract_address, storage_slot, note })
    }
}

// TEST INTERPRETER
// ================================================================================================

/// A [`ContractInterpreter`] with a mutable set of known contracts and a
/// deterministic commitment derivation shared with the fixture builders.
pub struct TestInterpreter {
    known: Mutex<HashSet<Address>>,
}

impl TestInterpreter {
    pub fn new() -> Self {
        Self { known: Mutex::new(HashSet::new()) }
    }

    pub fn register_contract(&self, contract: Address) {
        self.known.lock().expect("interpreter mutex poisoned").insert(contract);
    }

    pub fn note_hash_for(contract: Address, storage_slot: Field, note: &Note) -> Field {
        mix(0x6e6f_7465, contract, storage_slot, note)
    }

    pub fn nullifier_for(contract: Address, storage_slot: Field, note: &Note) -> Field {
        mix(0x6e75_6c6c, contract, storage_slot, note)
    }
}

impl ContractInterpreter for TestInterpreter {
    fn compute_note_hash_and_nullifier(
        &self,
        contract: Address,
        storage_slot: Field,
        note: &Note,
    ) -> Result<Option<NoteHashAndNullifier>, InterpreterError> {
        if !self.known.lock().expect("interpreter mutex poisoned").contains(&contract) {
            return Ok(None);
        }
        if note.items().is_empty() {
            return Err(InterpreterError::InvalidNotePayload(
                contract,
                "empty note payload".to_string(),
            ));
        }
        Ok(Some(NoteHashAndNullifier {
            note_hash: Self::note_hash_for(contract, storage_slot, note),
            siloed_nullifier: Self::nullifier_for(contract, storage_slot, note),
        }))
    }
}

/// FNV-style mixing of a note's identity into a deterministic fake
/// commitment.
fn mix(domain: u64, contract: Address, storage_slot: Field, note: &Note) -> Field {
    let mut acc = 0xcbf2_9ce4_8422_2325u64 ^ domain;
    let mut absorb = |field: &Field| {
        for &byte in field.as_bytes() {
            acc = (acc ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3);
        }
    };
    absorb(&contract.as_field());
    absorb(&storage_slot);
    for item in note.items() {
        absorb(item);
    }

    let mut bytes = [0u8; 32];
    for lane in 0u64..4 {
        acc = acc.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(lane + 1);
        bytes[lane as usize * 8..][..8].copy_from_slice(&acc.to_be_bytes());
    }
    Field::new(bytes)
}

// TEST CHAIN
// ================================================================================================

/// Builds a contiguous chain of blocks with consistent note-hash tree
/// geometry, ready to publish into a [`MockNode`].
pub struct TestChain {
    blocks: Vec<(L2Block, BlockLogs)>,
    next_note_hash_index: u64,
}

impl TestChain {
    pub fn new() -> Self {
        Self { blocks: Vec::new(), next_note_hash_index: 0 }
    }

    /// Appends a block with one transaction emitting one note for `owner`.
    pub fn add_note_block(&mut self, owner: PublicKey, contract: Address, note: &Note) {
        let note_hash = TestInterpreter::note_hash_for(contract, test_slot(), note);
        let log = encrypt_note_log(&owner, contract, test_slot(), note);
        let tx = self.make_tx(0, vec![note_hash]);
        self.push_block(vec![tx], vec![TxLogs { logs: vec![log] }]);
    }

    /// Appends a block with two transactions where only the second emits a
    /// note for `owner`.
    pub fn add_two_tx_block(&mut self, owner: PublicKey, contract: Address, note: &Note) {
        let note_hash = TestInterpreter::note_hash_for(contract, test_slot(), note);
        let log = encrypt_note_log(&owner, contract, test_slot(), note);
        let empty_tx = self.make_tx(0, vec![]);
        let note_tx = self.make_tx(1, vec![note_hash]);
        self.push_block(
            vec![empty_tx, note_tx],
            vec![TxLogs::default(), TxLogs { logs: vec![log] }],
        );
    }

    /// Appends a block with one transaction carrying arbitrary commitments
    /// and logs.
    pub fn add_block_with_commitments(&mut self, note_hashes: Vec<Field>, logs: Vec<LogData>) {
        let tx = self.make_tx(0, note_hashes);
        self.push_block(vec![tx], vec![TxLogs { logs }]);
    }

    pub fn add_empty_block(&mut self) {
        self.push_block(vec![], vec![]);
    }

    /// The transaction nullifier of the `tx_index`-th transaction of
    /// `block_number`.
    pub fn tx_nullifier(&self, block_number: u64, tx_index: u64) -> Field {
        Field::from_u64(block_number * 1000 + tx_index + 13)
    }

    pub fn publish(&self, node: &MockNode) {
        for (block, logs) in &self.blocks {
            node.push_block(block.clone(), logs.clone());
        }
    }

    /// Blocks with number `>= from`, for publishing a chain in stages.
    pub fn blocks_from(&self, from: u64) -> Vec<(L2Block, BlockLogs)> {
        self.blocks.iter().filter(|(block, _)| block.number >= from).cloned().collect()
    }

    /// Blocks `[from, from + limit)` as a processing batch, for driving a
    /// [`NoteProcessor`] directly.
    pub fn batch(&self, from: u64, limit: usize) -> (Vec<L2BlockContext>, Vec<BlockLogs>) {
        self.blocks
            .iter()
            .filter(|(block, _)| block.number >= from)
            .take(limit)
            .map(|(block, logs)| (L2BlockContext::new(block.clone()), logs.clone()))
            .unzip()
    }

    fn next_number(&self) -> u64 {
        INITIAL_L2_BLOCK_NUM + self.blocks.len() as u64
    }

    fn make_tx(&self, tx_index: u64, note_hashes: Vec<Field>) -> L2Tx {
        let number = self.next_number();
        L2Tx {
            hash: TxHash::from_u64(number * 1000 + tx_index),
            note_hashes,
            nullifiers: vec![self.tx_nullifier(number, tx_index)],
        }
    }

    fn push_block(&mut self, txs: Vec<L2Tx>, logs: Vec<TxLogs>) {
        assert_eq!(txs.len(), logs.len(), "fixture logs must align with txs");
        let number = self.next_number();
        let start_index = self.next_note_hash_index;
        let end_index = start_index + txs.len() as u64 * MAX_NOTE_HASHES_PER_TX;
        self.next_note_hash_index = end_index;

        let block = L2Block {
            number,
            global_variables_hash: Field::from_u64(number * 7),
            start: tree_snapshots(number * 100, start_index),
            end: tree_snapshots(number * 100 + 50, end_index),
            txs,
        };
        self.blocks.push((block, BlockLogs { txs: logs }));
    }
}

fn tree_snapshots(root_seed: u64, note_hash_leaf_index: u64) -> TreeSnapshots {
    let snapshot = |salt: u64| AppendOnlyTreeSnapshot {
        root: Field::from_u64(root_seed + salt),
        next_available_leaf_index: 0,
    };
    TreeSnapshots {
        note_hash_tree: AppendOnlyTreeSnapshot {
            root: Field::from_u64(root_seed),
            next_available_leaf_index: note_hash_leaf_index,
        },
        nullifier_tree: snapshot(1),
        contract_tree: snapshot(2),
        l1_to_l2_message_tree: snapshot(3),
        public_data_tree: snapshot(4),
        archive_tree: snapshot(5),
    }
}
