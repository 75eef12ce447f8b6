use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use veil_client_types::{BlockLogs, DeferredNoteDao, Field, L2BlockContext, NoteDao, PublicKey};

use crate::interpreter::{ContractInterpreter, NoteHashAndNullifier};
use crate::keystore::{KeyStore, NoteDecryptor};
use crate::node::NodeClient;
use crate::store::Database;
use crate::{SyncError, COMPONENT};

// NOTE PROCESSOR STATS
// ================================================================================================

/// Counters tracking what one account's processor has seen so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoteProcessorStats {
    /// Encrypted logs inspected.
    pub seen: u64,
    /// Logs that decrypted to a note addressed to this account.
    pub decrypted: u64,
    /// Decrypted notes parked because their contract was unknown.
    pub deferred: u64,
    /// Decrypted notes dropped because interpretation failed or the note hash
    /// did not match the transaction's commitments.
    pub failed: u64,
}

// NOTE PROCESSOR
// ================================================================================================

/// Per-account scanning state machine.
///
/// Fed batches of contiguous blocks together with their encrypted logs, it
/// trial-decrypts every log with the account's secret, interprets the hits
/// through the contract registry, and persists the resulting notes. Notes
/// whose contract is unknown are persisted in deferred form instead; the
/// synchronizer re-drives those once the contract registers.
///
/// `synced_to_block` is this account's private cursor. It starts one below
/// the account's starting block, advances monotonically one block at a time,
/// and never overtakes the global cursor.
pub struct NoteProcessor {
    public_key: PublicKey,
    key_store: Arc<dyn KeyStore>,
    decryptor: Arc<dyn NoteDecryptor>,
    interpreter: Arc<dyn ContractInterpreter>,
    db: Arc<dyn Database>,
    node: Arc<dyn NodeClient>,
    synced_to_block: u64,
    stats: NoteProcessorStats,
    started_at: Instant,
}

impl NoteProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        public_key: PublicKey,
        key_store: Arc<dyn KeyStore>,
        decryptor: Arc<dyn NoteDecryptor>,
        interpreter: Arc<dyn ContractInterpreter>,
        db: Arc<dyn Database>,
        node: Arc<dyn NodeClient>,
        starting_block: u64,
    ) -> Self {
        Self {
            public_key,
            key_store,
            decryptor,
            interpreter,
            db,
            node,
            synced_to_block: starting_block.saturating_sub(1),
            stats: NoteProcessorStats::default(),
            started_at: Instant::now(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn synced_to_block(&self) -> u64 {
        self.synced_to_block
    }

    pub fn stats(&self) -> NoteProcessorStats {
        self.stats
    }

    /// Time elapsed since this processor was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether this account has scanned up to the node's latest block.
    pub async fn is_synchronized(&self) -> Result<bool, SyncError> {
        Ok(self.synced_to_block >= self.node.get_block_number().await?)
    }

    /// Scans a batch of contiguous blocks for notes addressed to this
    /// account.
    ///
    /// `logs[i]` must be the encrypted log bundle of `block_contexts[i]`, and
    /// the batch must start exactly one block past `synced_to_block`. Each
    /// block's results are persisted before the cursor advances past it, so a
    /// storage failure leaves the cursor behind the failed block and the
    /// batch can be retried. A failure can strike between the note write and
    /// the deferred-note write; replaying the block is still safe because
    /// [`Database::add_notes`] ignores rows it already holds.
    pub async fn process(
        &mut self,
        block_contexts: &[L2BlockContext],
        logs: &[BlockLogs],
    ) -> Result<(), SyncError> {
        if block_contexts.is_empty() {
            return Ok(());
        }
        if block_contexts.len() != logs.len() {
            return Err(SyncError::Invariant(format!(
                "batch carries {} blocks but {} log bundles",
                block_contexts.len(),
                logs.len()
            )));
        }

        let secret = self.key_store.secret_key(&self.public_key)?;

        for (context, block_logs) in block_contexts.iter().zip(logs) {
            let block = context.block();
            if block.number != self.synced_to_block + 1 {
                return Err(SyncError::Invariant(format!(
                    "block {} fed to processor synced to {}",
                    block.number, self.synced_to_block
                )));
            }

            let mut new_notes = Vec::new();
            let mut deferred_notes = Vec::new();

            for (tx_index, tx) in block.txs.iter().enumerate() {
                let data_start_index = context.tx_note_hash_start_index(tx_index);
                let tx_logs =
                    block_logs.txs.get(tx_index).map(|tx_logs| tx_logs.logs.as_slice()).unwrap_or(&[]);

                for log in tx_logs {
                    self.stats.seen += 1;
                    let Some(decrypted) = self.decryptor.decrypt_note(log, &secret) else {
                        continue;
                    };
                    self.stats.decrypted += 1;

                    match self.interpreter.compute_note_hash_and_nullifier(
                        decrypted.contract_address,
                        decrypted.storage_slot,
                        &decrypted.note,
                    ) {
                        Ok(Some(commitments)) => {
                            match place_note(&tx.note_hashes, commitments.note_hash) {
                                Some(offset) => new_notes.push(NoteDao {
                                    public_key: self.public_key,
                                    contract_address: decrypted.contract_address,
                                    storage_slot: decrypted.storage_slot,
                                    note: decrypted.note,
                                    note_hash: commitments.note_hash,
                                    siloed_nullifier: commitments.siloed_nullifier,
                                    tx_hash: tx.hash,
                                    leaf_index: data_start_index + offset as u64,
                                }),
                                None => {
                                    self.stats.failed += 1;
                                    debug!(
                                        target: COMPONENT,
                                        account = %self.public_key,
                                        tx = %tx.hash,
                                        note_hash = %commitments.note_hash,
                                        "note hash not found exactly once in tx commitments, dropping note"
                                    );
                                },
                            }
                        },
                        Ok(None) => {
                            self.stats.deferred += 1;
                            debug!(
                                target: COMPONENT,
                                account = %self.public_key,
                                contract = %decrypted.contract_address,
                                tx = %tx.hash,
                                "contract code unknown, deferring note"
                            );
                            deferred_notes.push(DeferredNoteDao {
                                public_key: self.public_key,
                                note: decrypted.note,
                                contract_address: decrypted.contract_address,
                                storage_slot: decrypted.storage_slot,
                                tx_hash: tx.hash,
                                tx_nullifier: tx.tx_nullifier(),
                                note_hashes: tx.note_hashes.clone(),
                                data_start_index: data_start_index as u32,
                            });
                        },
                        Err(err) => {
                            self.stats.failed += 1;
                            debug!(
                                target: COMPONENT,
                                account = %self.public_key,
                                tx = %tx.hash,
                                err = %err,
                                "note interpretation failed, dropping note"
                            );
                        },
                    }
                }
            }

            if !new_notes.is_empty() {
                self.db.add_notes(new_notes).await?;
            }
            if !deferred_notes.is_empty() {
                self.db.add_deferred_notes(deferred_notes).await?;
            }
            self.synced_to_block = block.number;
        }

        Ok(())
    }

    /// Interprets deferred notes belonging to this account.
    ///
    /// Invoked by the synchronizer once the contract that stalled them is
    /// registered. Notes that still fail to interpret are dropped.
    pub fn decode_deferred_notes(&mut self, deferred: &[DeferredNoteDao]) -> Vec<NoteDao> {
        deferred.iter().filter_map(|note| self.decode_deferred_note(note)).collect()
    }

    fn decode_deferred_note(&mut self, deferred: &DeferredNoteDao) -> Option<NoteDao> {
        let commitments = match self.interpreter.compute_note_hash_and_nullifier(
            deferred.contract_address,
            deferred.storage_slot,
            &deferred.note,
        ) {
            Ok(Some(commitments)) => commitments,
            Ok(None) => {
                self.stats.failed += 1;
                debug!(
                    target: COMPONENT,
                    account = %self.public_key,
                    contract = %deferred.contract_address,
                    "contract still unknown while decoding deferred note, dropping"
                );
                return None;
            },
            Err(err) => {
                self.stats.failed += 1;
                debug!(
                    target: COMPONENT,
                    account = %self.public_key,
                    tx = %deferred.tx_hash,
                    err = %err,
                    "deferred note interpretation failed, dropping"
                );
                return None;
            },
        };

        let NoteHashAndNullifier { note_hash, siloed_nullifier } = commitments;
        let offset = match place_note(&deferred.note_hashes, note_hash) {
            Some(offset) => offset,
            None => {
                self.stats.failed += 1;
                debug!(
                    target: COMPONENT,
                    account = %self.public_key,
                    tx = %deferred.tx_hash,
                    %note_hash,
                    "deferred note hash not found exactly once in tx commitments, dropping"
                );
                return None;
            },
        };

        self.stats.decrypted += 1;
        Some(NoteDao {
            public_key: deferred.public_key,
            contract_address: deferred.contract_address,
            storage_slot: deferred.storage_slot,
            note: deferred.note.clone(),
            note_hash,
            siloed_nullifier,
            tx_hash: deferred.tx_hash,
            leaf_index: u64::from(deferred.data_start_index) + offset as u64,
        })
    }
}

// HELPERS
// ================================================================================================

/// Position of `note_hash` within a transaction's commitments, requiring a
/// unique match. A note whose hash is absent was spoofed or mis-derived; one
/// that appears twice cannot be assigned a leaf index unambiguously.
fn place_note(note_hashes: &[Field], note_hash: Field) -> Option<usize> {
    let mut position = None;
    for (index, candidate) in note_hashes.iter().enumerate() {
        if *candidate == note_hash {
            if position.is_some() {
                return None;
            }
            position = Some(index);
        }
    }
    position
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use veil_client_types::{Address, Note, MAX_NOTE_HASHES_PER_TX};

    use super::*;
    use crate::test_utils::{
        encrypt_note_log, test_account, test_slot, TestChain, TestHarness, TestInterpreter,
    };

    #[rstest]
    #[case::absent(vec![1, 2, 3], 9, None)]
    #[case::unique(vec![1, 2, 3], 2, Some(1))]
    #[case::duplicated(vec![1, 2, 2], 2, None)]
    fn place_note_requires_unique_match(
        #[case] hashes: Vec<u64>,
        #[case] needle: u64,
        #[case] expected: Option<usize>,
    ) {
        let hashes: Vec<Field> = hashes.into_iter().map(Field::from_u64).collect();
        assert_eq!(place_note(&hashes, Field::from_u64(needle)), expected);
    }

    #[tokio::test]
    async fn notes_are_decoded_and_persisted() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);
        harness.interpreter.register_contract(contract);

        let mut chain = TestChain::new();
        let note = Note::new(vec![Field::from_u64(42)]);
        chain.add_note_block(owner, contract, &note);
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();

        assert_eq!(processor.synced_to_block(), 1);
        let notes = harness.db.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].note, note);
        assert_eq!(notes[0].leaf_index, contexts[0].first_note_hash_index());
        assert_eq!(processor.stats(), NoteProcessorStats {
            seen: 1,
            decrypted: 1,
            deferred: 0,
            failed: 0
        });
    }

    #[tokio::test]
    async fn unknown_contract_defers_the_note() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);
        // Contract deliberately not registered.

        let mut chain = TestChain::new();
        let note = Note::new(vec![Field::from_u64(42)]);
        chain.add_note_block(owner, contract, &note);
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();

        assert_eq!(harness.db.notes(), vec![]);
        let deferred = harness.db.deferred_notes();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].contract_address, contract);
        assert_eq!(deferred[0].note, note);
        assert_eq!(processor.stats().deferred, 1);
    }

    #[tokio::test]
    async fn foreign_logs_are_ignored() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let (stranger, _) = test_account(&harness, 2);
        let contract = Address::from_u64(10);
        harness.interpreter.register_contract(contract);

        let mut chain = TestChain::new();
        chain.add_note_block(stranger, contract, &Note::new(vec![Field::from_u64(1)]));
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();

        assert_eq!(harness.db.notes(), vec![]);
        assert_eq!(processor.stats(), NoteProcessorStats {
            seen: 1,
            decrypted: 0,
            deferred: 0,
            failed: 0
        });
    }

    #[tokio::test]
    async fn mismatched_note_hash_is_dropped() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);
        harness.interpreter.register_contract(contract);

        // The log decrypts fine but the transaction's commitments do not
        // contain the derived hash (a spoofed log).
        let mut chain = TestChain::new();
        let note = Note::new(vec![Field::from_u64(42)]);
        let log = encrypt_note_log(&owner, contract, Field::from_u64(0), &note);
        chain.add_block_with_commitments(vec![Field::from_u64(999)], vec![log]);
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();

        assert_eq!(harness.db.notes(), vec![]);
        assert_eq!(processor.stats().failed, 1);
        // The cursor still advances; the note is gone for good.
        assert_eq!(processor.synced_to_block(), 1);
    }

    #[tokio::test]
    async fn storage_failure_leaves_the_cursor() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);
        harness.interpreter.register_contract(contract);

        let mut chain = TestChain::new();
        chain.add_note_block(owner, contract, &Note::new(vec![Field::from_u64(1)]));
        chain.publish(&harness.node);

        harness.db.fail_next_add_notes();
        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);

        let result = processor.process(&contexts, &logs).await;
        assert_matches!(result, Err(SyncError::Database(_)));
        assert_eq!(processor.synced_to_block(), 0);

        // The retry succeeds and the cursor advances.
        processor.process(&contexts, &logs).await.unwrap();
        assert_eq!(processor.synced_to_block(), 1);
        assert_eq!(harness.db.notes().len(), 1);
    }

    #[tokio::test]
    async fn partially_persisted_block_is_replayed_without_duplicates() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let known_contract = Address::from_u64(10);
        let unknown_contract = Address::from_u64(11);
        harness.interpreter.register_contract(known_contract);

        // One transaction emitting a decodable note and a deferrable one.
        let decodable = Note::new(vec![Field::from_u64(42)]);
        let deferrable = Note::new(vec![Field::from_u64(43)]);
        let note_hash =
            TestInterpreter::note_hash_for(known_contract, test_slot(), &decodable);
        let mut chain = TestChain::new();
        chain.add_block_with_commitments(
            vec![note_hash],
            vec![
                encrypt_note_log(&owner, known_contract, test_slot(), &decodable),
                encrypt_note_log(&owner, unknown_contract, test_slot(), &deferrable),
            ],
        );
        chain.publish(&harness.node);

        // The note write lands, the deferred-note write fails.
        harness.db.fail_next_add_deferred_notes();
        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);

        let result = processor.process(&contexts, &logs).await;
        assert_matches!(result, Err(SyncError::Database(_)));
        assert_eq!(processor.synced_to_block(), 0);
        assert_eq!(harness.db.notes().len(), 1);
        assert_eq!(harness.db.deferred_notes(), vec![]);

        // The replay re-submits the already persisted note; the store must
        // not grow a second row for it.
        processor.process(&contexts, &logs).await.unwrap();
        assert_eq!(processor.synced_to_block(), 1);
        assert_eq!(harness.db.notes().len(), 1);
        assert_eq!(harness.db.deferred_notes().len(), 1);
    }

    #[tokio::test]
    async fn non_contiguous_batch_is_rejected() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);

        let mut chain = TestChain::new();
        chain.add_empty_block();
        chain.add_empty_block();
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(2, 10);
        assert_matches!(
            processor.process(&contexts, &logs).await,
            Err(SyncError::Invariant(_))
        );
    }

    #[tokio::test]
    async fn deferred_notes_decode_once_contract_registers() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);

        let mut chain = TestChain::new();
        let note = Note::new(vec![Field::from_u64(42)]);
        chain.add_note_block(owner, contract, &note);
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();
        let deferred = harness.db.deferred_notes();
        assert_eq!(deferred.len(), 1);

        harness.interpreter.register_contract(contract);
        let decoded = processor.decode_deferred_notes(&deferred);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].note, note);
        assert_eq!(decoded[0].tx_hash, deferred[0].tx_hash);
        assert_eq!(decoded[0].leaf_index, u64::from(deferred[0].data_start_index));
    }

    #[tokio::test]
    async fn second_tx_notes_land_in_their_own_leaf_slots() {
        let harness = TestHarness::new();
        let (owner, _) = test_account(&harness, 1);
        let contract = Address::from_u64(10);
        harness.interpreter.register_contract(contract);

        let mut chain = TestChain::new();
        let note = Note::new(vec![Field::from_u64(7)]);
        chain.add_two_tx_block(owner, contract, &note);
        chain.publish(&harness.node);

        let mut processor = harness.processor(owner, 1);
        let (contexts, logs) = chain.batch(1, 10);
        processor.process(&contexts, &logs).await.unwrap();

        let notes = harness.db.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[0].leaf_index,
            contexts[0].first_note_hash_index() + MAX_NOTE_HASHES_PER_TX
        );
    }
}
