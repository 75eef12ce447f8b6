use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use veil_client_types::{
    Address, BlockLogs, DeferredNoteDao, Field, L2Block, L2BlockContext, LogKind, NoteDao,
    PublicKey, TreeId, TxHash, INITIAL_L2_BLOCK_NUM,
};

use crate::interpreter::ContractInterpreter;
use crate::keystore::{KeyStore, NoteDecryptor};
use crate::node::{NodeClient, SnapshotTag};
use crate::processor::{NoteProcessor, NoteProcessorStats};
use crate::serial_queue::SerialQueue;
use crate::store::Database;
use crate::ticker::PeriodicTicker;
use crate::{SyncError, COMPONENT};

// SYNC CONFIG
// ================================================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Maximum number of blocks fetched and processed per work iteration.
    pub block_batch_size: usize,
    /// How long to sleep between ticks once no further progress can be made.
    pub retry_interval: Duration,
    /// Label distinguishing this synchronizer's logs in multi-instance
    /// deployments.
    pub instance: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_batch_size: 1,
            retry_interval: Duration::from_millis(1000),
            instance: None,
        }
    }
}

// SYNC STATUS
// ================================================================================================

/// Snapshot of how far synchronization has progressed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// The global cursor: highest block whose header is mirrored locally.
    pub blocks: u64,
    /// Per-account cursor, keyed by the account's public key string.
    pub notes: BTreeMap<String, u64>,
}

// SYNC EVENTS
// ================================================================================================

/// Events published on the synchronizer's broadcast channel.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A late-registered account finished scanning up to the global cursor
    /// and joined the active set.
    NoteProcessorCaughtUp {
        public_key: PublicKey,
        /// Time from the account's registration to catch-up completion.
        duration: Duration,
        /// Database size estimate at the time of the event.
        db_size_bytes: u64,
        stats: NoteProcessorStats,
    },
}

// PROCESSOR REGISTRY
// ================================================================================================

#[derive(Clone)]
struct ProcessorHandle {
    public_key: PublicKey,
    processor: Arc<AsyncMutex<NoteProcessor>>,
}

/// Mutable synchronizer state. Guarded by a single mutex; lock scopes never
/// span an await point.
struct SyncState {
    /// Processors that advance in lockstep with the global cursor, in
    /// registration order.
    active: Vec<ProcessorHandle>,
    /// Processors still replaying history. Drained from the head, one at a
    /// time.
    catching_up: Vec<ProcessorHandle>,
    /// The node's chain tip at startup. Blocks before it are not mirrored
    /// into the local header row; per-account scans still cover them.
    initial_sync_block_number: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            active: Vec::new(),
            catching_up: Vec::new(),
            initial_sync_block_number: INITIAL_L2_BLOCK_NUM - 1,
        }
    }
}

// SYNCHRONIZER
// ================================================================================================

/// The client's background block scanner.
///
/// Once started, the synchronizer ticks forever: each tick fetches blocks and
/// encrypted logs past the global cursor, feeds them to every registered
/// account's [`NoteProcessor`], and mirrors the newest block header into the
/// database. Accounts registered after the fact are caught up from their own
/// starting block before forward progress resumes, so notes are always
/// discovered in block order per account.
///
/// Every database-touching step runs as a task on the shared [`SerialQueue`];
/// the tick loop submits one queue task per iteration, which lets foreground
/// work (queries, simulations) interleave between iterations of a long
/// catch-up.
pub struct Synchronizer {
    inner: Arc<Inner>,
    queue: Arc<SerialQueue>,
    config: SyncConfig,
    ticker: StdMutex<Option<PeriodicTicker>>,
}

struct Inner {
    node: Arc<dyn NodeClient>,
    db: Arc<dyn Database>,
    decryptor: Arc<dyn NoteDecryptor>,
    interpreter: Arc<dyn ContractInterpreter>,
    state: StdMutex<SyncState>,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    label: String,
}

impl Synchronizer {
    /// Number of events the broadcast channel buffers per subscriber.
    const EVENT_CHANNEL_SIZE: usize = 128;

    pub fn new(
        node: Arc<dyn NodeClient>,
        db: Arc<dyn Database>,
        decryptor: Arc<dyn NoteDecryptor>,
        interpreter: Arc<dyn ContractInterpreter>,
        queue: Arc<SerialQueue>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CHANNEL_SIZE);
        let label = config.instance.clone().unwrap_or_else(|| "synchronizer".to_string());
        Self {
            inner: Arc::new(Inner {
                node,
                db,
                decryptor,
                interpreter,
                state: StdMutex::new(SyncState::default()),
                running: AtomicBool::new(false),
                events,
                label,
            }),
            queue,
            config,
            ticker: StdMutex::new(None),
        }
    }

    /// Receiver for [`SyncEvent`]s. Events published while no receiver
    /// listens are dropped.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the synchronizer: performs the initial header sync, then kicks
    /// off the tick loop. Calling `start` on a running synchronizer is a
    /// no-op.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(target: COMPONENT, instance = %self.inner.label, "synchronizer already running");
            return Ok(());
        }

        let inner = self.inner.clone();
        let result = self
            .queue
            .put(move || async move { inner.initial_sync().await })
            .await
            .and_then(std::convert::identity);
        if let Err(err) = result {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let inner = self.inner.clone();
        let queue = self.queue.clone();
        let limit = self.config.block_batch_size;
        let mut ticker = PeriodicTicker::new(self.config.retry_interval);
        ticker.start(move || {
            let inner = inner.clone();
            let queue = queue.clone();
            async move { inner.sync(queue, limit).await }
        });
        *self.ticker.lock().expect("synchronizer ticker mutex poisoned") = Some(ticker);

        info!(target: COMPONENT, instance = %self.inner.label, "synchronizer started");
        Ok(())
    }

    /// Stops the tick loop and drains the serial queue. An in-flight batch is
    /// not cancelled; `stop` waits for it to finish.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let ticker = self.ticker.lock().expect("synchronizer ticker mutex poisoned").take();
        if let Some(mut ticker) = ticker {
            ticker.stop().await;
        }
        self.queue.end().await;
        info!(target: COMPONENT, instance = %self.inner.label, "synchronizer stopped");
    }

    /// Registers an account for synchronization, starting its scan at
    /// `starting_block`. The account begins in catch-up mode and joins the
    /// active set once it reaches the global cursor. Registering an already
    /// known account is a no-op.
    pub fn add_account(
        &self,
        public_key: PublicKey,
        key_store: Arc<dyn KeyStore>,
        starting_block: u64,
    ) {
        let mut state = self.inner.state();
        let known = state
            .active
            .iter()
            .chain(state.catching_up.iter())
            .any(|handle| handle.public_key == public_key);
        if known {
            debug!(target: COMPONENT, account = %public_key, "account already registered");
            return;
        }

        let processor = NoteProcessor::new(
            public_key,
            key_store,
            self.inner.decryptor.clone(),
            self.inner.interpreter.clone(),
            self.inner.db.clone(),
            self.inner.node.clone(),
            starting_block,
        );
        state.catching_up.push(ProcessorHandle {
            public_key,
            processor: Arc::new(AsyncMutex::new(processor)),
        });
        info!(
            target: COMPONENT,
            account = %public_key,
            starting_block,
            "account registered for synchronization"
        );
    }

    /// Re-drives every deferred note of `contract` now that its code is
    /// available: decodes them through the active processors, replaces the
    /// deferred rows with proper notes, and scrubs any note that was spent
    /// while it sat deferred.
    pub async fn reprocess_deferred_notes_for_contract(
        &self,
        contract: Address,
    ) -> Result<(), SyncError> {
        let inner = self.inner.clone();
        self.queue
            .put(move || async move { inner.reprocess_deferred_notes_for_contract(contract).await })
            .await
            .and_then(std::convert::identity)
    }

    /// The global and per-account cursors.
    pub async fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let (initial, handles) = {
            let state = self.inner.state();
            let handles: Vec<ProcessorHandle> =
                state.active.iter().chain(state.catching_up.iter()).cloned().collect();
            (state.initial_sync_block_number, handles)
        };

        let blocks = self.inner.db.get_block_number().await?.unwrap_or(initial);
        let mut notes = BTreeMap::new();
        for handle in handles {
            let synced_to = handle.processor.lock().await.synced_to_block();
            notes.insert(handle.public_key.to_string(), synced_to);
        }
        Ok(SyncStatus { blocks, notes })
    }

    /// Whether the mirrored block header has reached the node's chain tip.
    pub async fn is_global_state_synchronized(&self) -> Result<bool, SyncError> {
        let latest = self.inner.node.get_block_number().await?;
        let initial = self.inner.state().initial_sync_block_number;
        let local = self.inner.db.get_block_number().await?.unwrap_or(initial);
        Ok(local >= latest)
    }

    /// Whether the given account's note scan has reached the node's chain
    /// tip.
    ///
    /// Fails with [`SyncError::UnregisteredAccount`] for an address the
    /// client knows nothing about, and with
    /// [`SyncError::RecipientOnlyAccount`] for an address that is registered
    /// as a recipient but has no processor of its own.
    pub async fn is_account_state_synchronized(
        &self,
        account: Address,
    ) -> Result<bool, SyncError> {
        let complete = self
            .inner
            .db
            .get_complete_address(account)
            .await?
            .ok_or(SyncError::UnregisteredAccount(account))?;

        let handle = {
            let state = self.inner.state();
            state
                .active
                .iter()
                .chain(state.catching_up.iter())
                .find(|handle| handle.public_key == complete.public_key)
                .cloned()
        };
        let handle = handle.ok_or(SyncError::RecipientOnlyAccount(account))?;

        let processor = handle.processor.lock().await;
        processor.is_synchronized().await
    }
}

// TICK LOOP
// ================================================================================================

impl Inner {
    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("synchronizer state mutex poisoned")
    }

    /// Fast-forwards the mirrored header to the node's chain tip so that
    /// downstream consumers see a current view immediately. Historical blocks
    /// are not replayed for the global state; per-account catch-up still
    /// scans them for notes.
    async fn initial_sync(&self) -> Result<(), SyncError> {
        let block_number = self.node.get_block_number().await?;
        let header = self.node.get_block_header().await?;
        self.db.set_block_data(block_number, header).await?;
        self.state().initial_sync_block_number = block_number;
        info!(target: COMPONENT, instance = %self.label, block_number, "initial sync complete");
        Ok(())
    }

    /// One tick: keeps submitting work iterations to the queue while they
    /// report progress. Catch-up work is strictly prioritized so a late
    /// account cannot observe blocks out of order; forward ingestion is
    /// paused until the catch-up list is empty.
    ///
    /// Each iteration is its own queue task, so foreground database users get
    /// a chance to run between iterations.
    async fn sync(self: Arc<Self>, queue: Arc<SerialQueue>, limit: usize) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let catching_up = !self.state().catching_up.is_empty();
            let inner = self.clone();
            let result = if catching_up {
                queue
                    .put(move || async move { inner.work_note_processor_catch_up(limit).await })
                    .await
            } else {
                queue.put(move || async move { inner.work(limit).await }).await
            };

            let more_work = match result {
                Ok(Ok(more_work)) => more_work,
                Ok(Err(err)) => {
                    match &err {
                        SyncError::Node(_) | SyncError::MalformedBatch(_) => {
                            warn!(
                                target: COMPONENT,
                                instance = %self.label,
                                err = ?err,
                                "transient sync failure, retrying next tick"
                            );
                        },
                        _ => {
                            error!(
                                target: COMPONENT,
                                instance = %self.label,
                                err = ?err,
                                "sync iteration failed"
                            );
                        },
                    }
                    false
                },
                // The queue is gone; the client is shutting down.
                Err(_) => false,
            };

            if !more_work {
                break;
            }
        }
    }

    /// Forward mode: ingest the next batch of blocks past the global cursor.
    ///
    /// Returns `false` once the node has nothing further to offer.
    async fn work(&self, limit: usize) -> Result<bool, SyncError> {
        let initial = self.state().initial_sync_block_number;
        let from = self.db.get_block_number().await?.unwrap_or(initial) + 1;

        let encrypted_logs = self.node.get_logs(from, limit, LogKind::Encrypted).await?;
        if encrypted_logs.is_empty() {
            return Ok(false);
        }
        // The unencrypted stream is fetched to confirm the node holds a
        // complete bundle for the range; its contents are not consumed here.
        let mut unencrypted_logs = self.node.get_logs(from, limit, LogKind::Unencrypted).await?;
        if unencrypted_logs.is_empty() {
            return Ok(false);
        }

        let blocks = self.node.get_blocks(from, encrypted_logs.len()).await?;
        if blocks.is_empty() {
            return Ok(false);
        }
        unencrypted_logs.truncate(blocks.len());

        // A block below the cursor would be double-processed; drop any such
        // stragglers together with their log bundles.
        let paired: Vec<(L2Block, BlockLogs)> = blocks
            .into_iter()
            .zip(encrypted_logs)
            .filter(|(block, _)| block.number >= from)
            .collect();
        if paired.is_empty() {
            warn!(target: COMPONENT, from, "node returned only stale blocks");
            return Ok(false);
        }
        let (blocks, encrypted_logs): (Vec<L2Block>, Vec<BlockLogs>) =
            paired.into_iter().unzip();
        let block_contexts: Vec<L2BlockContext> =
            blocks.into_iter().map(L2BlockContext::new).collect();

        let last = block_contexts.last().expect("batch is non-empty").block();
        if last.number >= initial {
            self.db.set_block_data(last.number, last.header()).await?;
        }

        // Feed active processors in registration order. A processor that fell
        // behind the global cursor (its last batch was cut short by a storage
        // failure) is demoted to catch-up instead of being handed a gapped
        // batch.
        let handles: Vec<ProcessorHandle> = self.state().active.clone();
        for handle in handles {
            let mut processor = handle.processor.lock().await;
            if processor.synced_to_block() + 1 != from {
                warn!(
                    target: COMPONENT,
                    account = %handle.public_key,
                    synced_to = processor.synced_to_block(),
                    from,
                    "processor fell behind the global cursor, demoting to catch-up"
                );
                drop(processor);
                self.demote_to_catch_up(&handle);
                continue;
            }
            processor.process(&block_contexts, &encrypted_logs).await?;
        }

        debug!(target: COMPONENT, from, blocks = block_contexts.len(), "processed forward batch");
        Ok(true)
    }

    /// Catch-up mode: advance the head of the catch-up list towards the
    /// global cursor, promoting it to the active set once it arrives.
    ///
    /// Only blocks up to the global cursor are fetched — catch-up never
    /// advances the mirrored header.
    async fn work_note_processor_catch_up(&self, limit: usize) -> Result<bool, SyncError> {
        let (initial, handle) = {
            let state = self.state();
            (state.initial_sync_block_number, state.catching_up.first().cloned())
        };
        // The list can drain between scheduling and execution.
        let Some(handle) = handle else {
            return Ok(false);
        };

        let to = self.db.get_block_number().await?.unwrap_or(initial);
        let synced_to = handle.processor.lock().await.synced_to_block();
        if synced_to >= to {
            self.promote_to_active(&handle).await;
            return Ok(true);
        }

        let from = synced_to + 1;
        let window = (to - from + 1) as usize;
        let limit = limit.min(window);
        if limit < 1 {
            return Err(SyncError::Invariant(format!(
                "empty catch-up window: from {from} to {to}"
            )));
        }

        // The requested range is behind the global cursor, so the node has
        // already served it once; empty fetches are a node-side hiccup and
        // worth retrying.
        let encrypted_logs = self.node.get_logs(from, limit, LogKind::Encrypted).await?;
        if encrypted_logs.is_empty() {
            return Err(SyncError::MalformedBatch(format!(
                "no encrypted logs for catch-up range starting at {from}"
            )));
        }
        let blocks = self.node.get_blocks(from, encrypted_logs.len()).await?;
        if blocks.is_empty() {
            return Err(SyncError::MalformedBatch(format!(
                "no blocks for catch-up range starting at {from}"
            )));
        }

        let paired: Vec<(L2Block, BlockLogs)> = blocks
            .into_iter()
            .zip(encrypted_logs)
            .filter(|(block, _)| block.number >= from)
            .collect();
        if paired.is_empty() {
            return Err(SyncError::MalformedBatch(format!(
                "only stale blocks for catch-up range starting at {from}"
            )));
        }
        let (blocks, encrypted_logs): (Vec<L2Block>, Vec<BlockLogs>) =
            paired.into_iter().unzip();
        let block_contexts: Vec<L2BlockContext> =
            blocks.into_iter().map(L2BlockContext::new).collect();

        let mut processor = handle.processor.lock().await;
        processor.process(&block_contexts, &encrypted_logs).await?;
        let synced_to = processor.synced_to_block();
        drop(processor);

        debug!(
            target: COMPONENT,
            account = %handle.public_key,
            synced_to,
            to,
            "processed catch-up batch"
        );
        if synced_to == to {
            self.promote_to_active(&handle).await;
        }
        Ok(true)
    }

    async fn reprocess_deferred_notes_for_contract(
        &self,
        contract: Address,
    ) -> Result<(), SyncError> {
        let deferred = self.db.get_deferred_notes_by_contract(contract).await?;
        if deferred.is_empty() {
            debug!(target: COMPONENT, %contract, "no deferred notes for contract");
            return Ok(());
        }

        // Group by originating transaction so each processor decodes one
        // per-tx context, in discovery order.
        let mut by_tx: IndexMap<TxHash, Vec<DeferredNoteDao>> = IndexMap::new();
        for note in deferred {
            by_tx.entry(note.tx_hash).or_default().push(note);
        }

        let handles: Vec<ProcessorHandle> = self.state().active.clone();

        let mut new_notes: Vec<NoteDao> = Vec::new();
        for group in by_tx.values() {
            for handle in &handles {
                let for_account: Vec<DeferredNoteDao> = group
                    .iter()
                    .filter(|note| note.public_key == handle.public_key)
                    .cloned()
                    .collect();
                if for_account.is_empty() {
                    continue;
                }
                let mut processor = handle.processor.lock().await;
                new_notes.extend(processor.decode_deferred_notes(&for_account));
            }
        }

        self.db.remove_deferred_notes_by_contract(contract).await?;
        let decoded = new_notes.len();
        self.db.add_notes(new_notes.clone()).await?;

        // A note may have been spent while it sat deferred; scrub anything
        // whose nullifier is already on chain.
        let mut by_account: IndexMap<PublicKey, Vec<Field>> = IndexMap::new();
        for note in &new_notes {
            by_account.entry(note.public_key).or_default().push(note.siloed_nullifier);
        }
        for (public_key, nullifiers) in by_account {
            let mut relevant = Vec::new();
            for nullifier in nullifiers {
                let found = self
                    .node
                    .find_leaf_index(SnapshotTag::Latest, TreeId::Nullifier, nullifier)
                    .await?;
                if found.is_some() {
                    relevant.push(nullifier);
                }
            }
            if relevant.is_empty() {
                continue;
            }
            let removed = self.db.remove_nullified_notes(&relevant, &public_key).await?;
            debug!(
                target: COMPONENT,
                account = %public_key,
                removed = removed.len(),
                "removed nullified notes after deferred decode"
            );
        }

        info!(target: COMPONENT, %contract, decoded, "reprocessed deferred notes for contract");
        Ok(())
    }

    fn demote_to_catch_up(&self, handle: &ProcessorHandle) {
        let mut state = self.state();
        if let Some(position) =
            state.active.iter().position(|other| other.public_key == handle.public_key)
        {
            let handle = state.active.remove(position);
            state.catching_up.push(handle);
        }
    }

    async fn promote_to_active(&self, handle: &ProcessorHandle) {
        {
            let mut state = self.state();
            let Some(position) = state
                .catching_up
                .iter()
                .position(|other| other.public_key == handle.public_key)
            else {
                return;
            };
            let handle = state.catching_up.remove(position);
            state.active.push(handle);
        }

        let (stats, duration) = {
            let processor = handle.processor.lock().await;
            (processor.stats(), processor.elapsed())
        };
        let db_size_bytes = match self.db.estimate_size().await {
            Ok(size) => size,
            Err(err) => {
                debug!(target: COMPONENT, err = ?err, "database size estimate failed");
                0
            },
        };

        info!(
            target: COMPONENT,
            instance = %self.label,
            account = %handle.public_key,
            duration_ms = duration.as_millis() as u64,
            db_size_bytes,
            seen = stats.seen,
            decrypted = stats.decrypted,
            deferred = stats.deferred,
            failed = stats.failed,
            "note processor caught up"
        );
        let _ = self.events.send(SyncEvent::NoteProcessorCaughtUp {
            public_key: handle.public_key,
            duration,
            db_size_bytes,
            stats,
        });
    }
}
