use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use veil_client_types::{
    Address, BlockHeader, CompleteAddress, DeferredNoteDao, Field, NoteDao, PublicKey,
    Serializable,
};

use super::{Database, DatabaseError};

// MEMORY STORE
// ================================================================================================

/// An in-memory [`Database`] implementation.
///
/// Suitable for tests and for embedders that do not need persistence across
/// restarts; everything is rescanned from the account starting blocks on the
/// next run.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    block: Option<(u64, BlockHeader)>,
    notes: Vec<NoteDao>,
    deferred: BTreeMap<Address, Vec<DeferredNoteDao>>,
    addresses: HashMap<Address, CompleteAddress>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a complete address. Returns `false` if the address was
    /// already known.
    pub fn register_address(&self, complete: CompleteAddress) -> bool {
        self.lock().addresses.insert(complete.address, complete).is_none()
    }

    /// Snapshot of all stored notes. Primarily for tests and diagnostics.
    pub fn notes(&self) -> Vec<NoteDao> {
        self.lock().notes.clone()
    }

    /// Snapshot of all deferred notes across contracts.
    pub fn deferred_notes(&self) -> Vec<DeferredNoteDao> {
        self.lock().deferred.values().flatten().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn get_block_number(&self) -> Result<Option<u64>, DatabaseError> {
        Ok(self.lock().block.map(|(number, _)| number))
    }

    async fn set_block_data(
        &self,
        block_number: u64,
        header: BlockHeader,
    ) -> Result<(), DatabaseError> {
        self.lock().block = Some((block_number, header));
        Ok(())
    }

    async fn add_notes(&self, notes: Vec<NoteDao>) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        for note in notes {
            // One row per (public_key, tx_hash, note_hash); replayed batches
            // are no-ops.
            let known = inner.notes.iter().any(|existing| {
                existing.public_key == note.public_key
                    && existing.tx_hash == note.tx_hash
                    && existing.note_hash == note.note_hash
            });
            if !known {
                inner.notes.push(note);
            }
        }
        Ok(())
    }

    async fn remove_nullified_notes(
        &self,
        nullifiers: &[Field],
        public_key: &PublicKey,
    ) -> Result<Vec<NoteDao>, DatabaseError> {
        let nullifiers: HashSet<&Field> = nullifiers.iter().collect();
        let mut inner = self.lock();
        let (removed, kept) = std::mem::take(&mut inner.notes).into_iter().partition(|note| {
            note.public_key == *public_key && nullifiers.contains(&note.siloed_nullifier)
        });
        inner.notes = kept;
        Ok(removed)
    }

    async fn add_deferred_notes(&self, notes: Vec<DeferredNoteDao>) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        for note in notes {
            inner.deferred.entry(note.contract_address).or_default().push(note);
        }
        Ok(())
    }

    async fn get_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError> {
        Ok(self.lock().deferred.get(&contract).cloned().unwrap_or_default())
    }

    async fn remove_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError> {
        Ok(self.lock().deferred.remove(&contract).unwrap_or_default())
    }

    async fn get_complete_address(
        &self,
        address: Address,
    ) -> Result<Option<CompleteAddress>, DatabaseError> {
        Ok(self.lock().addresses.get(&address).copied())
    }

    async fn estimate_size(&self) -> Result<u64, DatabaseError> {
        let inner = self.lock();
        let notes: usize = inner.notes.iter().map(|note| note.to_bytes().len()).sum();
        let deferred: usize = inner
            .deferred
            .values()
            .flatten()
            .map(|note| note.to_bytes().len())
            .sum();
        let header = inner.block.map_or(0, |(_, header)| header.to_bytes().len());
        Ok((notes + deferred + header) as u64)
    }
}
