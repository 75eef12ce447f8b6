//! The contract the synchronizer consumes from the client's storage layer.

use async_trait::async_trait;
use thiserror::Error;
use veil_client_types::{
    Address, BlockHeader, CompleteAddress, DeferredNoteDao, DeserializationError, Field, NoteDao,
    PublicKey,
};

mod memory;

pub use memory::MemoryStore;

// DATABASE ERRORS
// ================================================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record failed to deserialize")]
    Deserialization(#[from] DeserializationError),
}

// DATABASE
// ================================================================================================

/// Durable storage for the synchronizer: the mirrored block header, decoded
/// and deferred notes, and the registry of known addresses.
///
/// Every operation is atomic on its own. Callers are responsible for mutual
/// exclusion across operations — in this client all writers go through the
/// same [`SerialQueue`](crate::SerialQueue).
#[async_trait]
pub trait Database: Send + Sync {
    /// Block number of the stored header, or `None` before the first
    /// [`Database::set_block_data`] call.
    async fn get_block_number(&self) -> Result<Option<u64>, DatabaseError>;

    /// Replaces the mirrored block header.
    async fn set_block_data(
        &self,
        block_number: u64,
        header: BlockHeader,
    ) -> Result<(), DatabaseError>;

    /// Inserts decoded notes.
    ///
    /// Implementations must keep at most one row per
    /// `(public_key, tx_hash, note_hash)` and silently ignore re-insertions.
    /// A block whose persistence was cut short mid-way is replayed wholesale
    /// on the next tick, and the replay must not mint duplicate rows.
    async fn add_notes(&self, notes: Vec<NoteDao>) -> Result<(), DatabaseError>;

    /// Removes and returns the notes of `public_key` whose siloed nullifier
    /// is in `nullifiers`.
    async fn remove_nullified_notes(
        &self,
        nullifiers: &[Field],
        public_key: &PublicKey,
    ) -> Result<Vec<NoteDao>, DatabaseError>;

    /// Inserts notes whose contracts are not known locally yet.
    async fn add_deferred_notes(&self, notes: Vec<DeferredNoteDao>) -> Result<(), DatabaseError>;

    /// Deferred notes emitted by `contract`, in insertion order.
    async fn get_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError>;

    /// Removes and returns all deferred notes emitted by `contract`.
    async fn remove_deferred_notes_by_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<DeferredNoteDao>, DatabaseError>;

    /// The registered [`CompleteAddress`] for `address`, if any. Covers both
    /// the client's own accounts and recipient-only registrations.
    async fn get_complete_address(
        &self,
        address: Address,
    ) -> Result<Option<CompleteAddress>, DatabaseError>;

    /// Rough size of the stored data in bytes. Observability only.
    async fn estimate_size(&self) -> Result<u64, DatabaseError>;
}
