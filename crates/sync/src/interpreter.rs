//! The contract-dispatch capability used to finish interpreting a decrypted
//! note.

use thiserror::Error;
use veil_client_types::{Address, Field, Note};

// INTERPRETER ERRORS
// ================================================================================================

#[derive(Debug, Error)]
pub enum InterpreterError {
    /// The contract is registered but rejected the note payload.
    #[error("contract {0} rejected note payload: {1}")]
    InvalidNotePayload(Address, String),
}

// NOTE HASH AND NULLIFIER
// ================================================================================================

/// The two commitments a contract derives from a note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteHashAndNullifier {
    /// Commitment inserted into the note-hash tree.
    pub note_hash: Field,
    /// The contract-siloed nullifier that will spend the note.
    pub siloed_nullifier: Field,
}

// CONTRACT INTERPRETER
// ================================================================================================

/// Runs a contract's note-hash/nullifier derivation for a decrypted note.
///
/// Dispatching into contract code is the registry's concern; this crate only
/// needs the derived commitments. Returns:
///
/// - `Ok(Some(_))` — the contract is known and derivation succeeded.
/// - `Ok(None)` — the contract's code is not registered locally. The caller
///   defers the note until the contract appears.
/// - `Err(_)` — the contract is known but the payload does not interpret as
///   one of its notes. The note is dropped.
pub trait ContractInterpreter: Send + Sync {
    fn compute_note_hash_and_nullifier(
        &self,
        contract: Address,
        storage_slot: Field,
        note: &Note,
    ) -> Result<Option<NoteHashAndNullifier>, InterpreterError>;
}
