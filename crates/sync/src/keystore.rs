//! Account secrets and the note-decryption capability.

use thiserror::Error;
use veil_client_types::{Address, Field, LogData, Note, PublicKey, SecretKey};

// KEY STORE
// ================================================================================================

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no secret key registered for account {0}")]
    AccountNotFound(PublicKey),
}

/// Holds the decryption secrets of the client's accounts.
pub trait KeyStore: Send + Sync {
    /// The decryption secret of `account`.
    fn secret_key(&self, account: &PublicKey) -> Result<SecretKey, KeyStoreError>;
}

// NOTE DECRYPTOR
// ================================================================================================

/// The plaintext recovered from an encrypted log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedNote {
    pub contract_address: Address,
    pub storage_slot: Field,
    pub note: Note,
}

/// Decrypts encrypted log payloads.
///
/// The cryptographic scheme is not this crate's concern; implementations are
/// injected by the embedder. `None` covers both "not addressed to this
/// account" and "garbled payload" — the two are indistinguishable by design.
pub trait NoteDecryptor: Send + Sync {
    fn decrypt_note(&self, log: &LogData, secret: &SecretKey) -> Option<DecryptedNote>;
}
