use thiserror::Error;
use veil_client_types::Address;

use crate::interpreter::InterpreterError;
use crate::keystore::KeyStoreError;
use crate::node::NodeError;
use crate::store::DatabaseError;

// SYNC ERRORS
// ================================================================================================

/// Errors surfaced by the synchronizer and its note processors.
///
/// Node and malformed-batch failures are transient: the tick that hit them
/// gives up on the current batch and the next tick retries from the same
/// cursor. Database errors abort the running task but leave the queue and the
/// cursors intact. Invariant violations indicate a bug and are never retried
/// with different inputs.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("node request failed")]
    Node(#[from] NodeError),
    #[error("database operation failed")]
    Database(#[from] DatabaseError),
    #[error("key store lookup failed")]
    KeyStore(#[from] KeyStoreError),
    #[error("note interpretation failed")]
    Interpreter(#[from] InterpreterError),
    #[error("malformed block batch: {0}")]
    MalformedBatch(String),
    #[error("account {0} is not registered with this client")]
    UnregisteredAccount(Address),
    #[error("account {0} is registered as a recipient only and is not being synchronized")]
    RecipientOnlyAccount(Address),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error("serial queue is closed")]
    QueueClosed,
}
