//! Domain types shared by the Veil L2 client.
//!
//! Everything in this crate is plain data: field elements, addresses, block
//! and log shapes, and the note records the client persists. Binary
//! serialization is provided through the [`Serializable`] / [`Deserializable`]
//! traits and is the format used by the client's storage layer.

mod block;
mod constants;
mod field;
mod keys;
mod logs;
mod note;
mod serialization;

pub use block::{
    AppendOnlyTreeSnapshot, BlockHeader, L2Block, L2BlockContext, L2Tx, TreeId, TreeSnapshots,
};
pub use constants::{INITIAL_L2_BLOCK_NUM, MAX_NOTE_HASHES_PER_TX};
pub use field::{Address, Field, TxHash};
pub use keys::{CompleteAddress, PartialAddress, PublicKey, SecretKey};
pub use logs::{BlockLogs, LogData, LogKind, TxLogs};
pub use note::{DeferredNoteDao, Note, NoteDao};
pub use serialization::{ByteReader, Deserializable, DeserializationError, Serializable};
