//! Protocol constants the client relies on.

/// Number of the first L2 block ever produced. Block numbering starts at 1;
/// 0 is reserved for the pre-genesis state.
pub const INITIAL_L2_BLOCK_NUM: u64 = 1;

/// Maximum number of note hashes a single transaction may insert into the
/// note-hash tree. Each transaction is allotted exactly this many leaf slots,
/// so the leaf index of a note is derived from its transaction's position in
/// the block rather than from the actual number of notes emitted before it.
pub const MAX_NOTE_HASHES_PER_TX: u64 = 64;
