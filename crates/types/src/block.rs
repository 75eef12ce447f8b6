use crate::constants::MAX_NOTE_HASHES_PER_TX;
use crate::field::{Field, TxHash};
use crate::serialization::{ByteReader, Deserializable, DeserializationError, Serializable};

// TREE IDENTIFIERS
// ================================================================================================

/// The world-state trees maintained by the rollup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TreeId {
    NoteHash,
    Nullifier,
    Contract,
    L1ToL2Message,
    PublicData,
    Archive,
}

// TREE SNAPSHOTS
// ================================================================================================

/// The root of an append-only merkle tree together with the index at which the
/// next leaf will be inserted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendOnlyTreeSnapshot {
    pub root: Field,
    pub next_available_leaf_index: u64,
}

impl Serializable for AppendOnlyTreeSnapshot {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.root.write_into(target);
        self.next_available_leaf_index.write_into(target);
    }
}

impl Deserializable for AppendOnlyTreeSnapshot {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self {
            root: Field::read_from(source)?,
            next_available_leaf_index: u64::read_from(source)?,
        })
    }
}

/// One snapshot per world-state tree, as carried by a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeSnapshots {
    pub note_hash_tree: AppendOnlyTreeSnapshot,
    pub nullifier_tree: AppendOnlyTreeSnapshot,
    pub contract_tree: AppendOnlyTreeSnapshot,
    pub l1_to_l2_message_tree: AppendOnlyTreeSnapshot,
    pub public_data_tree: AppendOnlyTreeSnapshot,
    pub archive_tree: AppendOnlyTreeSnapshot,
}

// BLOCK HEADER
// ================================================================================================

/// The per-block state the client mirrors locally: the roots of the six
/// world-state trees plus the hash of the block's global variables.
///
/// Downstream query and simulation components read this row to build proofs
/// and execution contexts against a consistent snapshot of the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_number: u64,
    pub note_hash_tree_root: Field,
    pub nullifier_tree_root: Field,
    pub contract_tree_root: Field,
    pub l1_to_l2_message_tree_root: Field,
    pub public_data_tree_root: Field,
    pub archive_tree_root: Field,
    pub global_variables_hash: Field,
}

impl Serializable for BlockHeader {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.block_number.write_into(target);
        self.note_hash_tree_root.write_into(target);
        self.nullifier_tree_root.write_into(target);
        self.contract_tree_root.write_into(target);
        self.l1_to_l2_message_tree_root.write_into(target);
        self.public_data_tree_root.write_into(target);
        self.archive_tree_root.write_into(target);
        self.global_variables_hash.write_into(target);
    }
}

impl Deserializable for BlockHeader {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self {
            block_number: u64::read_from(source)?,
            note_hash_tree_root: Field::read_from(source)?,
            nullifier_tree_root: Field::read_from(source)?,
            contract_tree_root: Field::read_from(source)?,
            l1_to_l2_message_tree_root: Field::read_from(source)?,
            public_data_tree_root: Field::read_from(source)?,
            archive_tree_root: Field::read_from(source)?,
            global_variables_hash: Field::read_from(source)?,
        })
    }
}

// L2 TRANSACTION
// ================================================================================================

/// The per-transaction effects the client cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct L2Tx {
    pub hash: TxHash,
    /// Note hashes inserted by this transaction, in insertion order.
    pub note_hashes: Vec<Field>,
    /// Nullifiers emitted by this transaction. The first entry doubles as the
    /// transaction nullifier.
    pub nullifiers: Vec<Field>,
}

impl L2Tx {
    /// The transaction nullifier, or zero for a transaction that emitted none.
    pub fn tx_nullifier(&self) -> Field {
        self.nullifiers.first().copied().unwrap_or(Field::ZERO)
    }
}

// L2 BLOCK
// ================================================================================================

/// An L2 block as returned by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2Block {
    pub number: u64,
    pub global_variables_hash: Field,
    /// World-state snapshots before any of this block's effects were applied.
    pub start: TreeSnapshots,
    /// World-state snapshots after all of this block's effects were applied.
    pub end: TreeSnapshots,
    pub txs: Vec<L2Tx>,
}

impl L2Block {
    /// Derives the header this block commits the chain to.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            block_number: self.number,
            note_hash_tree_root: self.end.note_hash_tree.root,
            nullifier_tree_root: self.end.nullifier_tree.root,
            contract_tree_root: self.end.contract_tree.root,
            l1_to_l2_message_tree_root: self.end.l1_to_l2_message_tree.root,
            public_data_tree_root: self.end.public_data_tree.root,
            archive_tree_root: self.end.archive_tree.root,
            global_variables_hash: self.global_variables_hash,
        }
    }
}

// L2 BLOCK CONTEXT
// ================================================================================================

/// A block paired with the note-hash tree geometry needed to place its notes.
///
/// Constructed per batch while scanning; not persisted.
#[derive(Clone, Debug)]
pub struct L2BlockContext {
    block: L2Block,
}

impl L2BlockContext {
    pub fn new(block: L2Block) -> Self {
        Self { block }
    }

    pub fn block(&self) -> &L2Block {
        &self.block
    }

    pub fn block_number(&self) -> u64 {
        self.block.number
    }

    /// Index of the first note-hash leaf belonging to this block.
    pub fn first_note_hash_index(&self) -> u64 {
        self.block.start.note_hash_tree.next_available_leaf_index
    }

    /// Index of the first note-hash leaf belonging to the transaction at
    /// `tx_index`. Every transaction occupies a fixed-size slice of the tree.
    pub fn tx_note_hash_start_index(&self, tx_index: usize) -> u64 {
        self.first_note_hash_index() + tx_index as u64 * MAX_NOTE_HASHES_PER_TX
    }
}
