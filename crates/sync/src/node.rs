//! The contract the synchronizer consumes from the remote node.

use async_trait::async_trait;
use thiserror::Error;
use veil_client_types::{BlockHeader, BlockLogs, Field, L2Block, LogKind, TreeId};

// SNAPSHOT TAG
// ================================================================================================

/// Identifies the world-state snapshot a tree query runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotTag {
    /// The node's latest committed state.
    Latest,
    /// The state as of the given block.
    Block(u64),
}

// NODE ERRORS
// ================================================================================================

#[derive(Debug, Error)]
pub enum NodeError {
    /// RPC timeout, connection reset, server-side failure. Transient: the
    /// caller is expected to retry the whole request later.
    #[error("node transport error: {0}")]
    Transport(String),
    /// The node answered but the payload does not satisfy its own contract.
    #[error("malformed node response: {0}")]
    MalformedResponse(String),
}

// NODE CLIENT
// ================================================================================================

/// Interface to the remote node's RPC surface.
///
/// Range queries (`get_blocks`, `get_logs`) return entries in ascending
/// block-number order covering a gap-free prefix of the requested range; they
/// may return fewer entries than requested, including none when the range is
/// beyond the chain tip.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Latest block height known to the node.
    async fn get_block_number(&self) -> Result<u64, NodeError>;

    /// Tree roots and global variables of the node's latest block.
    async fn get_block_header(&self) -> Result<BlockHeader, NodeError>;

    /// Blocks in `[from, from + limit)` that exist.
    async fn get_blocks(&self, from: u64, limit: usize) -> Result<Vec<L2Block>, NodeError>;

    /// Per-block log bundles for blocks in `[from, from + limit)`, aligned by
    /// block number.
    async fn get_logs(
        &self,
        from: u64,
        limit: usize,
        kind: LogKind,
    ) -> Result<Vec<BlockLogs>, NodeError>;

    /// Index of `leaf` in the given tree, if it has been inserted.
    async fn find_leaf_index(
        &self,
        snapshot: SnapshotTag,
        tree: TreeId,
        leaf: Field,
    ) -> Result<Option<u64>, NodeError>;
}
