// LOG KINDS
// ================================================================================================

/// The two log streams a block carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogKind {
    Encrypted,
    Unencrypted,
}

// LOG PAYLOADS
// ================================================================================================

/// An opaque log payload. For [`LogKind::Encrypted`] this is a ciphertext
/// addressed to a single recipient; the client learns nothing from it without
/// the matching secret key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogData {
    bytes: Vec<u8>,
}

impl LogData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The logs emitted by one transaction, in emission order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxLogs {
    pub logs: Vec<LogData>,
}

/// The logs of one block, grouped per transaction and aligned with the
/// block's transaction order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockLogs {
    pub txs: Vec<TxLogs>,
}

impl BlockLogs {
    /// An empty log bundle for a block with `tx_count` transactions.
    pub fn empty(tx_count: usize) -> Self {
        Self { txs: vec![TxLogs::default(); tx_count] }
    }
}
