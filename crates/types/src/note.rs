use crate::field::{Address, Field, TxHash};
use crate::keys::PublicKey;
use crate::serialization::{
    read_vector, write_vector, ByteReader, Deserializable, DeserializationError, Serializable,
};

// NOTE
// ================================================================================================

/// The raw payload of a private note: an ordered list of field elements whose
/// meaning is defined by the emitting contract.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Note {
    items: Vec<Field>,
}

impl Note {
    pub fn new(items: Vec<Field>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Field] {
        &self.items
    }
}

impl Serializable for Note {
    fn write_into(&self, target: &mut Vec<u8>) {
        write_vector(&self.items, target);
    }
}

impl Deserializable for Note {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self { items: read_vector(source)? })
    }
}

// NOTE DAO
// ================================================================================================

/// A fully interpreted note owned by one of the client's accounts, as
/// persisted in storage.
///
/// A row is created only after the note's log decrypted successfully and the
/// owning contract placed its hash in the note-hash tree; it is deleted once
/// its siloed nullifier shows up on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteDao {
    /// Encryption public key of the owning account.
    pub public_key: PublicKey,
    /// Contract that emitted the note.
    pub contract_address: Address,
    /// Storage slot within the contract the note lives at.
    pub storage_slot: Field,
    /// Raw note payload.
    pub note: Note,
    /// Commitment inserted into the note-hash tree.
    pub note_hash: Field,
    /// The contract-siloed nullifier that spends this note.
    pub siloed_nullifier: Field,
    /// Transaction the note was emitted in.
    pub tx_hash: TxHash,
    /// Index of `note_hash` within the note-hash tree.
    pub leaf_index: u64,
}

impl Serializable for NoteDao {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.public_key.write_into(target);
        self.contract_address.write_into(target);
        self.storage_slot.write_into(target);
        self.note.write_into(target);
        self.note_hash.write_into(target);
        self.siloed_nullifier.write_into(target);
        self.tx_hash.write_into(target);
        self.leaf_index.write_into(target);
    }
}

impl Deserializable for NoteDao {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self {
            public_key: PublicKey::read_from(source)?,
            contract_address: Address::read_from(source)?,
            storage_slot: Field::read_from(source)?,
            note: Note::read_from(source)?,
            note_hash: Field::read_from(source)?,
            siloed_nullifier: Field::read_from(source)?,
            tx_hash: TxHash::read_from(source)?,
            leaf_index: u64::read_from(source)?,
        })
    }
}

// DEFERRED NOTE DAO
// ================================================================================================

/// A note that decrypted successfully but could not be interpreted because
/// the emitting contract's code is not registered locally yet.
///
/// Enough of the originating transaction is captured here to finish the job
/// once the contract registers: the transaction's note hashes (to locate the
/// leaf), its nullifier, and the index of the transaction's first leaf slot.
///
/// The serialized layout is
/// `public_key ‖ note ‖ contract_address ‖ storage_slot ‖ tx_hash ‖
/// tx_nullifier ‖ u32 count ‖ note hashes ‖ u32 data_start_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredNoteDao {
    /// Encryption public key of the owning account.
    pub public_key: PublicKey,
    /// Raw note payload.
    pub note: Note,
    /// Contract that emitted the note, not yet known locally.
    pub contract_address: Address,
    /// Storage slot within the contract the note lives at.
    pub storage_slot: Field,
    /// Transaction the note was emitted in.
    pub tx_hash: TxHash,
    /// The emitting transaction's nullifier.
    pub tx_nullifier: Field,
    /// All note hashes inserted by the emitting transaction.
    pub note_hashes: Vec<Field>,
    /// Index of the emitting transaction's first note-hash leaf slot.
    pub data_start_index: u32,
}

impl Serializable for DeferredNoteDao {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.public_key.write_into(target);
        self.note.write_into(target);
        self.contract_address.write_into(target);
        self.storage_slot.write_into(target);
        self.tx_hash.write_into(target);
        self.tx_nullifier.write_into(target);
        write_vector(&self.note_hashes, target);
        self.data_start_index.write_into(target);
    }
}

impl Deserializable for DeferredNoteDao {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self {
            public_key: PublicKey::read_from(source)?,
            note: Note::read_from(source)?,
            contract_address: Address::read_from(source)?,
            storage_slot: Field::read_from(source)?,
            tx_hash: TxHash::read_from(source)?,
            tx_nullifier: Field::read_from(source)?,
            note_hashes: read_vector(source)?,
            data_start_index: u32::read_from(source)?,
        })
    }
}
