use std::fmt;

use crate::serialization::{ByteReader, Deserializable, DeserializationError, Serializable};

// FIELD ELEMENT
// ================================================================================================

/// A field element in its canonical 32-byte big-endian representation.
///
/// The client never performs field arithmetic; elements are opaque values that
/// are compared, hashed, and moved between the node, the interpreter, and
/// storage. Ordering and hashing are defined over the byte representation.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field([u8; Field::SIZE]);

impl Field {
    /// Serialized size in bytes.
    pub const SIZE: usize = 32;

    pub const ZERO: Self = Self([0; Self::SIZE]);

    pub const fn new(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Embeds a `u64` into the low-order bytes of a field element.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0; Self::SIZE];
        bytes[Self::SIZE - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; Self::SIZE]
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serializable for Field {
    fn write_into(&self, target: &mut Vec<u8>) {
        target.extend_from_slice(&self.0);
    }
}

impl Deserializable for Field {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self(source.read_array()?))
    }
}

// ADDRESS
// ================================================================================================

/// An L2 address. Both accounts and contracts live in the same address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Field);

impl Address {
    pub const fn new(field: Field) -> Self {
        Self(field)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Field::from_u64(value))
    }

    pub fn as_field(&self) -> Field {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serializable for Address {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.0.write_into(target);
    }
}

impl Deserializable for Address {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self(Field::read_from(source)?))
    }
}

// TRANSACTION HASH
// ================================================================================================

/// Hash identifying an L2 transaction.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash(Field);

impl TxHash {
    pub const fn new(field: Field) -> Self {
        Self(field)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Field::from_u64(value))
    }

    pub fn as_field(&self) -> Field {
        self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serializable for TxHash {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.0.write_into(target);
    }
}

impl Deserializable for TxHash {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self(Field::read_from(source)?))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn from_u64_is_big_endian() {
        let field = Field::from_u64(0x0102);
        assert_eq!(field.as_bytes()[30..], [0x01, 0x02]);
        assert_eq!(field.as_bytes()[..30], [0; 30]);
    }

    #[test]
    fn display_is_prefixed_hex() {
        assert_eq!(
            Field::from_u64(0xff).to_string(),
            format!("0x{}{:02x}", "00".repeat(31), 0xff)
        );
    }

    #[test]
    fn field_round_trip() {
        let field = Field::new(rand::random());
        assert_eq!(Field::read_from_bytes(&field.to_bytes()).unwrap(), field);
    }
}
