use thiserror::Error;

// ERRORS
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeserializationError {
    #[error("unexpected end of input: {needed} more bytes required")]
    UnexpectedEnd { needed: usize },
    #[error("{left_over} bytes left over after deserialization")]
    TrailingBytes { left_over: usize },
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

// SERIALIZATION TRAITS
// ================================================================================================

/// A type with a canonical binary representation.
///
/// The format is the concatenation of big-endian fixed-width values; variable
/// length sequences are written as a big-endian `u32` count followed by the
/// elements.
pub trait Serializable {
    /// Appends the binary representation of `self` to `target`.
    fn write_into(&self, target: &mut Vec<u8>);

    /// Returns the binary representation of `self` as an owned buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.write_into(&mut buffer);
        buffer
    }
}

/// The inverse of [`Serializable`].
pub trait Deserializable: Sized {
    /// Reads one value from the front of `source`, advancing it.
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError>;

    /// Deserializes a value from `bytes`, requiring that all bytes are
    /// consumed.
    fn read_from_bytes(bytes: &[u8]) -> Result<Self, DeserializationError> {
        let mut reader = ByteReader::new(bytes);
        let value = Self::read_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

// BYTE READER
// ================================================================================================

/// A cursor over a byte slice used by [`Deserializable`] implementations.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    /// Consumes and returns the next `N` bytes.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DeserializationError> {
        if self.bytes.len() < N {
            return Err(DeserializationError::UnexpectedEnd { needed: N - self.bytes.len() });
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        Ok(head.try_into().expect("split yields exactly N bytes"))
    }

    pub fn read_u32(&mut self) -> Result<u32, DeserializationError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DeserializationError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Asserts that the input has been fully consumed.
    pub fn finish(self) -> Result<(), DeserializationError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(DeserializationError::TrailingBytes { left_over: self.bytes.len() })
        }
    }
}

// PRIMITIVE IMPLS
// ================================================================================================

impl Serializable for u32 {
    fn write_into(&self, target: &mut Vec<u8>) {
        target.extend_from_slice(&self.to_be_bytes());
    }
}

impl Deserializable for u32 {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        source.read_u32()
    }
}

impl Serializable for u64 {
    fn write_into(&self, target: &mut Vec<u8>) {
        target.extend_from_slice(&self.to_be_bytes());
    }
}

impl Deserializable for u64 {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        source.read_u64()
    }
}

// VECTOR HELPERS
// ================================================================================================

/// Writes `items` as a `u32` count followed by each element.
pub(crate) fn write_vector<T: Serializable>(items: &[T], target: &mut Vec<u8>) {
    let len = u32::try_from(items.len()).expect("sequence length exceeds u32::MAX");
    len.write_into(target);
    for item in items {
        item.write_into(target);
    }
}

/// Reads a `u32`-prefixed sequence written by [`write_vector`].
pub(crate) fn read_vector<T: Deserializable>(
    source: &mut ByteReader<'_>,
) -> Result<Vec<T>, DeserializationError> {
    let len = source.read_u32()? as usize;
    let mut items = Vec::new();
    for _ in 0..len {
        items.push(T::read_from(source)?);
    }
    Ok(items)
}
