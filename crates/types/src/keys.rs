use std::fmt;

use crate::field::{Address, Field};
use crate::serialization::{ByteReader, Deserializable, DeserializationError, Serializable};

// PUBLIC KEY
// ================================================================================================

/// An account's encryption public key: the affine coordinates of a curve
/// point, 64 bytes in total.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey {
    pub x: Field,
    pub y: Field,
}

impl PublicKey {
    pub const fn new(x: Field, y: Field) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}{}", hex::encode(self.x.as_bytes()), hex::encode(self.y.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serializable for PublicKey {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.x.write_into(target);
        self.y.write_into(target);
    }
}

impl Deserializable for PublicKey {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self { x: Field::read_from(source)?, y: Field::read_from(source)? })
    }
}

// SECRET KEY
// ================================================================================================

/// An account's decryption secret. The value is deliberately kept out of
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SecretKey::SIZE]);

impl SecretKey {
    pub const SIZE: usize = 32;

    pub const fn new(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

// COMPLETE ADDRESS
// ================================================================================================

/// The component an address is derived from besides the public key.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub struct PartialAddress(pub Field);

/// Everything publicly known about an account: the address itself plus the
/// preimage it is derived from. Stored for every registered account and for
/// every known recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompleteAddress {
    pub address: Address,
    pub public_key: PublicKey,
    pub partial_address: PartialAddress,
}

impl Serializable for CompleteAddress {
    fn write_into(&self, target: &mut Vec<u8>) {
        self.address.write_into(target);
        self.public_key.write_into(target);
        self.partial_address.0.write_into(target);
    }
}

impl Deserializable for CompleteAddress {
    fn read_from(source: &mut ByteReader<'_>) -> Result<Self, DeserializationError> {
        Ok(Self {
            address: Address::read_from(source)?,
            public_key: PublicKey::read_from(source)?,
            partial_address: PartialAddress(Field::read_from(source)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn public_key_display_concatenates_coordinates() {
        let key = PublicKey::new(Field::from_u64(1), Field::from_u64(2));
        let display = key.to_string();
        assert_eq!(display.len(), 2 + 128);
        assert!(display.ends_with("02"));
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let secret = SecretKey::new([7; 32]);
        assert_eq!(format!("{secret:?}"), "SecretKey(<redacted>)");
    }

    #[test]
    fn complete_address_round_trip() {
        let complete = CompleteAddress {
            address: Address::from_u64(11),
            public_key: PublicKey::new(Field::from_u64(12), Field::from_u64(13)),
            partial_address: PartialAddress(Field::from_u64(14)),
        };
        assert_eq!(CompleteAddress::read_from_bytes(&complete.to_bytes()).unwrap(), complete);
    }
}
