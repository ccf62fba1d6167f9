//! Mesh-wide peer identity.

use crate::WireError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identity length in bytes
pub const ID_SIZE: usize = 64;

/// Length of the lowercase hex encoding of an identity
pub const ID_HEX_SIZE: usize = ID_SIZE * 2;

/// 64 random bytes naming one process within a mesh.
///
/// Ordering is plain byte order, which equals the lexicographic order of the
/// lowercase hex encoding used on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; ID_SIZE]);

impl PeerId {
    /// Wrap raw identity bytes
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Parse the wire encoding: exactly 128 lowercase hex characters
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let valid = s.len() == ID_HEX_SIZE
            && s.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c));
        if !valid {
            return Err(WireError::InvalidId);
        }

        let mut bytes = [0u8; ID_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| WireError::InvalidId)?;
        Ok(Self(bytes))
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, handy for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}…)", self.short())
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
