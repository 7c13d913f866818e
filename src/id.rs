use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    cmp::Ordering,
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of a node id / info hash in bytes.
pub const ID_LEN: usize = 20;

/// Length of a `NodeId`.
pub const NODE_ID_LEN: usize = ID_LEN;

/// Length of an `InfoHash`.
pub const INFO_HASH_LEN: usize = ID_LEN;

/// 160-bit identifier of nodes and objects on the DHT.
///
/// Ordering is lexicographic by byte, which for the result of a XOR is the same as ordering by
/// Kademlia distance.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(#[serde(with = "byte_array")] [u8; ID_LEN]);

/// Identifier of a sub-network of peers on the DHT. Shares the id space with nodes.
pub type InfoHash = NodeId;

impl NodeId {
    /// Create an id by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// Derive the info hash that scopes peers of an application network.
    ///
    /// Every client using the same network key ends up announcing under the same info hash.
    pub fn from_network_key(key: &str) -> Self {
        Self::sha1(key.as_bytes())
    }

    /// Generate a random id.
    pub fn random() -> Self {
        rand::random()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// XOR distance between two ids.
    pub fn distance(&self, other: &Self) -> Self {
        *self ^ *other
    }

    /// Compare which of `a` and `b` is closer to `self`. Equal distances fall back to the lower
    /// raw id.
    pub fn cmp_distance(&self, a: &Self, b: &Self) -> Ordering {
        self.distance(a)
            .cmp(&self.distance(b))
            .then_with(|| a.cmp(b))
    }

    /// Panics if index is out of bounds.
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        let (byte_index, bit_index) = (index / 8, index % 8);

        let actual_bit_index = 7 - bit_index;
        bytes[byte_index] ^= 1 << actual_bit_index;

        bytes.into()
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<NodeId> for [u8; ID_LEN] {
    fn from(id: NodeId) -> [u8; ID_LEN] {
        id.0
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(id: [u8; ID_LEN]) -> NodeId {
        Self(id)
    }
}

#[derive(Debug, Error)]
#[error("invalid id length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for NodeId {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for NodeId {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<NodeId> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        NodeId(rng.gen())
    }
}

impl fmt::LowerHex for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod byte_array {
    use super::ID_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; ID_LEN], s: S) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ID_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", ID_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}
