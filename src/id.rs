//! 160-bit identifiers: info-hashes and Kademlia node ids share the same
//! shape, so both are represented with `Id20`.

use rand::RngCore;
use serde::de::{Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub fn random() -> Id20 {
        let mut buf = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut buf);
        Id20(buf)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Id20> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            anyhow::bail!("info-hash must decode to exactly 20 bytes, got {}", bytes.len());
        }
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&bytes);
        Ok(Id20(buf))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance used throughout Kademlia: bucket index, closeness ordering.
    pub fn distance(&self, other: &Id20) -> Id20 {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        Id20(out)
    }

    /// Index of the highest set bit, i.e. which k-bucket a contact at this
    /// XOR distance from the local id belongs in. Bucket 0 is the bucket
    /// holding the single farthest contacts (bit 159), matching the
    /// convention that bucket `i` covers ids sharing an `i`-bit prefix. We
    /// return `None` for the zero distance (self).
    pub fn bucket_index(&self) -> Option<usize> {
        for (byte_index, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return Some(159 - (byte_index * 8 + leading));
            }
        }
        None
    }
}

impl fmt::Debug for Id20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id20({})", self.to_hex())
    }
}

impl fmt::Display for Id20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 20]> for Id20 {
    fn from(bytes: [u8; 20]) -> Id20 {
        Id20(bytes)
    }
}

struct Id20Visitor;

impl<'de> Visitor<'de> for Id20Visitor {
    type Value = Id20;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a 20-byte binary string")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Id20, E>
    where
        E: serde::de::Error,
    {
        if v.len() != 20 {
            return Err(E::custom(format!("expected 20 bytes, got {}", v.len())));
        }
        let mut buf = [0u8; 20];
        buf.copy_from_slice(v);
        Ok(Id20(buf))
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Id20, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(Id20Visitor)
    }
}

impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = Id20::from_hex("e2467cbf021192c241367b892230dc1e05c0580e").unwrap();
        assert_eq!(id.to_hex(), "e2467cbf021192c241367b892230dc1e05c0580e");
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Id20::from_hex("abcd").is_err());
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id20::random();
        assert_eq!(id.distance(&id), Id20([0; 20]));
        assert_eq!(id.distance(&id).bucket_index(), None);
    }

    #[test]
    fn bucket_index_of_single_bit_difference() {
        let mut a = [0u8; 20];
        a[19] = 0b0000_0001;
        let zero = Id20([0; 20]);
        let one = Id20(a);
        assert_eq!(one.distance(&zero).bucket_index(), Some(0));

        let mut b = [0u8; 20];
        b[0] = 0b1000_0000;
        let top = Id20(b);
        assert_eq!(top.distance(&zero).bucket_index(), Some(159));
    }

    #[test]
    fn bencode_round_trip() {
        let id = Id20::random();
        let bytes = serde_bencode::to_bytes(&id).unwrap();
        let back: Id20 = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(id, back);
    }
}
