use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::error::RoutingError;
use rand::RngCore;

/// Identifier width in bits.
pub const BITS: usize = 160;
/// Identifier width in bytes.
pub const BYTES: usize = BITS / 8;
/// Number of hex digits in an identifier.
pub const DIGITS: usize = 40;
/// Number of distinct digit values.
pub const RADIX: usize = 16;

/// A 160-bit identifier naming a node or an object, viewed as 40 hex digits
/// with the most significant digit at level 0. Identifiers are immutable;
/// [`Id::with_digit`] returns a modified copy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; BYTES]);

impl Id {
    pub const ZERO: Id = Id([0; BYTES]);

    /// Hashes an application key into the identifier space.
    pub fn hash(key: &str) -> Id {
        let digest = Sha1::digest(key.as_bytes());
        let mut bytes = [0u8; BYTES];
        bytes.copy_from_slice(&digest);
        Id(bytes)
    }

    /// Generates a random identifier, used for node identity.
    pub fn random() -> Id {
        let mut bytes = [0u8; BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Id(bytes)
    }

    /// Builds an identifier from raw bytes, rejecting any length other than
    /// 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Id, RoutingError> {
        if bytes.len() != BYTES {
            return Err(RoutingError::InvalidIdLength(bytes.len()));
        }
        let mut id = [0u8; BYTES];
        id.copy_from_slice(bytes);
        Ok(Id(id))
    }

    pub fn as_bytes(&self) -> &[u8; BYTES] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Returns the hex digit at `level`; level 0 is the most significant
    /// nibble. Panics on an out-of-range level.
    pub fn digit(&self, level: usize) -> usize {
        assert!(level < DIGITS, "digit level {} out of range", level);
        let byte = self.0[level / 2];
        if level % 2 == 0 {
            (byte >> 4) as usize
        } else {
            (byte & 0x0f) as usize
        }
    }

    /// Returns a copy with the digit at `level` replaced.
    pub fn with_digit(&self, level: usize, digit: usize) -> Id {
        assert!(level < DIGITS, "digit level {} out of range", level);
        assert!(digit < RADIX, "digit value {} out of range", digit);
        let mut bytes = self.0;
        let idx = level / 2;
        if level % 2 == 0 {
            bytes[idx] = (bytes[idx] & 0x0f) | ((digit as u8) << 4);
        } else {
            bytes[idx] = (bytes[idx] & 0xf0) | digit as u8;
        }
        Id(bytes)
    }

    /// Counts the leading digits shared with `other`; DIGITS when equal.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        for level in 0..DIGITS {
            if self.digit(level) != other.digit(level) {
                return level;
            }
        }
        DIGITS
    }

    /// XOR distance to `other` in the identifier space.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut bytes = [0u8; BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }
}

/// Returns true if `candidate` is closer to `target` than `current` is,
/// under the XOR metric.
pub fn closer(target: &Id, current: &Id, candidate: &Id) -> bool {
    target.distance(candidate) < target.distance(current)
}

/// XOR distance between two identifiers. The derived ordering compares the
/// raw bytes lexicographically, which equals comparing the distances as
/// 160-bit big-endian integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; BYTES]);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Id {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s).map_err(|e| RoutingError::InvalidIdEncoding(e.to_string()))?;
        Id::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_extraction() {
        let mut bytes = [0u8; BYTES];
        bytes[0] = 0x12;
        bytes[1] = 0x34;
        let id = Id::from_bytes(&bytes).unwrap();
        assert_eq!(id.digit(0), 1);
        assert_eq!(id.digit(1), 2);
        assert_eq!(id.digit(2), 3);
        assert_eq!(id.digit(3), 4);
        assert_eq!(id.digit(4), 0);
        assert_eq!(id.digit(DIGITS - 1), 0);
    }

    #[test]
    fn shared_prefix() {
        let mut a = [0u8; BYTES];
        a[0] = 0x12;
        let mut b = [0u8; BYTES];
        b[0] = 0x13;
        let a = Id::from_bytes(&a).unwrap();
        let b = Id::from_bytes(&b).unwrap();
        assert_eq!(a.shared_prefix_len(&b), 1);
        assert_eq!(a.shared_prefix_len(&a), DIGITS);
    }

    #[test]
    fn set_digit_leaves_others_untouched() {
        let id = Id::ZERO.with_digit(2, 15);
        assert_eq!(id.digit(2), 15);
        assert_eq!(id.digit(0), 0);
        assert_eq!(id.digit(3), 0);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(Id::hash("test"), Id::hash("test"));
        assert_ne!(Id::hash("test"), Id::hash("test2"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Id::from_bytes(&[0u8; 19]).is_err());
        assert!(Id::from_bytes(&[0u8; 21]).is_err());
        assert!(Id::from_bytes(&[0u8; BYTES]).is_ok());
    }

    #[test]
    fn xor_distance_ordering() {
        let target = Id::hash("target");
        let near = target.with_digit(DIGITS - 1, (target.digit(DIGITS - 1) + 1) % RADIX);
        let far = target.with_digit(0, (target.digit(0) + 1) % RADIX);
        assert!(closer(&target, &far, &near));
        assert!(!closer(&target, &near, &far));
    }

    #[test]
    fn distance_of_adjacent_ids() {
        let a = Id::ZERO;
        let mut bytes = [0u8; BYTES];
        bytes[BYTES - 1] = 1;
        let b = Id::from_bytes(&bytes).unwrap();
        assert!(a.distance(&b) > a.distance(&a));
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("zz".parse::<Id>().is_err());
        assert!("12ab".parse::<Id>().is_err());
    }
}
