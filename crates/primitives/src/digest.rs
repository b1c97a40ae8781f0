#[cfg(test)]
#[path = "tests/digest.rs"]
mod tests;

use core::fmt;
use core::str::FromStr;
use std::io;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Width in bytes of every digest produced by this crate.
pub const DIGEST_LEN: usize = 32;

/// A fixed-width, totally ordered Sha256 digest.
///
/// Serves two roles: as a *position* in the ring keyspace (derived from a
/// node identifier or a routed key) and as a *content summary* in the
/// reconciliation tree (derived from a bucket or combined from two child
/// digests). Ordering is plain byte-wise comparison, which is what the
/// ring sorts nodes by.
#[derive(
    BorshDeserialize, BorshSerialize, Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Digests a raw byte string.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Digests the canonical borsh encoding of `data`.
    ///
    /// Borsh encoding is deterministic, so two peers hashing equal values
    /// always derive equal digests. This is the position function for
    /// node identifiers and the leaf digest function for buckets.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` fails to serialise.
    pub fn of_borsh<T: BorshSerialize>(data: &T) -> io::Result<Self> {
        let mut hasher = Sha256::default();
        data.serialize(&mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Combines two child digests into their parent digest.
    ///
    /// The combination is positional: the left digest is fed to the
    /// hasher before the right one, so swapping children changes the
    /// result. An order-blind combine (e.g. addition) would erase which
    /// side of a subtree diverged and report spurious equality.
    #[must_use]
    pub fn combine(left: &Self, right: &Self) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Base58 rendering of the digest.
    #[must_use]
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; DIGEST_LEN] {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_base58())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&self.to_base58()).finish()
    }
}

/// Errors arising from parsing a base58 digest string.
#[derive(Clone, Copy, Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The decoded byte string was not [`DIGEST_LEN`] bytes long.
    #[error("invalid digest length")]
    InvalidLength,

    /// The string was not valid base58.
    #[error("invalid base58")]
    DecodeError(#[from] bs58::decode::Error),
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; DIGEST_LEN];
        match bs58::decode(s).onto(&mut bytes) {
            Ok(len) if len == bytes.len() => Ok(Self(bytes)),
            Ok(_) => Err(ParseError::InvalidLength),
            Err(err) => Err(ParseError::DecodeError(err)),
        }
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        /// Visitor for the base58 string form.
        struct DigestVisitor;

        impl serde::de::Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base58 encoded digest")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Digest::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}
