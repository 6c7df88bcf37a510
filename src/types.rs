//! Core types for the notarization log.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha512};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::sortable;
use crate::error::{CodecError, Error, Result};

/// Length in bytes of document and pack digests.
pub const DIGEST_LEN: usize = 64;

/// Suffix shared by every pack object name.
pub const PACK_SUFFIX: &str = ".pack";

/// A 64-byte document or pack digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub const ZERO: Digest = Digest([0; DIGEST_LEN]);

    pub fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-512 of `data`.
    pub fn of(data: &[u8]) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&Sha512::digest(data));
        Self(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            Error::Internal(format!(
                "digest must be {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; DIGEST_LEN]
    }
}

impl TryFrom<Vec<u8>> for Digest {
    type Error = Error;

    fn try_from(v: Vec<u8>) -> Result<Self> {
        Self::from_slice(&v)
    }
}

impl From<Digest> for Vec<u8> {
    fn from(d: Digest) -> Self {
        d.0.to_vec()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Wall-clock now. Clocks before the epoch read as zero.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// One notarized document reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub digest: Digest,
    pub salt: Vec<u8>,
    pub timestamp: Timestamp,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Entry {
    pub fn new(digest: Digest, salt: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            digest,
            salt,
            timestamp,
            signature: Vec::new(),
            public_key: Vec::new(),
        }
    }

    pub fn with_signature(mut self, signature: Vec<u8>, public_key: Vec<u8>) -> Self {
        self.signature = signature;
        self.public_key = public_key;
        self
    }
}

/// A shard key: the leading hex nibbles of a digest.
///
/// The empty prefix is the root of the roll-up hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix(String);

impl Prefix {
    /// Parse a lowercase hex prefix.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if let Some(c) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(Error::Config(format!(
                "prefix {s:?} contains non-hex character {c:?}"
            )));
        }
        Ok(Self(s))
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    /// The first `nibbles` hex digits of `digest`.
    pub fn of_digest(digest: &Digest, nibbles: usize) -> Self {
        let bytes = &digest.as_bytes()[..nibbles.div_ceil(2).min(DIGEST_LEN)];
        let mut hex = hex::encode(bytes);
        hex.truncate(nibbles);
        Self(hex)
    }

    /// One nibble shorter, or `None` at the root.
    pub fn parent(&self) -> Option<Prefix> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Prefix {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Prefix::new(s)
    }
}

impl From<Prefix> for String {
    fn from(p: Prefix) -> Self {
        p.0
    }
}

/// Name of pack `seq` in `prefix`: `{prefix}-{encoded seq}.pack`.
pub fn pack_object_name(prefix: &Prefix, seq: u64) -> String {
    format!("{}-{}{}", prefix, sortable::encode(seq), PACK_SUFFIX)
}

/// Common leading part of every pack name in `prefix`.
pub fn pack_listing_prefix(prefix: &Prefix) -> String {
    format!("{}-", prefix)
}

/// Inverse of [`pack_object_name`].
pub fn parse_pack_object_name(name: &str) -> Result<(Prefix, u64)> {
    let bad = || CodecError::BadEncoding(format!("{name:?} is not a pack object name"));
    let stem = name.strip_suffix(PACK_SUFFIX).ok_or_else(bad)?;
    if stem.len() < sortable::ENCODED_LEN + 1 {
        return Err(bad().into());
    }
    let (head, encoded) = stem.split_at(stem.len() - sortable::ENCODED_LEN);
    let prefix = head.strip_suffix('-').ok_or_else(bad)?;
    let prefix = Prefix::new(prefix).map_err(|_| bad())?;
    Ok((prefix, sortable::decode(encoded)?))
}
