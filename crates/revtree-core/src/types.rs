//! Strong type definitions for revtree.
//!
//! Identifiers are newtypes so a revision can never be confused with a count
//! or a snapshot id.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Symbol table of the compact revision token, most significant group first.
const TOKEN_ALPHABET: &[u8; 64] =
    b"-_ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A u64 needs at most ceil(64 / 6) symbols.
const MAX_TOKEN_LEN: usize = 11;

/// A 64-bit document revision identifier.
///
/// Revisions are totally ordered. `RevisionId::ZERO` is never assigned to a
/// document and doubles as the "start"/"done" sentinel of paged queries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RevisionId(pub u64);

impl RevisionId {
    /// The reserved zero revision.
    pub const ZERO: Self = Self(0);

    /// The largest representable revision. Never assigned to a document, so
    /// every live revision fits under a half-open tree range.
    pub const MAX: Self = Self(u64::MAX);

    /// The largest revision a document can carry.
    pub const LAST: Self = Self(u64::MAX - 1);

    /// Create from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved zero revision.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Encode as the compact portable token.
    pub fn to_token(self) -> String {
        if self.0 == 0 {
            return "-".to_string();
        }
        let mut buf = [0u8; MAX_TOKEN_LEN];
        let mut pos = MAX_TOKEN_LEN;
        let mut value = self.0;
        while value > 0 {
            pos -= 1;
            buf[pos] = TOKEN_ALPHABET[(value & 0x3f) as usize];
            value >>= 6;
        }
        buf[pos..].iter().map(|&b| b as char).collect()
    }

    /// Decode a compact token produced by [`RevisionId::to_token`].
    ///
    /// Only canonical tokens are accepted: no leading zero symbols except the
    /// single-symbol encoding of zero itself.
    pub fn from_token(token: &str) -> Result<Self> {
        let bytes = token.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_TOKEN_LEN {
            return Err(CoreError::InvalidToken(token.to_string()));
        }
        if bytes.len() > 1 && bytes[0] == TOKEN_ALPHABET[0] {
            return Err(CoreError::InvalidToken(token.to_string()));
        }

        let mut value: u64 = 0;
        for &b in bytes {
            let digit =
                decode_symbol(b).ok_or_else(|| CoreError::InvalidToken(token.to_string()))?;
            if value >> 58 != 0 {
                return Err(CoreError::InvalidToken(token.to_string()));
            }
            value = (value << 6) | u64::from(digit);
        }
        Ok(Self(value))
    }

    /// Big-endian bytes, used when hashing.
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// The next revision, saturating at `MAX`.
    pub const fn saturating_next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous revision, saturating at zero.
    pub const fn saturating_prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

fn decode_symbol(b: u8) -> Option<u8> {
    match b {
        b'-' => Some(0),
        b'_' => Some(1),
        b'A'..=b'Z' => Some(b - b'A' + 2),
        b'a'..=b'z' => Some(b - b'a' + 28),
        b'0'..=b'9' => Some(b - b'0' + 54),
        _ => None,
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({})", self.0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RevisionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_token(s)
    }
}

impl From<u64> for RevisionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RevisionId> for u64 {
    fn from(rev: RevisionId) -> Self {
        rev.0
    }
}

impl Serialize for RevisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_token())
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let token = String::deserialize(deserializer)?;
            RevisionId::from_token(&token).map_err(de::Error::custom)
        } else {
            u64::deserialize(deserializer).map(RevisionId)
        }
    }
}

/// An ascending, duplicate-free list of revisions.
pub type Revisions = Vec<RevisionId>;

/// A closed interval of revisions, `min <= max`.
///
/// Serialized as a two-element `[min, max]` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "[RevisionId; 2]", try_from = "[RevisionId; 2]")]
pub struct RevisionRange {
    pub min: RevisionId,
    pub max: RevisionId,
}

impl RevisionRange {
    /// Every assignable revision.
    pub const FULL: Self = Self {
        min: RevisionId(1),
        max: RevisionId::MAX,
    };

    /// Create a range, rejecting `min > max`.
    pub fn new(min: RevisionId, max: RevisionId) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Check `min <= max`.
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(CoreError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Whether `rev` lies in the range.
    pub fn contains(&self, rev: RevisionId) -> bool {
        self.min <= rev && rev <= self.max
    }

    /// Number of revision values covered (saturating).
    pub fn width(&self) -> u64 {
        (self.max.0 - self.min.0).saturating_add(1)
    }

    /// The overlap of two ranges, if any.
    pub fn intersect(&self, other: &RevisionRange) -> Option<RevisionRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(RevisionRange { min, max })
    }
}

impl fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

impl From<RevisionRange> for [RevisionId; 2] {
    fn from(range: RevisionRange) -> Self {
        [range.min, range.max]
    }
}

impl TryFrom<[RevisionId; 2]> for RevisionRange {
    type Error = CoreError;

    fn try_from(pair: [RevisionId; 2]) -> Result<Self> {
        RevisionRange::new(pair[0], pair[1])
    }
}

/// Validate a batch of ranges for a paged query.
///
/// Every range must satisfy `min <= max`, and the batch must be ascending and
/// pairwise disjoint so one cursor can order results across all of them.
pub fn validate_ranges(ranges: &[RevisionRange]) -> Result<()> {
    for (i, range) in ranges.iter().enumerate() {
        range.validate()?;
        if i > 0 && ranges[i - 1].max >= range.min {
            return Err(CoreError::UnorderedRanges(i));
        }
    }
    Ok(())
}

/// Where a paged revision query continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResumeCursor {
    /// No progress yet.
    #[default]
    Start,
    /// Continue strictly after this revision.
    After(RevisionId),
}

impl ResumeCursor {
    /// Whether a revision lies past this cursor.
    pub fn admits(&self, rev: RevisionId) -> bool {
        match self {
            ResumeCursor::Start => true,
            ResumeCursor::After(last) => rev > *last,
        }
    }

    /// Decode the wire value, where zero means "start".
    pub fn from_wire(rev: RevisionId) -> Self {
        if rev.is_zero() {
            ResumeCursor::Start
        } else {
            ResumeCursor::After(rev)
        }
    }

    /// Encode as the wire value.
    pub fn to_wire(self) -> RevisionId {
        match self {
            ResumeCursor::Start => RevisionId::ZERO,
            ResumeCursor::After(rev) => rev,
        }
    }
}

/// Identifier of a snapshot lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

/// Opaque reference to a consistent read view of one collection.
///
/// The lease behind it is owned by whoever created it; every read made with
/// the handle fails once the lease has been deleted or has lapsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub id: SnapshotId,
    pub collection: String,
}

impl SnapshotHandle {
    pub fn new(id: SnapshotId, collection: impl Into<String>) -> Self {
        Self {
            id,
            collection: collection.into(),
        }
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}
