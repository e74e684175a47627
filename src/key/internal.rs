//! Internal key encoding
//!
//! ## Layout
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────┐
//! │ user key (variable)  │ trailer: u64 LE = (seq << 8) | kind  │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Ordering is user key ascending, then trailer descending, so the newest
//! version of a user key always sorts first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use super::Comparator;
use crate::error::{Result, StrataError};

/// Sequence numbers are limited to 56 bits; the low byte of the trailer holds the kind.
pub type SequenceNumber = u64;

/// Largest representable sequence number
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Size of the trailer appended to every user key
pub const TRAILER_SIZE: usize = 8;

/// Kind of record stored under an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Tombstone; carries no payload
    Delete = 0,
    /// A live value
    Value = 1,
}

impl RecordKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(RecordKind::Delete),
            1 => Ok(RecordKind::Value),
            other => Err(StrataError::Corruption(format!(
                "invalid record kind: {}",
                other
            ))),
        }
    }
}

/// Kind used when building seek targets. Because `Value` is the highest kind,
/// a seek key sorts before every real entry with the same user key and sequence.
pub const KIND_FOR_SEEK: RecordKind = RecordKind::Value;

fn pack_trailer(seq: SequenceNumber, kind: RecordKind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | kind as u64
}

/// Encode `(user_key, seq, kind)` into one internal key
pub fn encode_internal_key(user_key: &[u8], seq: SequenceNumber, kind: RecordKind) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    buf.put_slice(user_key);
    buf.put_u64_le(pack_trailer(seq, kind));
    buf
}

/// The user key part of an encoded internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TRAILER_SIZE);
    &internal_key[..internal_key.len() - TRAILER_SIZE]
}

fn extract_trailer(internal_key: &[u8]) -> u64 {
    let mut tail = &internal_key[internal_key.len() - TRAILER_SIZE..];
    tail.get_u64_le()
}

/// Borrowed, decoded view of an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub kind: RecordKind,
}

impl<'a> ParsedInternalKey<'a> {
    /// Decode an internal key, rejecting short keys and unknown kinds
    pub fn parse(internal_key: &'a [u8]) -> Result<Self> {
        if internal_key.len() < TRAILER_SIZE {
            return Err(StrataError::Corruption(format!(
                "internal key too short: {} bytes",
                internal_key.len()
            )));
        }
        let trailer = extract_trailer(internal_key);
        Ok(Self {
            user_key: extract_user_key(internal_key),
            sequence: trailer >> 8,
            kind: RecordKind::from_u8((trailer & 0xff) as u8)?,
        })
    }
}

/// Owned internal key, mostly used in metadata and tests
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    encoded: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, kind: RecordKind) -> Self {
        Self {
            encoded: encode_internal_key(user_key, seq, kind),
        }
    }

    pub fn from_encoded(encoded: Vec<u8>) -> Self {
        Self { encoded }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.encoded)
    }

    pub fn into_encoded(self) -> Vec<u8> {
        self.encoded
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ParsedInternalKey::parse(&self.encoded) {
            Ok(p) => write!(
                f,
                "{:?}@{}:{:?}",
                String::from_utf8_lossy(p.user_key),
                p.sequence,
                p.kind
            ),
            Err(_) => write!(f, "<bad key {:?}>", self.encoded),
        }
    }
}

/// Key used to look up the newest entry of `user_key` visible at `seq`
#[derive(Debug, Clone)]
pub struct LookupKey {
    internal: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        Self {
            internal: encode_internal_key(user_key, seq, KIND_FOR_SEEK),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.internal
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.internal)
    }
}

/// Orders encoded internal keys using a user comparator
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => extract_trailer(b).cmp(&extract_trailer(a)),
            ord => ord,
        }
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_parse_roundtrip() {
        let key = encode_internal_key(b"apple", 42, RecordKind::Value);
        let parsed = ParsedInternalKey::parse(&key).unwrap();
        assert_eq!(parsed.user_key, b"apple");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.kind, RecordKind::Value);
    }

    #[test]
    fn test_newer_sequence_sorts_first() {
        let cmp = icmp();
        let old = encode_internal_key(b"k", 1, RecordKind::Value);
        let new = encode_internal_key(b"k", 2, RecordKind::Value);
        assert_eq!(cmp.compare(&new, &old), Ordering::Less);
    }

    #[test]
    fn test_user_key_dominates_sequence() {
        let cmp = icmp();
        let a = encode_internal_key(b"a", 1, RecordKind::Value);
        let b = encode_internal_key(b"b", 100, RecordKind::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_value_before_delete_at_same_sequence() {
        let cmp = icmp();
        let put = encode_internal_key(b"k", 7, RecordKind::Value);
        let del = encode_internal_key(b"k", 7, RecordKind::Delete);
        assert_eq!(cmp.compare(&put, &del), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_lands_on_visible_entry() {
        let cmp = icmp();
        let lookup = LookupKey::new(b"k", 5);
        let visible = encode_internal_key(b"k", 5, RecordKind::Delete);
        let invisible = encode_internal_key(b"k", 6, RecordKind::Value);
        assert_ne!(cmp.compare(lookup.internal_key(), &visible), Ordering::Greater);
        assert_eq!(cmp.compare(lookup.internal_key(), &invisible), Ordering::Greater);
    }

    #[test]
    fn test_short_key_is_corruption() {
        assert!(ParsedInternalKey::parse(b"abc").is_err());
    }

    #[test]
    fn test_unknown_kind_is_corruption() {
        let mut key = encode_internal_key(b"k", 1, RecordKind::Value);
        let n = key.len();
        key[n - TRAILER_SIZE] = 9;
        assert!(ParsedInternalKey::parse(&key).is_err());
    }
}
