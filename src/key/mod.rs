//! Key Module
//!
//! User key comparators and the internal key codec that every other
//! component orders by.

mod comparator;
mod internal;

pub use comparator::{BytewiseComparator, Comparator};
pub use internal::{
    encode_internal_key, extract_user_key, InternalKey, InternalKeyComparator, LookupKey,
    ParsedInternalKey, RecordKind, SequenceNumber, KIND_FOR_SEEK, MAX_SEQUENCE, TRAILER_SIZE,
};
