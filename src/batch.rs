//! Write batches
//!
//! A batch is the unit of atomicity and durability: it is written to the
//! journal as one record and all of its operations become visible together.
//!
//! ## Encoding
//! ```text
//! ┌──────────────┬─────────────┬───────────────────────────────────────────┐
//! │ Sequence (8) │ Count (4)   │ Records                                   │
//! └──────────────┴─────────────┴───────────────────────────────────────────┘
//! Record: [Kind (1)][KeyLen (4)][Key][ValLen (4)][Value]   (value omitted for deletes)
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Result, StrataError};
use crate::key::{RecordKind, SequenceNumber};
use crate::memtable::MemTable;

/// Fixed header: sequence (8) + count (4)
pub const BATCH_HEADER_SIZE: usize = 12;

/// Operations that can be batched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },
}

impl Operation {
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => key,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Operation::Put { .. } => RecordKind::Value,
            Operation::Delete { .. } => RecordKind::Delete,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Operation::Put { key, value } => 1 + 4 + key.len() + 4 + value.len(),
            Operation::Delete { key } => 1 + 4 + key.len(),
        }
    }
}

/// An ordered group of operations committed atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    sequence: SequenceNumber,
    ops: Vec<Operation>,
    encoded_size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            ops: Vec::new(),
            encoded_size: BATCH_HEADER_SIZE,
        }
    }

    /// Queue a put
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Operation::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queue a delete
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Operation::Delete { key: key.into() });
        self
    }

    fn push(&mut self, op: Operation) {
        self.encoded_size += op.encoded_len();
        self.ops.push(op);
    }

    /// Move every operation of `other` to the end of this batch
    pub fn append(&mut self, other: WriteBatch) {
        for op in other.ops {
            self.push(op);
        }
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.encoded_size = BATCH_HEADER_SIZE;
        self.sequence = 0;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Size of the encoded batch in bytes
    pub fn approximate_size(&self) -> usize {
        self.encoded_size
    }

    /// Sequence number assigned to the first operation
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Sequence number of the last operation (equals `sequence()` when empty)
    pub fn last_sequence(&self) -> SequenceNumber {
        self.sequence + (self.ops.len() as u64).saturating_sub(1)
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.sequence = seq;
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Serialize into the journal payload format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size);
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            buf.put_u8(op.kind() as u8);
            buf.put_u32_le(op.key().len() as u32);
            buf.put_slice(op.key());
            if let Operation::Put { value, .. } = op {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
        }
        buf
    }

    /// Parse a journal payload
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(StrataError::Corruption("batch too short".into()));
        }
        let sequence = data.get_u64_le();
        let count = data.get_u32_le() as usize;

        let mut batch = WriteBatch::new();
        batch.sequence = sequence;
        for _ in 0..count {
            if data.remaining() < 5 {
                return Err(StrataError::Corruption("batch record truncated".into()));
            }
            let kind = RecordKind::from_u8(data.get_u8())?;
            let key = take_slice(&mut data)?;
            match kind {
                RecordKind::Value => {
                    let value = take_slice(&mut data)?;
                    batch.push(Operation::Put { key, value });
                }
                RecordKind::Delete => batch.push(Operation::Delete { key }),
            }
        }
        if data.has_remaining() {
            return Err(StrataError::Corruption(format!(
                "batch has {} trailing bytes",
                data.remaining()
            )));
        }
        Ok(batch)
    }

    /// Apply every operation to `memtable`, consuming consecutive sequence numbers
    pub fn insert_into(&self, memtable: &MemTable) {
        let mut seq = self.sequence;
        for op in &self.ops {
            match op {
                Operation::Put { key, value } => memtable.put(seq, RecordKind::Value, key, value),
                Operation::Delete { key } => memtable.put(seq, RecordKind::Delete, key, &[]),
            }
            seq += 1;
        }
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

fn take_slice(data: &mut &[u8]) -> Result<Vec<u8>> {
    if data.remaining() < 4 {
        return Err(StrataError::Corruption("batch length prefix truncated".into()));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(StrataError::Corruption(format!(
            "batch field of {} bytes exceeds remaining {}",
            len,
            data.remaining()
        )));
    }
    let out = data[..len].to_vec();
    data.advance(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_preserves_operations() {
        let mut batch = WriteBatch::new();
        batch.put("a", "1").delete("b").put("c", "");
        batch.set_sequence(77);

        let decoded = WriteBatch::decode(&batch.encode()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.sequence(), 77);
        assert_eq!(decoded.last_sequence(), 79);
    }

    #[test]
    fn test_approximate_size_matches_encoding() {
        let mut batch = WriteBatch::new();
        batch.put("key", "value").delete("gone");
        assert_eq!(batch.approximate_size(), batch.encode().len());
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut batch = WriteBatch::new();
        batch.put("key", "value");
        let encoded = batch.encode();
        assert!(WriteBatch::decode(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn test_append_keeps_order() {
        let mut first = WriteBatch::new();
        first.put("x", "1");
        let mut second = WriteBatch::new();
        second.put("x", "2");
        first.append(second);
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.operations()[1],
            Operation::Put {
                key: b"x".to_vec(),
                value: b"2".to_vec()
            }
        );
    }
}
