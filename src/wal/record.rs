//! Record framing shared by the journal and the manifest.

use bytes::BufMut;

/// Header size: CRC (4) + Len (4)
pub const RECORD_HEADER_SIZE: usize = 8;

/// CRC over the length field followed by the payload
pub(crate) fn record_checksum(len_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(len_bytes);
    hasher.update(payload);
    hasher.finalize()
}

/// Frame `payload` as one record: `[crc][len][payload]`
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let len_bytes = (payload.len() as u32).to_le_bytes();
    let crc = record_checksum(&len_bytes, payload);

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.put_u32_le(crc);
    buf.put_slice(&len_bytes);
    buf.put_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let framed = encode_record(b"hello");
        assert_eq!(framed.len(), RECORD_HEADER_SIZE + 5);
        assert_eq!(&framed[4..8], &5u32.to_le_bytes());
        assert_eq!(&framed[8..], b"hello");
    }

    #[test]
    fn test_checksum_covers_length() {
        let a = record_checksum(&5u32.to_le_bytes(), b"hello");
        let b = record_checksum(&6u32.to_le_bytes(), b"hello");
        assert_ne!(a, b);
    }
}
