use crc::{Crc, CRC_64_REDIS};

use crate::error::{Error, Result};

/// CRC-64 with the Jones polynomial, zero init and zero xorout. Its residue
/// is zero, so a record followed by its own little-endian CRC checksums to 0.
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Fixed-width prefix of every record: timestamp, key length, value length,
/// each 8 bytes little-endian.
pub const HEADER_LEN: usize = 24;

/// Trailing CRC-64, little-endian.
pub const CRC_LEN: usize = 8;

/// Fixed-width prefix of every hint record: the record header plus the
/// 8-byte offset of the record in the paired merged file.
pub const HINT_HEADER_LEN: usize = 32;

/// A value equal to these bytes marks its key as deleted. Tombstones are
/// persisted like any other record so deletions survive restart.
pub const TOMBSTONE: &[u8] = "🪦".as_bytes();

/// A key-value record as laid out on disk:
///
/// - Timestamp as little-endian i64, seconds since the epoch.
/// - Key and value lengths as little-endian i64.
/// - Key and value as raw bytes.
/// - CRC-64 of all preceding bytes, little-endian.
pub struct Record<'a> {
    pub timestamp: i64,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// The decoded fixed-width header of a record. Lengths are kept signed, as
/// stored; callers must treat negative values as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub timestamp: i64,
    pub key_len: i64,
    pub val_len: i64,
}

impl Record<'_> {
    /// Total encoded size, rejecting records whose size would overflow the
    /// signed size range of the on-disk length fields.
    pub fn encoded_len(&self) -> Result<usize> {
        let len = HEADER_LEN
            .checked_add(self.key.len())
            .and_then(|n| n.checked_add(self.value.len()))
            .and_then(|n| n.checked_add(CRC_LEN))
            .ok_or(Error::ArithmeticOverflow)?;
        if len > isize::MAX as usize {
            return Err(Error::ArithmeticOverflow);
        }
        Ok(len)
    }

    /// Encodes the record into `buf`, which must be exactly `encoded_len()`
    /// bytes, and seals it with the CRC of everything written before it.
    pub fn encode(&self, buf: &mut [u8]) {
        let key_len = self.key.len();
        let val_len = self.value.len();
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&(key_len as i64).to_le_bytes());
        buf[16..24].copy_from_slice(&(val_len as i64).to_le_bytes());
        buf[HEADER_LEN..HEADER_LEN + key_len].copy_from_slice(self.key);
        buf[HEADER_LEN + key_len..HEADER_LEN + key_len + val_len].copy_from_slice(self.value);
        let crc_at = buf.len() - CRC_LEN;
        let crc = CRC64.checksum(&buf[..crc_at]);
        buf[crc_at..].copy_from_slice(&crc.to_le_bytes());
    }
}

/// Decodes the three fixed-width header fields.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Header {
    Header {
        timestamp: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
        key_len: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        val_len: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
    }
}

/// Verifies a full encoded record. Because the CRC's residue is zero,
/// checksumming the record together with its trailing CRC yields 0 exactly
/// when the record is intact.
pub fn verify(buf: &[u8]) -> bool {
    CRC64.checksum(buf) == 0
}

/// The value bytes of a full encoded record with the given key length.
pub fn value_of(buf: &[u8], key_len: usize) -> &[u8] {
    &buf[HEADER_LEN + key_len..buf.len() - CRC_LEN]
}

/// A hint record: the header and merged-file offset of a record that was
/// copied during a merge, without the value payload. Lets recovery index a
/// merged file without rereading it.
pub struct HintRecord<'a> {
    pub timestamp: i64,
    pub val_len: u64,
    pub val_offset: u64,
    pub key: &'a [u8],
}

impl HintRecord<'_> {
    pub fn encoded_len(&self) -> Result<usize> {
        HINT_HEADER_LEN.checked_add(self.key.len()).ok_or(Error::ArithmeticOverflow)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&(self.key.len() as i64).to_le_bytes());
        buf[16..24].copy_from_slice(&(self.val_len as i64).to_le_bytes());
        buf[24..32].copy_from_slice(&(self.val_offset as i64).to_le_bytes());
        buf[HINT_HEADER_LEN..].copy_from_slice(self.key);
    }
}

/// Decodes a hint record's fixed-width prefix into the record header and the
/// offset of the record in the paired merged file.
pub fn decode_hint_header(buf: &[u8; HINT_HEADER_LEN]) -> (Header, i64) {
    let header = Header {
        timestamp: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
        key_len: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        val_len: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
    };
    let val_offset = i64::from_le_bytes(buf[24..32].try_into().unwrap());
    (header, val_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(record: &Record) -> Vec<u8> {
        let mut buf = vec![0; record.encoded_len().unwrap()];
        record.encode(&mut buf);
        buf
    }

    /// The header layout is fixed: three little-endian i64 fields.
    #[test]
    fn header_layout() {
        let record = Record { timestamp: 1, key: b"k", value: b"v" };
        let buf = encode(&record);
        assert_eq!(buf.len(), HEADER_LEN + 1 + 1 + CRC_LEN);
        assert_eq!(
            hex::encode(&buf[..HEADER_LEN]),
            "010000000000000001000000000000000100000000000000",
        );
        assert_eq!(hex::encode(&buf[HEADER_LEN..HEADER_LEN + 2]), "6b76");
    }

    #[test]
    fn encode_then_decode_header() {
        let record = Record { timestamp: 1_700_000_000, key: b"key", value: b"value" };
        let buf = encode(&record);
        let header = decode_header(buf[..HEADER_LEN].try_into().unwrap());
        assert_eq!(
            header,
            Header { timestamp: 1_700_000_000, key_len: 3, val_len: 5 },
        );
        assert_eq!(value_of(&buf, 3), b"value");
    }

    #[test]
    fn verify_accepts_intact_records() {
        let record = Record { timestamp: 42, key: b"some key", value: b"some value" };
        assert!(verify(&encode(&record)));
    }

    #[test]
    fn verify_rejects_any_flipped_byte() {
        let record = Record { timestamp: 42, key: b"k", value: b"v" };
        let buf = encode(&record);
        for i in 0..buf.len() {
            let mut corrupt = buf.clone();
            corrupt[i] ^= 0x01;
            assert!(!verify(&corrupt), "flip at byte {i} went undetected");
        }
    }

    #[test]
    fn tombstone_is_a_plain_value() {
        let record = Record { timestamp: 0, key: b"dead", value: TOMBSTONE };
        let buf = encode(&record);
        assert!(verify(&buf));
        assert_eq!(value_of(&buf, 4), TOMBSTONE);
    }

    #[test]
    fn hint_record_round_trips() {
        let hint = HintRecord { timestamp: 7, val_len: 99, val_offset: 4096, key: b"hinted" };
        let mut buf = vec![0; hint.encoded_len().unwrap()];
        hint.encode(&mut buf);
        let (header, val_offset) = decode_hint_header(buf[..HINT_HEADER_LEN].try_into().unwrap());
        assert_eq!(header, Header { timestamp: 7, key_len: 6, val_len: 99 });
        assert_eq!(val_offset, 4096);
        assert_eq!(&buf[HINT_HEADER_LEN..], b"hinted");
    }

    #[test]
    fn encoded_len_accounts_for_header_and_crc() {
        let record = Record { timestamp: 0, key: b"key", value: b"value" };
        assert_eq!(record.encoded_len().unwrap(), HEADER_LEN + 3 + 5 + CRC_LEN);
    }
}
