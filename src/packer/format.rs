//! Pack object format.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "PCK1"                         │
//! │ VERSION: u32                                    │
//! │ SEQ_NO: u64                                     │
//! │ ENTRY_COUNT: u32                                │
//! │ PREV_DIGEST: [u8; 64] (zeros for the first pack)│
//! │ PREFIX_LEN: u8, PREFIX: [u8]                    │
//! ├─────────────────────────────────────────────────┤
//! │ Entry 1:                                        │
//! │  - Digest: [u8; 64]                             │
//! │  - Timestamp: u64 (ns since epoch)              │
//! │  - Salt: u16 length + bytes                     │
//! │  - Signature: u16 length + bytes                │
//! │  - Public key: u16 length + bytes               │
//! │ Entry 2: ...                                    │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32C: u32 over everything above               │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little endian. The pack digest is SHA-512 over
//! everything before the CRC; the next pack in the prefix stores it as
//! `PREV_DIGEST`, which chains the packs together.

use bytes::{Buf, BufMut, Bytes};
use sha2::{Digest as _, Sha512};

use crate::codec::crc32c;
use crate::error::{Error, Result};
use crate::storage::{CommitReceipt, ObjectWriter};
use crate::types::{Digest, Entry, Prefix, Timestamp, DIGEST_LEN};

/// Magic number for pack objects.
pub const MAGIC: [u8; 4] = *b"PCK1";

/// Current format version.
pub const VERSION: u32 = 1;

const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 4 + DIGEST_LEN + 1;
const TRAILER_LEN: usize = 4;
const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// An entry encoded on the submitting task, ready to be copied into a pack.
#[derive(Debug, Clone)]
pub struct EncodedEntry {
    pub entry: Entry,
    pub bytes: Bytes,
    pub crc32c: u32,
}

impl EncodedEntry {
    pub fn new(entry: Entry) -> Result<Self> {
        let bytes = encode_entry(&entry)?;
        let crc32c = crc32c(&bytes);
        Ok(Self {
            entry,
            bytes,
            crc32c,
        })
    }
}

/// A decoded pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    pub prefix: Prefix,
    pub seq_no: u64,
    pub prev_digest: Digest,
    pub entries: Vec<Entry>,
}

/// A pack read back from storage together with its digest.
#[derive(Debug, Clone)]
pub struct StoredPack {
    pub pack: Pack,
    pub digest: Digest,
}

impl StoredPack {
    /// Timestamp of the last entry; entries are sorted, so also the largest.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.pack.entries.last().map(|e| e.timestamp)
    }
}

fn put_field(buf: &mut Vec<u8>, name: &str, field: &[u8]) -> Result<()> {
    if field.len() > MAX_FIELD_LEN {
        return Err(Error::InvalidEntry(format!(
            "{name} is {} bytes, limit is {MAX_FIELD_LEN}",
            field.len()
        )));
    }
    buf.put_u16_le(field.len() as u16);
    buf.put_slice(field);
    Ok(())
}

/// Encode one entry record.
pub fn encode_entry(entry: &Entry) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(
        DIGEST_LEN + 8 + 6 + entry.salt.len() + entry.signature.len() + entry.public_key.len(),
    );
    buf.put_slice(entry.digest.as_bytes());
    buf.put_u64_le(entry.timestamp.as_nanos());
    put_field(&mut buf, "salt", &entry.salt)?;
    put_field(&mut buf, "signature", &entry.signature)?;
    put_field(&mut buf, "public key", &entry.public_key)?;
    Ok(buf.into())
}

/// Encode the pack header.
pub fn encode_header(
    prefix: &Prefix,
    seq_no: u64,
    prev_digest: &Digest,
    entry_count: usize,
) -> Result<Vec<u8>> {
    let prefix_len = u8::try_from(prefix.len())
        .map_err(|_| Error::Config(format!("prefix {prefix:?} is too long")))?;
    let entry_count = u32::try_from(entry_count)
        .map_err(|_| Error::InvalidEntry(format!("{entry_count} entries in one pack")))?;
    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + prefix.len());
    buf.put_slice(&MAGIC);
    buf.put_u32_le(VERSION);
    buf.put_u64_le(seq_no);
    buf.put_u32_le(entry_count);
    buf.put_slice(prev_digest.as_bytes());
    buf.put_u8(prefix_len);
    buf.put_slice(prefix.as_str().as_bytes());
    Ok(buf)
}

/// Stream a pack into `writer` and commit it. Returns the pack digest and
/// the store's receipt.
///
/// Entry checksums were computed when the entries were submitted, so the
/// object CRC is assembled with combines instead of a rescan.
pub async fn write_pack(
    mut writer: Box<dyn ObjectWriter>,
    prefix: &Prefix,
    seq_no: u64,
    prev_digest: &Digest,
    entries: &[EncodedEntry],
) -> Result<(Digest, CommitReceipt)> {
    let header = encode_header(prefix, seq_no, prev_digest, entries.len())?;
    let mut hasher = Sha512::new();
    hasher.update(&header);
    writer.write(&header).await?;
    for e in entries {
        hasher.update(&e.bytes);
        writer.write_checksummed(&e.bytes, e.crc32c).await?;
    }
    let crc = writer.checksum();
    writer.write(&crc.to_le_bytes()).await?;

    let digest = Digest::from_slice(&hasher.finalize())?;
    let receipt = writer.commit_if_absent().await?;
    Ok((digest, receipt))
}

/// Encode a whole pack in memory.
pub fn encode_pack(pack: &Pack) -> Result<(Bytes, Digest)> {
    let mut buf = encode_header(&pack.prefix, pack.seq_no, &pack.prev_digest, pack.entries.len())?;
    for entry in &pack.entries {
        buf.extend_from_slice(&encode_entry(entry)?);
    }
    let digest = Digest::of(&buf);
    let crc = crc32c(&buf);
    buf.put_u32_le(crc);
    Ok((buf.into(), digest))
}

/// Decode and verify a stored pack. `name` only labels errors.
pub fn decode_pack(name: &str, data: &[u8]) -> Result<StoredPack> {
    let corrupt = |reason: String| Error::Corrupt {
        name: name.to_string(),
        reason,
    };
    if data.len() < FIXED_HEADER_LEN + TRAILER_LEN {
        return Err(corrupt(format!("{} bytes is too short", data.len())));
    }
    let (body, mut trailer) = data.split_at(data.len() - TRAILER_LEN);
    let expected = trailer.get_u32_le();
    let actual = crc32c(body);
    if expected != actual {
        return Err(corrupt(format!(
            "checksum mismatch: stored {expected:#010x}, computed {actual:#010x}"
        )));
    }

    let mut cur = body;
    if cur[..4] != MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    cur.advance(4);
    let version = cur.get_u32_le();
    if version > VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let seq_no = cur.get_u64_le();
    let entry_count = cur.get_u32_le() as usize;
    let prev_digest = Digest::from_slice(&cur[..DIGEST_LEN])?;
    cur.advance(DIGEST_LEN);
    let prefix_len = cur.get_u8() as usize;
    let prefix = take(&mut cur, prefix_len).ok_or_else(|| corrupt("truncated prefix".into()))?;
    let prefix = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| Prefix::new(s).ok())
        .ok_or_else(|| corrupt("prefix is not lowercase hex".into()))?;

    let mut entries = Vec::with_capacity(entry_count.min(cur.len() / DIGEST_LEN));
    for i in 0..entry_count {
        let entry = decode_entry(&mut cur).ok_or_else(|| corrupt(format!("truncated entry {i}")))?;
        entries.push(entry);
    }
    if !cur.is_empty() {
        return Err(corrupt(format!("{} trailing bytes", cur.len())));
    }

    Ok(StoredPack {
        pack: Pack {
            prefix,
            seq_no,
            prev_digest,
            entries,
        },
        digest: Digest::of(body),
    })
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if cur.len() < n {
        return None;
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Some(head)
}

fn take_field(cur: &mut &[u8]) -> Option<Vec<u8>> {
    if cur.len() < 2 {
        return None;
    }
    let len = cur.get_u16_le() as usize;
    take(cur, len).map(<[u8]>::to_vec)
}

fn decode_entry(cur: &mut &[u8]) -> Option<Entry> {
    let digest = Digest::from_slice(take(cur, DIGEST_LEN)?).ok()?;
    let ts = take(cur, 8)?;
    let timestamp = Timestamp::from_nanos(u64::from_le_bytes(ts.try_into().ok()?));
    Some(Entry {
        digest,
        timestamp,
        salt: take_field(cur)?,
        signature: take_field(cur)?,
        public_key: take_field(cur)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConditionalStore, ObjectStoreDriver};

    fn entry(n: u8, ts: u64) -> Entry {
        Entry::new(Digest::of(&[n]), vec![n; 16], Timestamp::from_nanos(ts))
            .with_signature(vec![0xAA; 64], vec![0xBB; 32])
    }

    fn sample_pack() -> Pack {
        Pack {
            prefix: Prefix::new("abcde").unwrap(),
            seq_no: 42,
            prev_digest: Digest::of(b"previous"),
            entries: vec![entry(1, 10), entry(2, 20), entry(3, 20)],
        }
    }

    #[test]
    fn test_encode_decode() {
        let pack = sample_pack();
        let (bytes, digest) = encode_pack(&pack).unwrap();
        let stored = decode_pack("p", &bytes).unwrap();
        assert_eq!(stored.pack, pack);
        assert_eq!(stored.digest, digest);
        assert_eq!(stored.last_timestamp(), Some(Timestamp::from_nanos(20)));
    }

    #[test]
    fn test_tampering_detected() {
        let (bytes, _) = encode_pack(&sample_pack()).unwrap();
        let mut flipped = bytes.to_vec();
        flipped[FIXED_HEADER_LEN + 10] ^= 1;
        assert!(matches!(decode_pack("p", &flipped), Err(Error::Corrupt { .. })));

        let truncated = &bytes[..bytes.len() - 9];
        assert!(matches!(decode_pack("p", truncated), Err(Error::Corrupt { .. })));
        assert!(matches!(decode_pack("p", b"PCK1"), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut e = entry(1, 1);
        e.signature = vec![0; MAX_FIELD_LEN + 1];
        assert!(matches!(encode_entry(&e), Err(Error::InvalidEntry(_))));
    }

    #[tokio::test]
    async fn test_write_pack_matches_in_memory_encoding() {
        let pack = sample_pack();
        let encoded: Vec<EncodedEntry> = pack
            .entries
            .iter()
            .cloned()
            .map(|e| EncodedEntry::new(e).unwrap())
            .collect();

        let store = ObjectStoreDriver::in_memory();
        let writer = store.open_for_create("abcde-x.pack").await.unwrap();
        let (digest, receipt) = write_pack(writer, &pack.prefix, pack.seq_no, &pack.prev_digest, &encoded)
            .await
            .unwrap();

        let (expected, expected_digest) = encode_pack(&pack).unwrap();
        let stored = store.read("abcde-x.pack").await.unwrap();
        assert_eq!(stored, expected);
        assert_eq!(digest, expected_digest);
        assert_eq!(receipt.size, expected.len() as u64);
        assert_eq!(receipt.crc32c, crc32c(&expected));
    }
}
