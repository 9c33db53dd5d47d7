//! The record engine: auto-incrementing IDs mapped to immutable payloads.
//!
//! Disk records are stored with a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "DDRS" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   compression: 0=none, 1=zstd
//! 0x06  2   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  ... payload
//! ```

use crate::error::{Error, Result};
use crate::fs::{prepare_dir, remove_empty_dir, write_atomic};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes at the start of every record file.
pub const MAGIC: &[u8; 4] = b"DDRS";

/// Current record format version.
pub const VERSION: u8 = 1;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Compression threshold: payloads >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// The first ID handed out by a fresh record store.
pub const FIRST_ID: u32 = 1;

/// Binary record engine with store-assigned IDs.
pub trait RecordStore: Send + Sync {
    /// Store `data` and return its newly assigned ID.
    ///
    /// IDs are strictly increasing and never reused.
    fn insert(&self, data: &[u8]) -> Result<u32>;

    /// Read the payload for `id`. Fails with `NotFound` if absent.
    fn get(&self, id: u32) -> Result<Vec<u8>>;

    /// Remove the payload for `id`. Fails with `NotFound` if absent.
    fn delete(&self, id: u32) -> Result<()>;

    /// Release engine resources. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;
}

impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    fn insert(&self, data: &[u8]) -> Result<u32> {
        (**self).insert(data)
    }

    fn get(&self, id: u32) -> Result<Vec<u8>> {
        (**self).get(id)
    }

    fn delete(&self, id: u32) -> Result<()> {
        (**self).delete(id)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Counter value once `u32::MAX` has been handed out.
const ID_LIMIT: u64 = u32::MAX as u64 + 1;

/// The ID a counter at `next_id` hands out next. Every `u32` from
/// [`FIRST_ID`] through `u32::MAX` is issued once.
fn id_at(next_id: u64) -> Result<u32> {
    u32::try_from(next_id).map_err(|_| Error::corrupted("record ID space exhausted"))
}

fn check_size(data: &[u8], max_record_size: usize) -> Result<()> {
    if data.len() > max_record_size {
        return Err(Error::size_exceeded(data.len(), max_record_size));
    }
    Ok(())
}

#[derive(Debug)]
struct MemoryRecords {
    records: HashMap<u32, Vec<u8>>,
    next_id: u64,
}

/// `HashMap`-backed record store for tests and embedding.
#[derive(Debug)]
pub struct MemoryRecordStore {
    max_record_size: usize,
    state: RwLock<Option<MemoryRecords>>,
}

impl MemoryRecordStore {
    /// Create an empty, open record store.
    pub fn new(max_record_size: usize) -> Self {
        Self {
            max_record_size,
            state: RwLock::new(Some(MemoryRecords {
                records: HashMap::new(),
                next_id: u64::from(FIRST_ID),
            })),
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.read().as_ref().map_or(0, |s| s.records.len())
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, data: &[u8]) -> Result<u32> {
        check_size(data, self.max_record_size)?;
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::Closed)?;
        let id = id_at(state.next_id)?;
        state.next_id += 1;
        state.records.insert(id, data.to_vec());
        Ok(id)
    }

    fn get(&self, id: u32) -> Result<Vec<u8>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("record {}", id)))
    }

    fn delete(&self, id: u32) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::Closed)?;
        state
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("record {}", id)))
    }

    fn close(&self) -> Result<()> {
        self.state.write().take().map(|_| ()).ok_or(Error::Closed)
    }
}

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::corrupted(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }
}

/// A 16-byte record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Compression applied to the stored payload.
    pub compression: CompressionType,
    /// Length of the stored payload in bytes.
    pub payload_len: u64,
}

impl RecordHeader {
    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.compression as u8;
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "Record header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted(format!(
                "Invalid record magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        if buf[4] != VERSION {
            return Err(Error::corrupted(format!(
                "Unsupported record version: {} (expected {})",
                buf[4], VERSION
            )));
        }

        let compression = CompressionType::from_u8(buf[5])?;

        if buf[6] != 0 || buf[7] != 0 {
            return Err(Error::corrupted("Reserved record bytes must be 0"));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);

        Ok(Self {
            compression,
            payload_len: u64::from_le_bytes(len_bytes),
        })
    }
}

#[derive(Debug)]
struct DiskRecords {
    dir: PathBuf,
    next_id: u64,
}

impl DiskRecords {
    fn record_path(&self, id: u32) -> PathBuf {
        self.dir
            .join(format!("{:02x}", id & 0xff))
            .join(id.to_string())
    }

    fn counter_path(dir: &Path) -> PathBuf {
        dir.join("next_id")
    }
}

/// File-per-record store under a directory.
///
/// Layout: `{dir}/{id & 0xff as hex}/{id}` plus a `next_id` counter file,
/// which is persisted before the record so IDs survive restarts unreused.
#[derive(Debug)]
pub struct DiskRecordStore {
    max_record_size: usize,
    state: RwLock<Option<DiskRecords>>,
}

impl DiskRecordStore {
    /// Open the record store at `dir`, wiping it first if `reset` is set.
    pub fn open<P: AsRef<Path>>(dir: P, reset: bool, max_record_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        prepare_dir(&dir, reset)?;

        let counter_path = DiskRecords::counter_path(&dir);
        let next_id = match fs::read_to_string(&counter_path) {
            Ok(content) => content
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|next_id| *next_id <= ID_LIMIT)
                .ok_or_else(|| {
                    Error::invalid_store(&dir, format!("Invalid next_id: {:?}", content.trim()))
                })?,
            Err(e) if e.kind() == ErrorKind::NotFound => u64::from(FIRST_ID),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %dir.display(), reset, next_id, "Opened disk record store");
        Ok(Self {
            max_record_size,
            state: RwLock::new(Some(DiskRecords { dir, next_id })),
        })
    }
}

impl RecordStore for DiskRecordStore {
    fn insert(&self, data: &[u8]) -> Result<u32> {
        check_size(data, self.max_record_size)?;

        let (payload, compression) = if data.len() >= COMPRESSION_THRESHOLD {
            (compress_zstd(data)?, CompressionType::Zstd)
        } else {
            (data.to_vec(), CompressionType::None)
        };
        let header = RecordHeader {
            compression,
            payload_len: payload.len() as u64,
        };

        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::Closed)?;

        let id = id_at(state.next_id)?;
        let next_id = state.next_id + 1;
        write_atomic(
            &DiskRecords::counter_path(&state.dir),
            &[next_id.to_string().as_bytes()],
        )?;
        state.next_id = next_id;

        write_atomic(&state.record_path(id), &[&header.encode()[..], &payload[..]])?;
        Ok(id)
    }

    fn get(&self, id: u32) -> Result<Vec<u8>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        let path = state.record_path(id);

        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("record {}", id)));
            }
            Err(e) => return Err(e.into()),
        };

        let header = RecordHeader::decode(&buf)?;
        let stored = &buf[HEADER_SIZE..];
        if stored.len() as u64 != header.payload_len {
            return Err(Error::corrupted(format!(
                "Record {} payload length mismatch: expected {}, got {}",
                id,
                header.payload_len,
                stored.len()
            )));
        }

        match header.compression {
            CompressionType::None => Ok(stored.to_vec()),
            CompressionType::Zstd => decompress_zstd(stored, self.max_record_size),
        }
    }

    fn delete(&self, id: u32) -> Result<()> {
        let guard = self.state.write();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        let path = state.record_path(id);

        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(shard) = path.parent() {
                    remove_empty_dir(shard);
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("record {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        let state = self.state.write().take().ok_or(Error::Closed)?;
        tracing::debug!(
            path = %state.dir.display(),
            next_id = state.next_id,
            "Closed disk record store"
        );
        Ok(())
    }
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3).map_err(Error::from)
}

/// Decompress at most `max_record_size` bytes; anything longer is corrupt.
fn decompress_zstd(data: &[u8], max_record_size: usize) -> Result<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(data)?;
    let mut out = Vec::new();
    decoder
        .take(max_record_size as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > max_record_size {
        return Err(Error::corrupted(format!(
            "Decompressed record exceeds {} bytes",
            max_record_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX: usize = 1024 * 1024;

    fn exercise(records: &dyn RecordStore) {
        let id1 = records.insert(b"first").unwrap();
        let id2 = records.insert(b"second").unwrap();
        assert_eq!(id1, FIRST_ID);
        assert_eq!(id2, FIRST_ID + 1);

        assert_eq!(records.get(id1).unwrap(), b"first");
        assert_eq!(records.get(id2).unwrap(), b"second");
        assert!(records.get(99).unwrap_err().is_not_found());

        records.delete(id1).unwrap();
        assert!(records.get(id1).unwrap_err().is_not_found());
        assert!(records.delete(id1).unwrap_err().is_not_found());

        // Deleted IDs are never handed out again.
        let id3 = records.insert(b"third").unwrap();
        assert_eq!(id3, FIRST_ID + 2);

        let empty = records.insert(b"").unwrap();
        assert_eq!(records.get(empty).unwrap(), b"");

        records.close().unwrap();
        assert!(matches!(records.get(id2), Err(Error::Closed)));
        assert!(matches!(records.insert(b"x"), Err(Error::Closed)));
        assert!(matches!(records.close(), Err(Error::Closed)));
    }

    #[test]
    fn test_memory_record_store() {
        exercise(&MemoryRecordStore::new(MAX));
    }

    #[test]
    fn test_disk_record_store() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&DiskRecordStore::open(temp_dir.path().join("records"), false, MAX).unwrap());
    }

    #[test]
    fn test_max_record_size() {
        let records = MemoryRecordStore::new(4);
        records.insert(b"four").unwrap();
        assert!(matches!(
            records.insert(b"fives"),
            Err(Error::SizeExceeded { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_disk_ids_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");

        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        let id = records.insert(b"data").unwrap();
        records.delete(id).unwrap();
        records.close().unwrap();

        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        assert_eq!(records.insert(b"more").unwrap(), id + 1);
        records.close().unwrap();

        let records = DiskRecordStore::open(&dir, true, MAX).unwrap();
        assert_eq!(records.insert(b"fresh").unwrap(), FIRST_ID);
    }

    #[test]
    fn test_disk_large_record_is_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");
        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();

        let data = vec![b'a'; 64 * 1024];
        let id = records.insert(&data).unwrap();

        let raw = fs::read(dir.join(format!("{:02x}", id & 0xff)).join(id.to_string())).unwrap();
        let header = RecordHeader::decode(&raw).unwrap();
        assert_eq!(header.compression, CompressionType::Zstd);
        assert!(raw.len() < data.len());

        assert_eq!(records.get(id).unwrap(), data);
    }

    #[test]
    fn test_disk_corruption_detection() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");
        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        let id = records.insert(b"payload").unwrap();

        let path = dir.join(format!("{:02x}", id & 0xff)).join(id.to_string());
        let mut raw = fs::read(&path).unwrap();
        raw.push(0);
        fs::write(&path, raw).unwrap();

        assert!(matches!(records.get(id), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_invalid_counter_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("next_id"), "not a number").unwrap();

        assert!(matches!(
            DiskRecordStore::open(&dir, false, MAX),
            Err(Error::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_memory_issues_last_id() {
        let records = MemoryRecordStore::new(MAX);
        records.state.write().as_mut().unwrap().next_id = u64::from(u32::MAX);

        let id = records.insert(b"last").unwrap();
        assert_eq!(id, u32::MAX);
        assert_eq!(records.get(id).unwrap(), b"last");
        assert!(matches!(
            records.insert(b"one more"),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_disk_issues_last_id() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("next_id"), u32::MAX.to_string()).unwrap();

        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        let id = records.insert(b"last").unwrap();
        assert_eq!(id, u32::MAX);
        assert_eq!(records.get(id).unwrap(), b"last");
        assert!(matches!(
            records.insert(b"one more"),
            Err(Error::Corrupted { .. })
        ));
        records.close().unwrap();

        // The spent counter still opens, and still refuses to allocate.
        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        assert!(matches!(
            records.insert(b"again"),
            Err(Error::Corrupted { .. })
        ));
        records.close().unwrap();

        fs::write(dir.join("next_id"), (ID_LIMIT + 1).to_string()).unwrap();
        assert!(matches!(
            DiskRecordStore::open(&dir, false, MAX),
            Err(Error::InvalidStore { .. })
        ));
    }

    #[test]
    fn test_disk_decompression_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("records");

        let records = DiskRecordStore::open(&dir, false, MAX).unwrap();
        let data = vec![b'z'; 64 * 1024];
        let id = records.insert(&data).unwrap();
        records.close().unwrap();

        let records = DiskRecordStore::open(&dir, false, 1024).unwrap();
        assert!(matches!(records.get(id), Err(Error::Corrupted { .. })));
        records.close().unwrap();

        let records = DiskRecordStore::open(&dir, false, data.len()).unwrap();
        assert_eq!(records.get(id).unwrap(), data);
    }

    #[test]
    fn test_header_decode_rejects_bad_input() {
        let header = RecordHeader {
            compression: CompressionType::None,
            payload_len: 5,
        };
        let mut buf = header.encode();
        assert_eq!(RecordHeader::decode(&buf).unwrap(), header);

        assert!(RecordHeader::decode(&buf[..8]).is_err());

        buf[5] = 9;
        assert!(RecordHeader::decode(&buf).is_err());

        buf[5] = 0;
        buf[0] = b'X';
        assert!(RecordHeader::decode(&buf).is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Compression is transparent to readers on both sides of the threshold.
        #[test]
        fn prop_disk_payload_preserved(data in prop::collection::vec(any::<u8>(), 0..10_000)) {
            let temp_dir = TempDir::new().unwrap();
            let records = DiskRecordStore::open(temp_dir.path(), false, MAX)?;
            let id = records.insert(&data)?;
            prop_assert_eq!(records.get(id)?, data);
        }
    }
}
