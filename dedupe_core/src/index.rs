//! The index engine: an ordered key-value map from digest keys to metadata.
//!
//! The store only relies on point operations; key ordering is an engine
//! property it never depends on.

use crate::error::{Error, Result};
use crate::fs::{prepare_dir, remove_empty_dir, write_atomic};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest key the disk index accepts (non-hex keys are hex-encoded into
/// file names).
pub const MAX_DISK_KEY_LEN: usize = 120;

/// Key-value engine holding serialized metadata.
pub trait Index: Send + Sync {
    /// Read the value for `key`. Fails with `NotFound` if absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Insert a new key. Fails with `AlreadyExists` if present.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Replace the value of an existing key. Fails with `NotFound` if absent.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key. Fails with `NotFound` if absent.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Release engine resources. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;
}

impl<T: Index + ?Sized> Index for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).update(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        (**self).delete(key)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

fn key_name(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// `BTreeMap`-backed index for tests and embedding.
#[derive(Debug)]
pub struct MemoryIndex {
    entries: RwLock<Option<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryIndex {
    /// Create an empty, open index.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Some(BTreeMap::new())),
        }
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.read().as_ref().map_or(0, BTreeMap::len)
    }

    /// Whether the index holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Index for MemoryIndex {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = self.entries.read();
        let entries = guard.as_ref().ok_or(Error::Closed)?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("index key {}", key_name(key))))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.entries.write();
        let entries = guard.as_mut().ok_or(Error::Closed)?;
        if entries.contains_key(key) {
            return Err(Error::already_exists(key_name(key)));
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.entries.write();
        let entries = guard.as_mut().ok_or(Error::Closed)?;
        match entries.get_mut(key) {
            Some(existing) => {
                *existing = value.to_vec();
                Ok(())
            }
            None => Err(Error::not_found(format!("index key {}", key_name(key)))),
        }
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.entries.write();
        let entries = guard.as_mut().ok_or(Error::Closed)?;
        entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("index key {}", key_name(key))))
    }

    fn close(&self) -> Result<()> {
        self.entries.write().take().map(|_| ()).ok_or(Error::Closed)
    }
}

/// File-per-key index stored under a directory.
///
/// Layout depends on the key:
/// - lowercase hex keys of two or more chars (digest keys) live at
///   `{dir}/{key[..2]}/h{key}`, giving 256 shards
/// - any other key lives at `{dir}/{hex(key[0])}/k{hex(key)}`, with shard
///   `00` for the empty key
///
/// Writes are atomic.
#[derive(Debug)]
pub struct DiskIndex {
    dir: RwLock<Option<PathBuf>>,
}

impl DiskIndex {
    /// Open the index at `dir`, wiping it first if `reset` is set.
    pub fn open<P: AsRef<Path>>(dir: P, reset: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        prepare_dir(&dir, reset)?;
        tracing::debug!(path = %dir.display(), reset, "Opened disk index");
        Ok(Self {
            dir: RwLock::new(Some(dir)),
        })
    }

    fn key_path(dir: &Path, key: &[u8]) -> Result<PathBuf> {
        if key.len() > MAX_DISK_KEY_LEN {
            return Err(Error::invalid_store(
                dir,
                format!(
                    "index key of {} bytes exceeds {} bytes",
                    key.len(),
                    MAX_DISK_KEY_LEN
                ),
            ));
        }
        if let Some(name) = lower_hex(key)
            && name.len() >= 2
        {
            return Ok(dir.join(&name[..2]).join(format!("h{}", name)));
        }
        let shard = match key.first() {
            Some(byte) => hex::encode([*byte]),
            None => "00".to_string(),
        };
        Ok(dir.join(shard).join(format!("k{}", hex::encode(key))))
    }
}

/// The key as a `str` if it is entirely lowercase hex.
fn lower_hex(key: &[u8]) -> Option<&str> {
    if key.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        std::str::from_utf8(key).ok()
    } else {
        None
    }
}

impl Index for DiskIndex {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = self.dir.read();
        let dir = guard.as_ref().ok_or(Error::Closed)?;
        let path = Self::key_path(dir, key)?;
        match fs::read(&path) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("index key {}", key_name(key))))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.dir.write();
        let dir = guard.as_ref().ok_or(Error::Closed)?;
        let path = Self::key_path(dir, key)?;
        if path.exists() {
            return Err(Error::already_exists(key_name(key)));
        }
        write_atomic(&path, &[value])
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.dir.write();
        let dir = guard.as_ref().ok_or(Error::Closed)?;
        let path = Self::key_path(dir, key)?;
        if !path.exists() {
            return Err(Error::not_found(format!("index key {}", key_name(key))));
        }
        write_atomic(&path, &[value])
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let guard = self.dir.write();
        let dir = guard.as_ref().ok_or(Error::Closed)?;
        let path = Self::key_path(dir, key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(shard) = path.parent() {
                    remove_empty_dir(shard);
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("index key {}", key_name(key))))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        let dir = self.dir.write().take().ok_or(Error::Closed)?;
        tracing::debug!(path = %dir.display(), "Closed disk index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use tempfile::TempDir;

    fn exercise(index: &dyn Index) {
        assert!(index.get(b"a").unwrap_err().is_not_found());

        index.set(b"a", b"one").unwrap();
        assert_eq!(index.get(b"a").unwrap(), b"one");
        assert!(matches!(
            index.set(b"a", b"two"),
            Err(Error::AlreadyExists { .. })
        ));

        index.update(b"a", b"two").unwrap();
        assert_eq!(index.get(b"a").unwrap(), b"two");
        assert!(index.update(b"b", b"x").unwrap_err().is_not_found());

        index.delete(b"a").unwrap();
        assert!(index.get(b"a").unwrap_err().is_not_found());
        assert!(index.delete(b"a").unwrap_err().is_not_found());

        index.set(b"", b"empty key").unwrap();
        assert_eq!(index.get(b"").unwrap(), b"empty key");

        index.close().unwrap();
        assert!(matches!(index.get(b""), Err(Error::Closed)));
        assert!(matches!(index.set(b"c", b"x"), Err(Error::Closed)));
        assert!(matches!(index.close(), Err(Error::Closed)));
    }

    #[test]
    fn test_memory_index() {
        exercise(&MemoryIndex::new());
    }

    #[test]
    fn test_disk_index() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&DiskIndex::open(temp_dir.path().join("index"), false).unwrap());
    }

    #[test]
    fn test_memory_index_len() {
        let index = MemoryIndex::new();
        assert!(index.is_empty());
        index.set(b"k", b"v").unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_disk_index_persists_across_open() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("index");

        let index = DiskIndex::open(&dir, false).unwrap();
        index.set(b"key", b"value").unwrap();
        index.close().unwrap();

        let index = DiskIndex::open(&dir, false).unwrap();
        assert_eq!(index.get(b"key").unwrap(), b"value");
        index.close().unwrap();

        let index = DiskIndex::open(&dir, true).unwrap();
        assert!(index.get(b"key").unwrap_err().is_not_found());
    }

    #[test]
    fn test_disk_index_removes_empty_shard() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("index");
        let index = DiskIndex::open(&dir, false).unwrap();

        index.set(b"key", b"value").unwrap();
        let shard = dir.join(hex::encode(b"k"));
        assert!(shard.exists());

        index.delete(b"key").unwrap();
        assert!(!shard.exists());
    }

    #[test]
    fn test_disk_index_shards_hex_keys_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("index");
        let index = DiskIndex::open(&dir, false).unwrap();

        let key = Algorithm::Sha256.digest(b"hello").index_key();
        index.set(&key, b"value").unwrap();

        let name = std::str::from_utf8(&key).unwrap();
        let path = dir.join(&name[..2]).join(format!("h{}", name));
        assert_eq!(fs::read(&path).unwrap(), b"value");
        assert_eq!(index.get(&key).unwrap(), b"value");

        // Uppercase hex is not a digest key and keeps the encoded layout.
        index.set(b"AB", b"other").unwrap();
        assert!(dir.join("41").join(format!("k{}", hex::encode(b"AB"))).exists());
        // A one-char hex key is too short to shard on.
        index.set(b"a", b"short").unwrap();
        assert!(dir.join("61").join("k61").exists());

        index.delete(&key).unwrap();
        assert!(!path.exists());
        assert!(!dir.join(&name[..2]).exists());
    }

    #[test]
    fn test_disk_index_rejects_long_key() {
        let temp_dir = TempDir::new().unwrap();
        let index = DiskIndex::open(temp_dir.path(), false).unwrap();
        let key = vec![b'x'; MAX_DISK_KEY_LEN + 1];
        assert!(matches!(
            index.set(&key, b"v"),
            Err(Error::InvalidStore { .. })
        ));
    }
}
