//! Filesystem helpers shared by the disk engines.

use crate::error::Result;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `parts` to `path` atomically using tempfile.
///
/// The parent directory is created if needed.
pub(crate) fn write_atomic(path: &Path, parts: &[&[u8]]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    for part in parts {
        temp_file.write_all(part)?;
    }
    temp_file.flush()?;
    temp_file.as_file().sync_data()?;

    temp_file.persist(path)?;
    Ok(())
}

/// Create `dir`, wiping any existing contents first when `reset` is set.
pub(crate) fn prepare_dir(dir: &Path, reset: bool) -> Result<()> {
    if reset && dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove a shard directory if it is empty.
pub(crate) fn remove_empty_dir(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir)
        && entries.next().is_none()
    {
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("file");

        write_atomic(&path, &[b"hello ", b"world"]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello world");

        write_atomic(&path, &[b"replaced"]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"replaced");
    }

    #[test]
    fn test_prepare_dir_reset() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("engine");
        prepare_dir(&dir, false).unwrap();
        fs::write(dir.join("stale"), b"x").unwrap();

        prepare_dir(&dir, false).unwrap();
        assert!(dir.join("stale").exists());

        prepare_dir(&dir, true).unwrap();
        assert!(dir.exists());
        assert!(!dir.join("stale").exists());
    }

    #[test]
    fn test_remove_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        let full = temp_dir.path().join("full");
        let empty = temp_dir.path().join("empty");
        fs::create_dir_all(&full).unwrap();
        fs::create_dir_all(&empty).unwrap();
        fs::write(full.join("f"), b"x").unwrap();

        remove_empty_dir(&full);
        remove_empty_dir(&empty);

        assert!(full.exists());
        assert!(!empty.exists());
    }
}
