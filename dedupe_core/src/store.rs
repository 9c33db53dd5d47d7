//! The deduplicating store: hashing and reference counting over two engines.

use crate::config::{Config, ConfigFile};
use crate::error::{Error, Result};
use crate::fs::write_atomic;
use crate::hash::{Algorithm, Digest};
use crate::index::{DiskIndex, Index, MemoryIndex};
use crate::lock::DigestLocks;
use crate::metadata::{Metadata, Reference};
use crate::record::{DiskRecordStore, MemoryRecordStore, RecordStore};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// A deduplicating, reference-counted content-addressable store.
///
/// Each distinct payload is kept once in the record store; the index maps its
/// digest to a [`Metadata`] record holding the payload's ID and owners. The
/// payload is physically removed when its last owner is deleted.
///
/// Operations take `&self` and may run concurrently. Read-modify-write
/// sequences on a digest's metadata are serialized through [`DigestLocks`].
///
/// Digest collisions are not detected: two payloads with the same digest
/// are treated as the same content.
pub struct DedupeStore {
    root: Option<PathBuf>,
    algorithm: Algorithm,
    max_value_size: usize,
    index: Box<dyn Index>,
    records: Box<dyn RecordStore>,
    locks: DigestLocks,
    closed: AtomicBool,
}

impl std::fmt::Debug for DedupeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeStore")
            .field("root", &self.root)
            .field("algorithm", &self.algorithm)
            .field("max_value_size", &self.max_value_size)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl DedupeStore {
    /// Open a store as described by `config`.
    ///
    /// Disk stores use this layout under the base path:
    /// - `config` file with version, algorithm and size limit
    /// - `index/` for the digest index
    /// - `records/` for payloads
    ///
    /// Reopening an existing store with a different algorithm or a smaller
    /// size limit fails. `reset` clears only these three entries; other
    /// files under the base path are left alone.
    pub fn open(config: &Config) -> Result<Self> {
        let Some(root) = config.path() else {
            let store = Self::with_engines(
                Box::new(MemoryIndex::new()),
                Box::new(MemoryRecordStore::new(config.max_size())),
                config.hash_algorithm(),
                config.max_size(),
            );
            info!(algorithm = store.algorithm.as_str(), "Opened in-memory dedupe store");
            return Ok(store);
        };

        // The base path may hold unrelated files; reset only removes what
        // the store owns (`config` here, `index/` and `records/` below).
        fs::create_dir_all(root)?;
        let config_path = root.join("config");
        if config.is_reset() {
            match fs::remove_file(&config_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Self::check_config_file(root, config)?;

        let config_file = ConfigFile {
            algorithm: config.hash_algorithm(),
            max_value_size: config.max_size(),
        };
        write_atomic(&config_path, &[config_file.render().as_bytes()])?;

        let index = DiskIndex::open(root.join("index"), config.is_reset())?;
        let records =
            DiskRecordStore::open(root.join("records"), config.is_reset(), config.max_size())?;

        let mut store = Self::with_engines(
            Box::new(index),
            Box::new(records),
            config.hash_algorithm(),
            config.max_size(),
        );
        store.root = Some(root.to_path_buf());

        info!(
            path = %root.display(),
            algorithm = store.algorithm.as_str(),
            max_value_size = store.max_value_size,
            reset = config.is_reset(),
            "Opened dedupe store"
        );
        Ok(store)
    }

    /// Build a store over caller-supplied engines.
    ///
    /// The store takes exclusive ownership of both engines and closes them in
    /// [`close`](Self::close) or on drop.
    pub fn with_engines(
        index: Box<dyn Index>,
        records: Box<dyn RecordStore>,
        algorithm: Algorithm,
        max_value_size: usize,
    ) -> Self {
        Self {
            root: None,
            algorithm,
            max_value_size,
            index,
            records,
            locks: DigestLocks::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_config_file(root: &Path, config: &Config) -> Result<()> {
        let content = match fs::read_to_string(root.join("config")) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let existing = ConfigFile::parse(&content)
            .map_err(|e| Error::invalid_store(root, format!("unreadable config: {}", e)))?;
        if existing.algorithm != config.hash_algorithm() {
            return Err(Error::invalid_store(
                root,
                format!(
                    "store uses {}, requested {}",
                    existing.algorithm.as_str(),
                    config.hash_algorithm().as_str()
                ),
            ));
        }
        // Records are decoded with the current limit as their bound, so it
        // must never drop below what was already written.
        if config.max_size() < existing.max_value_size {
            return Err(Error::invalid_store(
                root,
                format!(
                    "store holds payloads up to {} bytes, requested limit {}",
                    existing.max_value_size,
                    config.max_size()
                ),
            ));
        }
        Ok(())
    }

    /// Base storage path, `None` for memory-backed stores.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Largest accepted payload in bytes.
    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Digest `payload` with this store's algorithm.
    pub fn digest_of(&self, payload: &[u8]) -> Digest {
        self.algorithm.digest(payload)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn load_metadata(&self, digest: &Digest) -> Result<Option<Metadata>> {
        match self.index.get(&digest.index_key()) {
            Ok(bytes) => Metadata::decode(&bytes).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store `payload` on behalf of `reference` and return its ID.
    ///
    /// Content already present keeps its ID and gains `reference` as an
    /// owner; storing the same reference twice is a no-op. New content gets
    /// a fresh record and index entry.
    pub fn store(&self, payload: &[u8], reference: impl Into<Reference>) -> Result<u32> {
        self.ensure_open()?;
        if payload.len() > self.max_value_size {
            return Err(Error::size_exceeded(payload.len(), self.max_value_size));
        }

        let reference = reference.into();
        let digest = self.algorithm.digest(payload);
        let key = digest.index_key();

        let _guard = self.locks.lock(&digest);
        match self.load_metadata(&digest)? {
            Some(mut metadata) => {
                if metadata.add_reference(reference) {
                    self.index.update(&key, &metadata.encode())?;
                }
                debug!(
                    %digest,
                    id = metadata.id,
                    references = metadata.references.len(),
                    "Deduplicated payload"
                );
                Ok(metadata.id)
            }
            None => {
                let id = self.records.insert(payload)?;
                let metadata = Metadata::new(id, reference);
                self.index.set(&key, &metadata.encode())?;
                debug!(%digest, id, size = payload.len(), "Stored new payload");
                Ok(id)
            }
        }
    }

    /// Read the payload stored under `id`.
    pub fn get(&self, id: u32) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.records.get(id)
    }

    /// Read the payload whose content has `digest`.
    pub fn get_from_hash(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let metadata = self
            .load_metadata(digest)?
            .ok_or_else(|| Error::not_found(format!("digest {}", digest)))?;
        self.records.get(metadata.id)
    }

    /// Like [`get_from_hash`](Self::get_from_hash), taking a hex digest.
    pub fn get_from_hex(&self, digest: &str) -> Result<Vec<u8>> {
        self.get_from_hash(&Digest::from_hex(digest)?)
    }

    /// Whether a payload exists under `id`.
    pub fn id_exists(&self, id: u32) -> Result<bool> {
        self.ensure_open()?;
        match self.records.get(id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether content with `digest` is stored.
    pub fn hash_exists(&self, digest: &Digest) -> Result<bool> {
        self.ensure_open()?;
        match self.index.get(&digest.index_key()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The metadata recorded for `digest`, if any.
    pub fn metadata(&self, digest: &Digest) -> Result<Option<Metadata>> {
        self.ensure_open()?;
        self.load_metadata(digest)
    }

    /// The current owners of the content stored under `id`.
    pub fn references(&self, id: u32) -> Result<Vec<Reference>> {
        self.ensure_open()?;
        let digest = self.algorithm.digest(&self.records.get(id)?);
        match self.load_metadata(&digest)? {
            Some(metadata) if metadata.id == id => Ok(metadata.references),
            _ => Err(Error::corrupted(format!(
                "record {} has no matching metadata for digest {}",
                id, digest
            ))),
        }
    }

    /// Release `reference`'s hold on the content stored under `id`.
    ///
    /// When the last reference goes, the index entry and then the record are
    /// deleted.
    pub fn delete(&self, id: u32, reference: impl Into<Reference>) -> Result<()> {
        self.ensure_open()?;
        let reference = reference.into();

        // No reverse index exists; the digest is re-derived from the content.
        let payload = self.records.get(id)?;
        let digest = self.algorithm.digest(&payload);
        let key = digest.index_key();

        let _guard = self.locks.lock(&digest);
        let mut metadata = match self.load_metadata(&digest)? {
            Some(metadata) if metadata.id == id => metadata,
            // A concurrent delete may have reclaimed the record (and the
            // content may have been stored again) while we waited.
            _ if !self.id_exists(id)? => {
                return Err(Error::not_found(format!("record {}", id)));
            }
            Some(metadata) => {
                return Err(Error::corrupted(format!(
                    "digest {} maps to id {}, not {}",
                    digest, metadata.id, id
                )));
            }
            None => {
                return Err(Error::corrupted(format!(
                    "record {} has no metadata for digest {}",
                    id, digest
                )));
            }
        };

        metadata.remove_reference(&reference)?;

        if metadata.is_orphaned() {
            self.index.delete(&key)?;
            self.records.delete(id)?;
            debug!(%digest, id, size = payload.len(), "Reclaimed payload");
        } else {
            self.index.update(&key, &metadata.encode())?;
            debug!(
                %digest,
                id,
                references = metadata.references.len(),
                "Released reference"
            );
        }
        Ok(())
    }

    /// Close both engines.
    ///
    /// Both closes are attempted; an index failure is reported in preference
    /// to a record store failure. A second call returns [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        let index_result = self.index.close();
        let records_result = self.records.close();

        match (&index_result, &records_result) {
            (Ok(()), Ok(())) => info!(path = ?self.root, "Closed dedupe store"),
            _ => warn!(
                path = ?self.root,
                index_error = ?index_result.as_ref().err(),
                records_error = ?records_result.as_ref().err(),
                "Closed dedupe store with errors"
            ),
        }

        index_result.and(records_result)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DedupeStore {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Err(e) = self.close()
        {
            warn!(error = %e, "Failed to close dedupe store on drop");
        }
    }
}
