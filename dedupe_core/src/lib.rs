//! # Dedupe Core
//!
//! A deduplicating, reference-counted content-addressable store.
//!
//! Payloads are stored exactly once no matter how many owners reference the
//! same bytes. Each distinct payload gets a stable `u32` ID from the record
//! engine; an index maps the payload's digest to its ID and its list of
//! owners. Storage is reclaimed when the last owner lets go.
//!
//! ## Features
//!
//! - SHA-256 (default) or BLAKE3 content digests
//! - Set-like owner tracking per distinct payload
//! - Pluggable [`Index`] and [`RecordStore`] engines, with memory and disk
//!   implementations
//! - Striped per-digest locking so concurrent callers never lose references
//!   or leak records
//!
//! ## Example
//!
//! ```no_run
//! use dedupe_core::{Config, DedupeStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DedupeStore::open(&Config::new("./my-store"))?;
//!
//! let id = store.store(b"hello", "ownerA")?;
//! assert_eq!(store.store(b"hello", "ownerB")?, id);
//!
//! store.delete(id, "ownerA")?;
//! assert_eq!(store.get(id)?, b"hello");
//!
//! store.delete(id, "ownerB")?;
//! assert!(!store.id_exists(id)?);
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod fs;
mod hash;
mod index;
mod lock;
mod metadata;
mod record;
mod store;

pub use config::{Config, DEFAULT_MAX_VALUE_SIZE};
pub use error::{Error, Result};
pub use hash::{Algorithm, DIGEST_SIZE, Digest};
pub use index::{DiskIndex, Index, MemoryIndex};
pub use lock::DigestLocks;
pub use metadata::{Metadata, Reference};
pub use record::{DiskRecordStore, FIRST_ID, MemoryRecordStore, RecordStore};
pub use store::DedupeStore;
