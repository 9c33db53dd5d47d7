//! Per-digest metadata and its binary encoding.
//!
//! Metadata is stored in the index as a 16-byte header followed by the
//! length-prefixed references:
//!
//! ```text
//! 0x00  4   "DDMD" magic
//! 0x04  1   version (u8) = 1
//! 0x05  3   reserved (must be 0)
//! 0x08  4   id (u32 LE)
//! 0x0C  4   reference count (u32 LE)
//! 0x10  ... references: len (u32 LE) + bytes, repeated
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Magic bytes at the start of every encoded metadata record.
pub const MAGIC: &[u8; 4] = b"DDMD";

/// Current metadata format version.
pub const VERSION: u8 = 1;

/// Size of the fixed metadata header in bytes.
pub const HEADER_SIZE: usize = 16;

/// An opaque owner token.
///
/// The store only compares and serializes references; it never looks inside.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference(Vec<u8>);

impl Reference {
    /// Create a reference from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Reference(bytes.into())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Reference {
    fn from(s: &str) -> Self {
        Reference(s.as_bytes().to_vec())
    }
}

impl From<String> for Reference {
    fn from(s: String) -> Self {
        Reference(s.into_bytes())
    }
}

impl From<&[u8]> for Reference {
    fn from(bytes: &[u8]) -> Self {
        Reference(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Reference {
    fn from(bytes: Vec<u8>) -> Self {
        Reference(bytes)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self)
    }
}

/// The record kept in the index for each distinct digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Record store ID holding the payload.
    pub id: u32,
    /// Current owners, in insertion order.
    pub references: Vec<Reference>,
}

impl Metadata {
    /// Create metadata for freshly stored content with its first owner.
    pub fn new(id: u32, reference: Reference) -> Self {
        Self {
            id,
            references: vec![reference],
        }
    }

    /// Add a reference. Returns `false` if it was already present.
    pub fn add_reference(&mut self, reference: Reference) -> bool {
        if self.references.contains(&reference) {
            return false;
        }
        self.references.push(reference);
        true
    }

    /// Remove a reference.
    pub fn remove_reference(&mut self, reference: &Reference) -> Result<()> {
        match self.references.iter().position(|r| r == reference) {
            Some(pos) => {
                self.references.remove(pos);
                Ok(())
            }
            None => Err(Error::reference_not_found(self.id, reference.to_string())),
        }
    }

    /// Whether no owners remain.
    pub fn is_orphaned(&self) -> bool {
        self.references.is_empty()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let refs_len: usize = self.references.iter().map(|r| 4 + r.0.len()).sum();
        let mut buf = Vec::with_capacity(HEADER_SIZE + refs_len);

        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(self.references.len() as u32).to_le_bytes());

        for reference in &self.references {
            buf.extend_from_slice(&(reference.0.len() as u32).to_le_bytes());
            buf.extend_from_slice(&reference.0);
        }

        buf
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "Metadata too short: {} bytes (expected at least {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted(format!(
                "Invalid metadata magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        if buf[4] != VERSION {
            return Err(Error::corrupted(format!(
                "Unsupported metadata version: {} (expected {})",
                buf[4], VERSION
            )));
        }

        if buf[5..8] != [0u8; 3] {
            return Err(Error::corrupted("Reserved metadata bytes must be 0"));
        }

        let id = read_u32(buf, 8)?;
        let count = read_u32(buf, 12)? as usize;

        let mut references = Vec::new();
        let mut offset = HEADER_SIZE;
        for _ in 0..count {
            let len = read_u32(buf, offset)? as usize;
            offset += 4;
            let end = offset
                .checked_add(len)
                .filter(|end| *end <= buf.len())
                .ok_or_else(|| {
                    Error::corrupted(format!(
                        "Reference at offset {} overruns metadata ({} bytes)",
                        offset,
                        buf.len()
                    ))
                })?;
            references.push(Reference(buf[offset..end].to_vec()));
            offset = end;
        }

        if offset != buf.len() {
            return Err(Error::corrupted(format!(
                "Trailing metadata bytes: {}",
                buf.len() - offset
            )));
        }

        Ok(Self { id, references })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::corrupted(format!("Truncated metadata at offset {}", offset)))
}
