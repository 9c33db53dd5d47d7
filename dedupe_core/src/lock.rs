//! Striped per-digest locks.
//!
//! Every read-modify-write of a digest's metadata runs while holding the
//! stripe that digest maps to. Digests on different stripes never contend.

use crate::hash::Digest;
use parking_lot::{Mutex, MutexGuard};

/// Number of lock stripes.
pub const STRIPES: usize = 64;

/// A fixed table of mutexes selected by digest.
#[derive(Debug)]
pub struct DigestLocks {
    stripes: Vec<Mutex<()>>,
}

impl DigestLocks {
    /// Create a lock table with [`STRIPES`] stripes.
    pub fn new() -> Self {
        Self::with_stripes(STRIPES)
    }

    /// Create a lock table with `count` stripes (at least one).
    pub fn with_stripes(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// The stripe index for `digest`.
    pub fn stripe_of(&self, digest: &Digest) -> usize {
        let bytes = digest.as_bytes();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&bytes[..8]);
        (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize
    }

    /// Block until the stripe for `digest` is held.
    pub fn lock(&self, digest: &Digest) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(digest)].lock()
    }
}

impl Default for DigestLocks {
    fn default() -> Self {
        Self::new()
    }
}
