//! Content hashing using SHA-256 or BLAKE3.

use crate::error::{Error, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Digest size in bytes (both algorithms produce 256-bit hashes).
pub const DIGEST_SIZE: usize = 32;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Algorithm {
    /// SHA-256.
    #[default]
    Sha256,
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "blake3-256" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Hash a payload with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Digest {
        match self {
            Algorithm::Sha256 => Digest(Sha256::digest(data).into()),
            Algorithm::Blake3 => Digest(*blake3::hash(data).as_bytes()),
        }
    }
}

/// A 32-byte content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Create a Digest from raw bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    /// Create a Digest from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != DIGEST_SIZE * 2 {
            return Err(Error::invalid_digest(format!(
                "Expected {} hex characters, got {}",
                DIGEST_SIZE * 2,
                hex_str.len()
            )));
        }

        let mut digest = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(hex_str, &mut digest)
            .map_err(|e| Error::invalid_digest(format!("Invalid hex: {}", e)))?;
        Ok(Digest(digest))
    }

    /// Convert to lowercase hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The Index key for this digest: the bytes of its hex rendering.
    pub fn index_key(&self) -> Vec<u8> {
        self.to_hex().into_bytes()
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}
