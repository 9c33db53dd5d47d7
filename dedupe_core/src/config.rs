//! Store configuration and the on-disk `config` file.

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use std::path::{Path, PathBuf};

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Config file format version.
pub const CONFIG_VERSION: &str = "1";

/// Construction-time settings for a [`DedupeStore`](crate::DedupeStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    path: Option<PathBuf>,
    reset: bool,
    max_value_size: usize,
    algorithm: Algorithm,
}

impl Config {
    /// Disk-backed store rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            reset: false,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            algorithm: Algorithm::default(),
        }
    }

    /// Memory-backed store; nothing touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            reset: false,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            algorithm: Algorithm::default(),
        }
    }

    /// Wipe any existing state on open.
    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Largest accepted payload in bytes.
    pub fn max_value_size(mut self, max_value_size: usize) -> Self {
        self.max_value_size = max_value_size;
        self
    }

    /// Digest algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Base storage path, `None` for memory-backed stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether existing state is wiped on open.
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Largest accepted payload in bytes.
    pub fn max_size(&self) -> usize {
        self.max_value_size
    }

    /// Digest algorithm.
    pub fn hash_algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

/// The persisted subset of [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConfigFile {
    pub algorithm: Algorithm,
    pub max_value_size: usize,
}

impl ConfigFile {
    pub fn render(&self) -> String {
        format!(
            "version={}\nalgo={}\nmax_value_size={}\n",
            CONFIG_VERSION,
            self.algorithm.as_str(),
            self.max_value_size
        )
    }

    /// Parse `key=value` lines; blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut algo = None;
        let mut max_value_size = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    "max_value_size" => max_value_size = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some(CONFIG_VERSION) {
            return Err(Error::corrupted(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        let algo = algo.ok_or_else(|| Error::corrupted("Missing algo in config"))?;
        let algorithm = Algorithm::parse(algo)?;

        let max_value_size = match max_value_size {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| Error::corrupted(format!("Invalid max_value_size: {}", value)))?,
            None => DEFAULT_MAX_VALUE_SIZE,
        };

        Ok(Self {
            algorithm,
            max_value_size,
        })
    }
}
