use crate::error::{LdError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MIN_R2: f64 = 1e-6;
pub const DEFAULT_MAX_DISTANCE: u32 = 500_000;

/// Overrides the mapped block size, in bytes.
pub const BLOCK_SIZE_ENV: &str = "LDSTORE_BLOCK_SIZE";

/// Tunables shared by the writer, the reader and the LD computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deflate level, 0 to 9.
    pub compression_level: u32,
    /// Bytes per memory-mapped block when reading.
    pub block_size: u64,
    /// Pairs are stored only when r2 is strictly greater than this.
    pub min_r2: f64,
    /// Maximum distance in bp between the two variants of a pair.
    pub max_distance: u32,
    /// Worker threads for LD computation. Defaults to the number of CPUs.
    pub threads: Option<usize>,
    /// Wall-clock limit for a computation run.
    pub timeout_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
            min_r2: DEFAULT_MIN_R2,
            max_distance: DEFAULT_MAX_DISTANCE,
            threads: None,
            timeout_secs: None,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(LdError::Config(format!(
                "compression_level must be between 0 and 9, got {}.",
                self.compression_level
            )));
        }
        if self.block_size == 0 {
            return Err(LdError::Config("block_size must be positive.".to_string()));
        }
        if !(self.min_r2 > 0.0 && self.min_r2 < 1.0) {
            return Err(LdError::Config(format!(
                "min_r2 must be strictly between 0 and 1, got {}.",
                self.min_r2
            )));
        }
        if self.max_distance == 0 {
            return Err(LdError::Config("max_distance must be positive.".to_string()));
        }
        if self.threads == Some(0) {
            return Err(LdError::Config("threads must be positive.".to_string()));
        }
        Ok(())
    }

    /// Applies `LDSTORE_BLOCK_SIZE` if it is set to a positive integer.
    pub fn apply_env(&mut self) {
        if let Some(block_size) = block_size_override(std::env::var(BLOCK_SIZE_ENV).ok()) {
            log::debug!("Using {BLOCK_SIZE_ENV}={block_size}");
            self.block_size = block_size;
        }
    }

    pub fn effective_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_secs.map(std::time::Duration::from_secs)
    }
}

fn block_size_override(value: Option<String>) -> Option<u64> {
    let value = value?;
    match value.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            log::warn!("Ignoring {BLOCK_SIZE_ENV}='{value}': expected a positive byte count");
            None
        }
    }
}
