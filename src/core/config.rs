//! Streaming configuration
//!
//! Plain settings struct with defaults, persisted as JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, MIB};

/// Settings shared by the loader, the resource cache and the packed file store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of CPU processing threads (decompress / validate)
    pub processing_threads: usize,
    /// Budget for pooled GPU resources in bytes
    pub max_managed_memory: u64,
    /// Requests serviced per graphics-thread drain call
    pub device_items_per_frame: usize,
    /// Give up on a request after this many failed lock attempts (None = retry forever)
    pub max_lock_retries: Option<u32>,
    /// Memory-map packed file chunks instead of reading them into heap buffers
    pub use_memory_mapping: bool,
    /// Overrides the max mapped chunk count stored in the packed file header
    pub max_chunks_mapped: Option<u32>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            processing_threads: 2,
            max_managed_memory: 512 * MIB,
            device_items_per_frame: 8,
            max_lock_retries: None,
            use_memory_mapping: true,
            max_chunks_mapped: None,
        }
    }
}

impl StreamingConfig {
    /// Reject settings the loader cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processing_threads == 0 {
            return Err(Error::Config("processing_threads must be at least 1".into()));
        }
        if self.device_items_per_frame == 0 {
            return Err(Error::Config("device_items_per_frame must be at least 1".into()));
        }
        if self.max_chunks_mapped == Some(0) {
            return Err(Error::Config("max_chunks_mapped must be at least 1".into()));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
