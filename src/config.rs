use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a database directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Upper bound for a single segment file, also the size of its read map (default: 2GiB)
    pub max_segment_size: u64,

    /// Step by which segment files are extended when they run out of room (default: 1MiB)
    pub growth_step: u64,

    /// Maximum payload of a data leaf chunk (default: 8KiB)
    pub data_leaf_size: usize,

    /// Maximum number of children of a data index chunk (default: 128)
    pub data_fanout: usize,

    /// Collapse identical refless chunks while copying a database (default: true)
    pub dedup_on_copy: bool,

    /// Fsync the log on every commit (default: true)
    pub sync_on_commit: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cowdb"),
            max_segment_size: 2 * 1024 * 1024 * 1024, // 2GiB
            growth_step: 1024 * 1024,                 // 1MiB
            data_leaf_size: 8 * 1024,                 // 8KiB
            data_fanout: 128,
            dedup_on_copy: true,
            sync_on_commit: true,
        }
    }
}

impl DbConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment size cap
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the file growth step
    pub fn growth_step(mut self, step: u64) -> Self {
        self.growth_step = step;
        self
    }

    /// Set the data leaf payload size
    pub fn data_leaf_size(mut self, size: usize) -> Self {
        self.data_leaf_size = size;
        self
    }

    /// Set the data index fanout
    pub fn data_fanout(mut self, fanout: usize) -> Self {
        self.data_fanout = fanout;
        self
    }

    /// Enable or disable leaf deduplication during copies
    pub fn dedup_on_copy(mut self, enabled: bool) -> Self {
        self.dedup_on_copy = enabled;
        self
    }

    /// Enable or disable fsync on commit
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size < 64 {
            return Err(Error::InvalidInput(format!(
                "max_segment_size {} is too small",
                self.max_segment_size
            )));
        }
        // Frame lengths are u32 and a frame never spans two segments.
        if self.max_segment_size > u32::MAX as u64 {
            return Err(Error::InvalidInput(format!(
                "max_segment_size {} exceeds the {} byte frame limit",
                self.max_segment_size,
                u32::MAX
            )));
        }
        if self.growth_step == 0 {
            return Err(Error::InvalidInput("growth_step must be positive".to_string()));
        }
        if self.data_leaf_size == 0 {
            return Err(Error::InvalidInput("data_leaf_size must be positive".to_string()));
        }
        if self.data_fanout < 2 || self.data_fanout > u16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "data_fanout {} must be between 2 and {}",
                self.data_fanout,
                u16::MAX
            )));
        }
        Ok(())
    }
}
