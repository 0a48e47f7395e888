//! Configuration file parsing for `lope.toml`.
//!
//! Every field has a default, so an empty or partial file is valid. Lookup
//! order: an explicit path, then `lope.toml` in the current directory and
//! its ancestors, then the built-in defaults.

use crate::process::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_FILE_NAME: &str = "lope.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid toml in '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LopeConfig {
    pub scheduler: SchedulerConfig,
    pub vmm: VmmConfig,
    pub memory: MemoryConfig,
}

/// Scheduling policy constants. Times are microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one round-robin slice.
    pub time_slice_us: u64,
    /// Ready-queue cycles between aging promotions.
    pub aging_threshold: u32,
    /// How long a simulated I/O wait lasts.
    pub io_duration_us: u64,
    /// Chance that an expired slice ends in I/O instead of preemption.
    pub io_probability: f64,
    /// Sleep between two iterations of the scheduler thread.
    pub poll_interval_us: u64,
    /// Priority given to newly admitted processes.
    pub initial_priority: Priority,
    /// Fixed RNG seed for reproducible I/O draws.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_slice_us: 100_000,
            aging_threshold: 5,
            io_duration_us: 200_000,
            io_probability: 0.25,
            poll_interval_us: 10_000,
            initial_priority: Priority::NORMAL,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    pub page_size: u64,
    pub physical_frames: usize,
    /// Largest page table a single process may have.
    pub virtual_pages: usize,
    pub swap_slots: usize,
    /// Concurrently tracked processes.
    pub max_processes: usize,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            physical_frames: 16,
            virtual_pages: 64,
            swap_slots: 32,
            max_processes: 64,
        }
    }
}

/// Memory requested per command. `commands` only holds overrides; the
/// built-in table lives in [`MemoryProfile`](crate::lifecycle::MemoryProfile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub default_bytes: u64,
    pub commands: BTreeMap<String, u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_bytes: 10 * 1024,
            commands: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl LopeConfig {
    /// Load from `explicit` when given, otherwise search the current
    /// directory and its ancestors. Falls back to defaults when no file
    /// exists. The result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match explicit {
            Some(path) => Self::load_from(path)?,
            None => match Self::find_and_load()? {
                Some((path, cfg)) => {
                    tracing::debug!(path = %path.display(), "loaded configuration");
                    cfg
                }
                None => Self::default(),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find `lope.toml` in the current directory or an ancestor.
    pub fn find_and_load() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok(None);
        };
        Self::find_from(&cwd)
    }

    /// Like [`find_and_load`](Self::find_and_load), starting at `start`.
    pub fn find_from(start: &Path) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        for dir in start.ancestors() {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                let cfg = Self::load_from(&candidate)?;
                return Ok(Some((candidate, cfg)));
            }
        }
        Ok(None)
    }

    /// Reject values the scheduler or VMM cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.time_slice_us == 0 {
            return Err(ConfigError::Invalid("scheduler.time_slice_us must be > 0".into()));
        }
        if s.aging_threshold == 0 {
            return Err(ConfigError::Invalid("scheduler.aging_threshold must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&s.io_probability) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.io_probability must be within [0, 1], got {}",
                s.io_probability
            )));
        }
        if self.vmm.page_size == 0 {
            return Err(ConfigError::Invalid("vmm.page_size must be > 0".into()));
        }
        if self.vmm.physical_frames == 0 {
            return Err(ConfigError::Invalid("vmm.physical_frames must be > 0".into()));
        }
        if self.vmm.max_processes == 0 {
            return Err(ConfigError::Invalid("vmm.max_processes must be > 0".into()));
        }
        Ok(())
    }

    /// Generate a default `lope.toml` template.
    pub fn default_template() -> &'static str {
        r#"# Lope configuration
# Every key is optional; omitted keys keep the values shown here.

[scheduler]
time_slice_us = 100000      # 100 ms round-robin slice
aging_threshold = 5         # ready cycles between promotions
io_duration_us = 200000     # 200 ms simulated I/O
io_probability = 0.25       # chance an expired slice blocks on I/O
poll_interval_us = 10000    # scheduler loop sleep
initial_priority = 1        # 0 = HIGH, 1 = NORMAL, 2 = LOW
# seed = 42                 # fix the I/O draws

[vmm]
page_size = 4096
physical_frames = 16
virtual_pages = 64
swap_slots = 32
max_processes = 64

[memory]
default_bytes = 10240
# [memory.commands]
# make = 65536
"#
    }
}

impl FromStr for LopeConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
