//! Device parameters passed through from the deployment environment.
//!
//! Three sources, lowest precedence first: built-in defaults, a TOML file
//! with a `[device]` table, and `MESHCCL_*` environment variables.
//!
//! ```toml
//! [device]
//! core_grid = [8, 8]
//! num_command_queues = 2
//! trace_region_size = 23887872
//! fabric_links_per_edge = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::{env, fs};

/// Errors produced by configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid environment variable value for {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

/// Hard limit of the dispatch hardware.
pub const MAX_COMMAND_QUEUES: usize = 2;

#[derive(Serialize, Deserialize)]
struct TomlWrapper {
    device: DeviceParams,
}

/// Per-chip resources and interconnect properties of a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceParams {
    /// Compute-core grid `[x, y]` of every chip.
    pub core_grid: [usize; 2],
    pub l1_bytes_per_core: usize,
    pub dram_bytes_per_chip: usize,
    /// Fast memory carved out of L1 at open for small runtime buffers.
    pub l1_small_size: usize,
    pub num_command_queues: usize,
    /// Bytes reserved for captured traces; zero disables capture.
    pub trace_region_size: usize,
    /// Physical Ethernet links between each pair of neighbouring chips.
    pub fabric_links_per_edge: usize,
    /// Whether each mesh axis closes into a ring.
    pub ring_wraparound: bool,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            core_grid: [8, 8],
            l1_bytes_per_core: 1_499_136,
            dram_bytes_per_chip: 12 * 1024 * 1024 * 1024,
            l1_small_size: 0,
            num_command_queues: 1,
            trace_region_size: 0,
            fabric_links_per_edge: 4,
            ring_wraparound: false,
        }
    }
}

impl DeviceParams {
    /// Parses a `[device]` table.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let wrapper: TomlWrapper = toml::from_str(text)?;
        wrapper.device.validate()?;
        Ok(wrapper.device)
    }

    /// Loads a `[device]` table from `path`; a missing file yields defaults.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found: {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let wrapper = TomlWrapper {
            device: self.clone(),
        };
        Ok(toml::to_string_pretty(&wrapper)?)
    }

    /// Overrides fields from `MESHCCL_*` environment variables.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = read_env("MESHCCL_NUM_COMMAND_QUEUES")? {
            self.num_command_queues = v;
        }
        if let Some(v) = read_env("MESHCCL_TRACE_REGION_SIZE")? {
            self.trace_region_size = v;
        }
        if let Some(v) = read_env("MESHCCL_L1_SMALL_SIZE")? {
            self.l1_small_size = v;
        }
        if let Some(v) = read_env("MESHCCL_FABRIC_LINKS")? {
            self.fabric_links_per_edge = v;
        }
        if let Ok(v) = env::var("MESHCCL_RING_WRAPAROUND") {
            self.ring_wraparound = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnvVar {
                        key: "MESHCCL_RING_WRAPAROUND".into(),
                        value: v,
                    })
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_grid[0] == 0 || self.core_grid[1] == 0 {
            return Err(ConfigError::Validation("core_grid must be non-empty".into()));
        }
        if self.num_command_queues == 0 || self.num_command_queues > MAX_COMMAND_QUEUES {
            return Err(ConfigError::Validation(format!(
                "num_command_queues must be in 1..={MAX_COMMAND_QUEUES}, got {}",
                self.num_command_queues
            )));
        }
        if self.fabric_links_per_edge == 0 {
            return Err(ConfigError::Validation(
                "fabric_links_per_edge must be >= 1".into(),
            ));
        }
        let l1_bytes = self.l1_bytes_per_chip()?;
        if self.l1_small_size > l1_bytes {
            return Err(ConfigError::Validation(format!(
                "l1_small_size {} exceeds chip L1 of {l1_bytes} bytes",
                self.l1_small_size
            )));
        }
        Ok(())
    }

    pub fn num_cores(&self) -> usize {
        self.core_grid[0].saturating_mul(self.core_grid[1])
    }

    /// Total L1 of one chip; errors when the product does not fit a `usize`.
    pub fn l1_bytes_per_chip(&self) -> Result<usize, ConfigError> {
        self.core_grid[0]
            .checked_mul(self.core_grid[1])
            .and_then(|cores| cores.checked_mul(self.l1_bytes_per_core))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "{:?} cores of {} L1 bytes overflow the address space",
                    self.core_grid, self.l1_bytes_per_core
                ))
            })
    }
}

fn read_env(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                key: key.into(),
                value: v,
            }),
        Err(_) => Ok(None),
    }
}
