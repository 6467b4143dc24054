//! Graphics configuration.

use crate::graphics::driver::BackendKind;

/// Configuration for the rendering pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Backend to drive.
    pub backend: BackendKind,
    /// Side of newly created atlas pages. Power of two.
    pub initial_atlas_size: i32,
    /// Hard cap on atlas page side; clamped to the driver-reported
    /// maximum at context creation. Power of two.
    pub max_atlas_size: i32,
    /// Soft cap on queued draw commands before a warning is logged.
    pub command_warn_threshold: usize,
}

impl GraphicsConfig {
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            backend: BackendKind::Software,
            initial_atlas_size: 1024,
            max_atlas_size: 4096,
            command_warn_threshold: 16_384,
        }
    }

    /// Small sizes for exercising atlas growth and eviction in tests.
    #[must_use]
    pub const fn debug() -> Self {
        Self {
            backend: BackendKind::Software,
            initial_atlas_size: 64,
            max_atlas_size: 256,
            command_warn_threshold: 128,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_atlas_size <= 0 || self.max_atlas_size <= 0 {
            return Err(ConfigError::InvalidAtlasSize);
        }
        if !(self.initial_atlas_size as u32).is_power_of_two()
            || !(self.max_atlas_size as u32).is_power_of_two()
        {
            return Err(ConfigError::InvalidAtlasSize);
        }
        if self.initial_atlas_size > self.max_atlas_size {
            return Err(ConfigError::InvalidAtlasSize);
        }
        if self.command_warn_threshold == 0 {
            return Err(ConfigError::InvalidQueueThreshold);
        }
        Ok(())
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    InvalidAtlasSize,
    InvalidQueueThreshold,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAtlasSize => write!(f, "Atlas sizes must be positive powers of two, initial <= max"),
            Self::InvalidQueueThreshold => write!(f, "Command warn threshold must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
