//! Heap configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TAGHEAP_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TAGHEAP_INITIAL_SIZE` | Initial heap size in bytes | 65536 (64 KiB) |
//! | `TAGHEAP_GROWTH_CHUNK` | Minimum heap extension in bytes | 65536 (64 KiB) |
//! | `TAGHEAP_LIMIT` | Hard heap size limit in bytes | 16777216 (16 MiB) |
//!
//! # Example
//!
//! ```rust
//! use tagheap::HeapConfig;
//!
//! // Load from environment with defaults
//! let config = HeapConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = HeapConfig::builder()
//!     .initial_size(4096)
//!     .growth_chunk(4096)
//!     .limit(1024 * 1024)
//!     .build()
//!     .unwrap();
//! ```

use std::env;

use thiserror::Error;

use crate::layout::{MIN_BLOCK_SIZE, OVERHEAD};

/// Default initial heap size and growth chunk: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

/// Default hard heap limit: 16 MiB.
pub const DEFAULT_LIMIT: usize = 16 * 1024 * 1024;

/// Configuration for one heap instance.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Size of the byte range obtained at initialization.
    /// Default: 64 KiB.
    pub initial_size: usize,

    /// Minimum amount each heap extension requests; larger allocations
    /// extend by their own adjusted size instead.
    /// Default: 64 KiB.
    pub growth_chunk: usize,

    /// Hard limit on the total byte range; extensions past it fail with
    /// out-of-memory.
    /// Default: 16 MiB.
    pub limit: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_CHUNK_SIZE,
            growth_chunk: DEFAULT_CHUNK_SIZE,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl HeapConfig {
    /// Create a new builder for `HeapConfig`.
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or unparseable fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("TAGHEAP_INITIAL_SIZE") {
            if val >= MIN_BLOCK_SIZE + OVERHEAD {
                config.initial_size = val;
            }
        }

        if let Some(val) = parse_env_usize("TAGHEAP_GROWTH_CHUNK") {
            if val >= MIN_BLOCK_SIZE {
                config.growth_chunk = val;
            }
        }

        if let Some(val) = parse_env_usize("TAGHEAP_LIMIT") {
            if val >= config.initial_size {
                config.limit = val;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_size < MIN_BLOCK_SIZE + OVERHEAD {
            return Err(ConfigError::InvalidValue {
                field: "initial_size",
                message: format!("must be at least {} bytes", MIN_BLOCK_SIZE + OVERHEAD),
            });
        }

        if self.growth_chunk < MIN_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "growth_chunk",
                message: format!("must be at least {MIN_BLOCK_SIZE} bytes"),
            });
        }

        if self.limit < self.initial_size {
            return Err(ConfigError::InvalidValue {
                field: "limit",
                message: "must be at least initial_size".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Error message.
        message: String,
    },
}

/// Builder for [`HeapConfig`].
#[derive(Debug, Clone, Default)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial heap size in bytes.
    pub fn initial_size(mut self, size: usize) -> Self {
        self.config.initial_size = size;
        self
    }

    /// Set the minimum heap extension in bytes.
    pub fn growth_chunk(mut self, size: usize) -> Self {
        self.config.growth_chunk = size;
        self
    }

    /// Set the hard heap size limit in bytes.
    pub fn limit(mut self, size: usize) -> Self {
        self.config.limit = size;
        self
    }

    /// Validate and return the finished configuration.
    pub fn build(self) -> Result<HeapConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(var: &str) -> Option<usize> {
    env::var(var).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = HeapConfig::builder()
            .initial_size(4096)
            .growth_chunk(1024)
            .limit(1 << 20)
            .build()
            .unwrap();
        assert_eq!(config.initial_size, 4096);
        assert_eq!(config.growth_chunk, 1024);
        assert_eq!(config.limit, 1 << 20);
    }

    #[test]
    fn initial_size_below_minimum_is_rejected() {
        let result = HeapConfig::builder().initial_size(16).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "initial_size", .. })
        ));
    }

    #[test]
    fn limit_below_initial_size_is_rejected() {
        let result = HeapConfig::builder()
            .initial_size(1 << 16)
            .limit(1 << 12)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "limit", .. })
        ));
    }
}
