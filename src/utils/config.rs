// src/utils/config.rs
//! Tracer configuration.

use crate::utils::errors::{Result, TraceError};
use serde::Deserialize;

/// Tunables for a tracer instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Number of worker buffer slots (default: 64).
    pub max_workers: usize,

    /// Capacity of each trace buffer in bytes (default: 64 KiB).
    pub buffer_capacity: usize,

    /// Size of each arena block backing the stack table (default: 64 KiB).
    pub arena_block_size: usize,

    /// Number of stack-table hash buckets (default: 8192).
    pub stack_buckets: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            buffer_capacity: 64 << 10,
            arena_block_size: 64 << 10,
            stack_buckets: 1 << 13,
        }
    }
}

impl TracerConfig {
    /// Load configuration from an optional `exectrace` file and
    /// `EXECTRACE_`-prefixed environment variables, falling back to
    /// defaults for anything unset.
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("exectrace").required(false))
            .add_source(config::Environment::with_prefix("EXECTRACE"))
            .build()
            .map_err(|e| TraceError::Config(e.to_string()))?;

        cfg.try_deserialize()
            .map_err(|e| TraceError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TracerConfig::default();
        assert_eq!(cfg.max_workers, 64);
        assert_eq!(cfg.buffer_capacity, 64 << 10);
        assert_eq!(cfg.arena_block_size, 64 << 10);
        assert_eq!(cfg.stack_buckets, 1 << 13);
    }

    #[test]
    fn test_load_uses_defaults_when_nothing_set() {
        let cfg = TracerConfig::load().unwrap();
        assert_eq!(cfg.stack_buckets, TracerConfig::default().stack_buckets);
    }
}
