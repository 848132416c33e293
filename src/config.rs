// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load loader tuning from YAML with defaults.
// Author: Lukas Bower

use std::fs;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::cdo::ErrorPolicy;
use crate::handoff::MAX_HANDOFF_CPUS;

/// Environment variable naming the active configuration file.
pub const CONFIG_ENV: &str = "PLM_CONFIG";

/// Errors raised while loading or validating [`LoaderConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The YAML did not match the schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A field is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Loader tuning knobs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Bytes copied per command stream chunk.
    pub chunk_size: usize,
    /// Copy length alignment in bytes.
    pub dma_alignment: usize,
    /// Prefetch the next chunk while the current one executes.
    pub double_buffer: bool,
    /// Handoff ledger capacity.
    pub max_handoff_cpus: usize,
    /// Poll iterations allowed when a mask poll carries no timeout.
    pub mask_poll_retries: u32,
    /// Whether failing commands abort the stream or are logged and skipped.
    pub error_policy: ErrorPolicy,
    /// Fail a stream at its end when any command failure was deferred.
    pub escalate_deferred_errors: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0x8000,
            dma_alignment: 16,
            double_buffer: false,
            max_handoff_cpus: MAX_HANDOFF_CPUS,
            mask_poll_retries: 1_000_000,
            error_policy: ErrorPolicy::Abort,
            escalate_deferred_errors: false,
        }
    }
}

impl LoaderConfig {
    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| Err(ConfigError::Invalid { field, reason });
        if !self.dma_alignment.is_power_of_two() || self.dma_alignment < 4 {
            return invalid(
                "dma_alignment",
                format!("{} is not a power of two >= 4", self.dma_alignment),
            );
        }
        if self.chunk_size == 0 || self.chunk_size % self.dma_alignment != 0 {
            return invalid(
                "chunk_size",
                format!(
                    "{:#x} is not a non-zero multiple of {}",
                    self.chunk_size, self.dma_alignment
                ),
            );
        }
        if self.max_handoff_cpus == 0 || self.max_handoff_cpus > MAX_HANDOFF_CPUS {
            return invalid(
                "max_handoff_cpus",
                format!("{} outside 1..={MAX_HANDOFF_CPUS}", self.max_handoff_cpus),
            );
        }
        Ok(())
    }
}

/// Parse and validate a YAML configuration file.
pub fn load_config_file(path: &Path) -> Result<LoaderConfig, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let cfg: LoaderConfig = serde_yaml::from_str(&data)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Configuration named by `PLM_CONFIG`, falling back to defaults.
pub fn load_active() -> LoaderConfig {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        return LoaderConfig::default();
    };
    match load_config_file(Path::new(&path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("[config] using default loader config: {e}");
            LoaderConfig::default()
        }
    }
}
