// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Loader error taxonomy with partition stage tagging.
// Author: Lukas Bower

use std::fmt;

use pdi_format::FormatError;
use thiserror::Error;

use crate::bus::BusError;
use crate::cdo::CdoError;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::handoff::HandoffError;
use crate::loader::PartitionState;
use crate::security::SecurityError;

/// Partition processing stage a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Ownership and state checks.
    HeaderCheck,
    /// Copying bytes from the boot source.
    Copy,
    /// Running the command stream.
    Execute,
    /// Authentication and decryption.
    Validate,
    /// Recording the core entry point.
    Handoff,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::HeaderCheck => "header check",
            Stage::Copy => "copy",
            Stage::Execute => "execute",
            Stage::Validate => "validate",
            Stage::Handoff => "handoff",
        })
    }
}

/// Failure while processing one partition.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Boot source transfer failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Destination write failed.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Command stream failed.
    #[error(transparent)]
    Cdo(#[from] CdoError),
    /// Authentication or decryption failed.
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// The partition is marked secure but no hook is installed.
    #[error("secure partition without an authentication hook")]
    NoSecurityHook,
    /// Recording the entry point failed.
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    /// The partition was already processed.
    #[error("partition already in state {0:?}")]
    AlreadyProcessed(PartitionState),
    /// The staging buffer cannot hold an aligned chunk.
    #[error("staging chunk of {chunk_size} bytes does not fit {alignment}-byte DMA transfers")]
    StagingBuffer {
        /// Chunk size of the buffer handed in.
        chunk_size: usize,
        /// Configured DMA alignment.
        alignment: usize,
    },
}

impl PartitionError {
    /// Stage this failure belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            PartitionError::Device(_)
            | PartitionError::Bus(_)
            | PartitionError::StagingBuffer { .. } => Stage::Copy,
            PartitionError::Cdo(_) => Stage::Execute,
            PartitionError::Security(_) | PartitionError::NoSecurityHook => Stage::Validate,
            PartitionError::Handoff(_) => Stage::Handoff,
            PartitionError::AlreadyProcessed(_) => Stage::HeaderCheck,
        }
    }
}

/// Errors returned by the image loader.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Boot source could not be initialised or read.
    #[error("boot device: {0}")]
    Device(#[from] DeviceError),
    /// Meta header failed validation.
    #[error("meta header: {0}")]
    Format(#[from] FormatError),
    /// A partition failed; the remaining partitions were not processed.
    #[error("partition {index} failed during {stage}: {source}")]
    Partition {
        /// Zero-based partition index.
        index: usize,
        /// Stage the failure occurred in.
        stage: Stage,
        /// Underlying failure.
        source: PartitionError,
    },
    /// Partition index beyond the partition count.
    #[error("partition index {index} out of range ({count} partitions)")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Partition count.
        count: usize,
    },
    /// Loader configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Core start-up failed.
    #[error("core start-up: {0}")]
    Handoff(#[from] HandoffError),
}

impl LoaderError {
    pub(crate) fn partition(index: usize, source: PartitionError) -> Self {
        LoaderError::Partition {
            index,
            stage: source.stage(),
            source,
        }
    }

    /// Stage of a partition failure.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LoaderError::Partition { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Module and api id of a failing command.
    pub fn command_ids(&self) -> Option<(u8, u8)> {
        match self {
            LoaderError::Partition {
                source: PartitionError::Cdo(e),
                ..
            } => e.module_id().zip(e.api_id()),
            _ => None,
        }
    }
}
