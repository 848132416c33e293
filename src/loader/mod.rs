// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive image loading from meta header to core handoff.
// Author: Lukas Bower

//! Partition loader.
//!
//! Partitions are processed strictly in table order. Each one moves through
//! `HeaderChecked -> Skipped` when another agent owns it, or
//! `HeaderChecked -> Copying -> Copied -> Validated`. A failure leaves the
//! partition in the state it reached and aborts the remaining sequence.

mod partition;
mod staging;

use log::{info, warn};
use pdi_format::{Cpu, Owner, PartitionKind};

use crate::bus::MemoryBus;
use crate::cdo::{CdoReport, Interpreter};
use crate::config::LoaderConfig;
use crate::device::{BootSource, CopyCapability, DeviceRegistry};
use crate::error::{LoaderError, PartitionError};
use crate::handoff::{HandoffError, HandoffLedger, PowerManager};
use crate::image::{self, MetaHeader};
use crate::security::PartitionSecurity;

pub use staging::{copy_len, StagingBuffer};

/// Processing state of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Header verified, content untouched.
    HeaderChecked,
    /// Owned by another agent; never copied.
    Skipped,
    /// Content transfer or execution in progress.
    Copying,
    /// Content in place.
    Copied,
    /// Handoff recorded and checks complete.
    Validated,
}

/// An image whose meta header has been read.
#[derive(Debug)]
pub struct LoadedImage {
    source: BootSource,
    address: u64,
    cap: CopyCapability,
    meta: MetaHeader,
    handoff: HandoffLedger,
    states: Vec<PartitionState>,
    reports: Vec<(usize, CdoReport)>,
}

impl LoadedImage {
    /// Boot source the image is read from.
    pub fn source(&self) -> BootSource {
        self.source
    }

    /// Image base offset on the boot source.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Validated headers.
    pub fn meta(&self) -> &MetaHeader {
        &self.meta
    }

    /// Recorded core entry points.
    pub fn handoff(&self) -> &HandoffLedger {
        &self.handoff
    }

    /// State of partition `index`.
    pub fn state(&self, index: usize) -> Option<PartitionState> {
        self.states.get(index).copied()
    }

    /// States of all partitions in table order.
    pub fn states(&self) -> &[PartitionState] {
        &self.states
    }

    /// Statistics of every command stream run so far, by partition index.
    pub fn reports(&self) -> &[(usize, CdoReport)] {
        &self.reports
    }
}

/// Totals of a complete load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Partitions in the image.
    pub partitions: usize,
    /// Partitions copied or executed.
    pub loaded: usize,
    /// Partitions owned by another agent.
    pub skipped: usize,
    /// Commands executed across all streams.
    pub commands: u32,
    /// Command failures deferred across all streams.
    pub deferred: usize,
    /// Recorded core entry points.
    pub handoffs: usize,
}

/// Loads images from registered boot sources.
pub struct ImageLoader {
    registry: DeviceRegistry,
    interp: Interpreter,
    config: LoaderConfig,
    security: Option<Box<dyn PartitionSecurity>>,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("security", &self.security.is_some())
            .finish()
    }
}

impl ImageLoader {
    /// Loader over `registry` running streams through `interp`.
    pub fn new(
        registry: DeviceRegistry,
        interp: Interpreter,
        config: LoaderConfig,
    ) -> Result<Self, LoaderError> {
        config.validate()?;
        Ok(Self {
            registry,
            interp,
            config,
            security: None,
        })
    }

    /// Install the authentication/decryption hook for secure partitions.
    pub fn with_security(mut self, hook: Box<dyn PartitionSecurity>) -> Self {
        self.security = Some(hook);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Boot source registry.
    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    /// Staging buffer sized for this loader's configuration.
    pub fn staging_buffer(&self) -> StagingBuffer {
        StagingBuffer::new(self.config.chunk_size)
    }

    /// Initialise `source` and read the meta header of the full image at `address`.
    pub fn load_image(
        &mut self,
        source: BootSource,
        address: u64,
    ) -> Result<LoadedImage, LoaderError> {
        self.open(source, address, false)
    }

    /// As [`ImageLoader::load_image`] for an image without a boot header.
    pub fn load_partial_image(
        &mut self,
        source: BootSource,
        address: u64,
    ) -> Result<LoadedImage, LoaderError> {
        self.open(source, address, true)
    }

    fn open(
        &mut self,
        source: BootSource,
        address: u64,
        partial: bool,
    ) -> Result<LoadedImage, LoaderError> {
        info!("[loader] loading image from {source} at {address:#x}");
        let cap = self.registry.init(source)?;
        let meta = image::read_meta_header(&mut self.registry, cap, address, partial)?;
        let count = meta.partition_count();
        Ok(LoadedImage {
            source,
            address,
            cap,
            meta,
            handoff: HandoffLedger::with_capacity(self.config.max_handoff_cpus),
            states: vec![PartitionState::HeaderChecked; count],
            reports: Vec::new(),
        })
    }

    /// Process partition `index` of `image`.
    pub fn load_partition(
        &mut self,
        image: &mut LoadedImage,
        index: usize,
        staging: &mut StagingBuffer,
        bus: &mut dyn MemoryBus,
    ) -> Result<PartitionState, LoaderError> {
        let count = image.meta.partition_count();
        let header = image
            .meta
            .partitions
            .get(index)
            .cloned()
            .ok_or(LoaderError::IndexOutOfRange { index, count })?;
        let state = image.states[index];
        if state != PartitionState::HeaderChecked {
            return Err(LoaderError::partition(
                index,
                PartitionError::AlreadyProcessed(state),
            ));
        }
        if header.owner() != Owner::Plm {
            info!("[loader] partition {index} owned by another agent, skipped");
            image.states[index] = PartitionState::Skipped;
            return Ok(PartitionState::Skipped);
        }

        image.states[index] = PartitionState::Copying;
        let report = partition::process(self, image, &header, staging, bus)
            .map_err(|e| LoaderError::partition(index, e))?;
        image.states[index] = PartitionState::Copied;
        if let Some(report) = report {
            image.reports.push((index, report));
        }

        if header.kind() == PartitionKind::Data && header.dest_cpu() != Cpu::None {
            let recorded = image.handoff.record(
                header.dest_cpu(),
                header.dest_exec_addr,
                header.exec_state(),
                header.vector_location(),
            );
            match recorded {
                Ok(()) => {}
                Err(HandoffError::Duplicate(cpu)) => {
                    warn!("[loader] partition {index}: keeping the first entry point for {cpu}");
                }
                Err(e) => return Err(LoaderError::partition(index, e.into())),
            }
        }
        image.states[index] = PartitionState::Validated;
        info!("[loader] partition {index} validated");
        Ok(PartitionState::Validated)
    }

    /// Process every partition in table order, stopping at the first failure.
    pub fn load_all(
        &mut self,
        image: &mut LoadedImage,
        staging: &mut StagingBuffer,
        bus: &mut dyn MemoryBus,
    ) -> Result<LoadSummary, LoaderError> {
        let mut summary = LoadSummary {
            partitions: image.meta.partition_count(),
            ..LoadSummary::default()
        };
        for index in 0..summary.partitions {
            match self.load_partition(image, index, staging, bus)? {
                PartitionState::Skipped => summary.skipped += 1,
                _ => summary.loaded += 1,
            }
        }
        for (_, report) in &image.reports {
            summary.commands += report.commands;
            summary.deferred += report.deferred.len();
        }
        summary.handoffs = image.handoff.len();
        info!(
            "[loader] image loaded: {} partitions, {} skipped, {} commands",
            summary.partitions, summary.skipped, summary.commands
        );
        Ok(summary)
    }

    /// Release every recorded core. Returns the number started.
    pub fn start_cores(
        &self,
        image: &mut LoadedImage,
        pm: &mut dyn PowerManager,
    ) -> Result<usize, LoaderError> {
        Ok(image.handoff.drain_and_start(pm)?)
    }
}
