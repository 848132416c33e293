// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Record processor entry points and release cores after loading.
// Author: Lukas Bower

//! Handoff ledger.
//!
//! Every processor-destined partition records where its core starts. The
//! ledger holds at most one entry per core: a second entry for the same core
//! is reported as [`HandoffError::Duplicate`] and dropped, so the first entry
//! wins. Once all partitions are processed the ledger is drained in
//! insertion order through the [`PowerManager`].

use heapless::Vec as BoundedVec;
use log::{info, warn};
use pdi_format::{Cpu, ExecState, VectorLocation};
use thiserror::Error;

/// Upper bound on recorded cores.
pub const MAX_HANDOFF_CPUS: usize = 10;

/// Failure reported by the wake-up primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PowerError(pub String);

/// Errors raised by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// The core already has an entry; the new one was dropped.
    #[error("duplicate handoff for {0}")]
    Duplicate(Cpu),
    /// The ledger is at capacity.
    #[error("handoff ledger full ({0} entries)")]
    Full(usize),
    /// A core could not be configured or woken.
    #[error("failed to start {cpu} at {entry:#x}: {source}")]
    Wake {
        /// Core being started.
        cpu: Cpu,
        /// Entry address.
        entry: u64,
        /// Power manager failure.
        source: PowerError,
    },
}

/// Where one core begins executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffEntry {
    /// Core to release.
    pub cpu: Cpu,
    /// Entry address.
    pub entry: u64,
    /// Execution state to configure before release.
    pub exec_state: ExecState,
    /// Vector location to configure before release.
    pub vector: VectorLocation,
}

/// Power management requests needed to release a core.
pub trait PowerManager {
    /// Select 32- or 64-bit execution for `cpu`.
    fn set_exec_state(&mut self, _cpu: Cpu, _state: ExecState) -> Result<(), PowerError> {
        Ok(())
    }

    /// Select high or low vectors for `cpu`.
    fn set_vector_location(
        &mut self,
        _cpu: Cpu,
        _vector: VectorLocation,
    ) -> Result<(), PowerError> {
        Ok(())
    }

    /// Release `cpu` from reset at `entry`.
    fn request_wake(&mut self, cpu: Cpu, entry: u64) -> Result<(), PowerError>;
}

/// Bounded table of handoff entries, one per core.
#[derive(Debug, Clone)]
pub struct HandoffLedger {
    entries: BoundedVec<HandoffEntry, MAX_HANDOFF_CPUS>,
    capacity: usize,
}

impl Default for HandoffLedger {
    fn default() -> Self {
        Self::with_capacity(MAX_HANDOFF_CPUS)
    }
}

impl HandoffLedger {
    /// Ledger holding at most `capacity` entries, capped at [`MAX_HANDOFF_CPUS`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BoundedVec::new(),
            capacity: capacity.min(MAX_HANDOFF_CPUS),
        }
    }

    /// Record a core entry point.
    pub fn record(
        &mut self,
        cpu: Cpu,
        entry: u64,
        exec_state: ExecState,
        vector: VectorLocation,
    ) -> Result<(), HandoffError> {
        if self.entries.iter().any(|e| e.cpu == cpu) {
            return Err(HandoffError::Duplicate(cpu));
        }
        if self.entries.len() >= self.capacity {
            return Err(HandoffError::Full(self.capacity));
        }
        self.entries
            .push(HandoffEntry {
                cpu,
                entry,
                exec_state,
                vector,
            })
            .map_err(|_| HandoffError::Full(self.capacity))?;
        info!("[handoff] {cpu} entry {entry:#x} recorded");
        Ok(())
    }

    /// Recorded entries in insertion order.
    pub fn entries(&self) -> &[HandoffEntry] {
        &self.entries
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configure and wake every recorded core in order.
    ///
    /// Stops at the first failure without retrying. Cores already started are
    /// removed from the ledger; the failing core and those after it remain.
    pub fn drain_and_start(&mut self, pm: &mut dyn PowerManager) -> Result<usize, HandoffError> {
        let mut started = 0;
        let result = self.entries.iter().try_for_each(|e| {
            let wake = |source| HandoffError::Wake {
                cpu: e.cpu,
                entry: e.entry,
                source,
            };
            pm.set_exec_state(e.cpu, e.exec_state).map_err(wake)?;
            pm.set_vector_location(e.cpu, e.vector).map_err(wake)?;
            pm.request_wake(e.cpu, e.entry).map_err(wake)?;
            info!("[handoff] {} released at {:#x}", e.cpu, e.entry);
            started += 1;
            Ok(())
        });
        let remaining: BoundedVec<HandoffEntry, MAX_HANDOFF_CPUS> =
            self.entries.iter().skip(started).copied().collect();
        self.entries = remaining;
        if let Err(e) = &result {
            warn!("[handoff] stopped after {started} cores: {e}");
        }
        result.map(|()| started)
    }
}
