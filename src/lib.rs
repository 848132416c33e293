// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Expose the boot image loader and command interpreter.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Boot-time image loader and command interpreter.
//!
//! The loader reads a boot image from a registered boot source, validates its
//! meta header, copies partitions to their destinations and runs command
//! stream partitions through a resumable, module-dispatched interpreter.
//! Processor-destined partitions are recorded in a handoff ledger that is
//! drained once every partition has been processed.
//!
//! ```text
//!   DeviceRegistry ──► image::read_meta_header ──► ImageLoader::load_partition
//!                                                     │            │
//!                                          data copy ◄┘            └► CdoStream ──► Interpreter
//!                                                     │
//!                                              HandoffLedger ──► PowerManager
//! ```

pub mod bus;
pub mod cdo;
pub mod config;
pub mod device;
pub mod error;
pub mod handoff;
pub mod image;
pub mod loader;
pub mod security;

pub use bus::{BusError, MemoryBus, SimMemory};
pub use cdo::{
    CdoBuilder, CdoError, CdoReport, CdoStream, Command, Continuation, ErrorPolicy, ExecContext,
    HandlerError, Interpreter, Module, ModuleTable, Progress,
};
pub use config::{ConfigError, LoaderConfig};
pub use device::{
    BootDevice, BootSource, CopyCapability, CopyFlags, DeviceError, DeviceRegistry, FileDevice,
    MemDevice,
};
pub use error::{LoaderError, PartitionError, Stage};
pub use handoff::{HandoffEntry, HandoffError, HandoffLedger, PowerError, PowerManager};
pub use image::MetaHeader;
pub use loader::{ImageLoader, LoadSummary, LoadedImage, PartitionState, StagingBuffer};
pub use security::{PartitionSecurity, SecurityError};

pub use pdi_format;
