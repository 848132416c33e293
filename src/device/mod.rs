// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map boot source identifiers to init/copy capabilities.
// Author: Lukas Bower

//! Boot-source copy registry.
//!
//! Each boot source is registered once with a [`BootDevice`] transport.
//! [`DeviceRegistry::init`] brings the transport up and hands out a
//! [`CopyCapability`]; every later copy presents that capability. Initialising
//! a source again bumps its generation, so capabilities issued earlier are
//! rejected. Transfers are raw bytes only and are never retried.

mod file;
mod mem;

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use log::{debug, info};
use thiserror::Error;

use crate::bus::{BusError, MemoryBus};

pub use file::FileDevice;
pub use mem::MemDevice;

const BOUNCE_LEN: usize = 0x1000;

/// Boot mode identifiers as strapped on the boot mode pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum BootSource {
    /// JTAG download.
    Jtag = 0x0,
    /// QSPI flash, 24-bit addressing.
    Qspi24 = 0x1,
    /// QSPI flash, 32-bit addressing.
    Qspi32 = 0x2,
    /// SD card on controller 0.
    Sd0 = 0x3,
    /// SD card on controller 1.
    Sd1 = 0x5,
    /// eMMC.
    Emmc = 0x6,
    /// USB device mode.
    Usb = 0x7,
    /// Octal SPI flash.
    Ospi = 0x8,
    /// PCIe endpoint.
    Pcie = 0x9,
    /// SelectMAP slave interface.
    Smap = 0xA,
    /// Slave boot interface.
    Sbi = 0xB,
    /// SD card on controller 1 with level shifter.
    Sd1Ls = 0xE,
    /// Image already resident in DDR.
    Ddr = 0xF,
}

impl TryFrom<u32> for BootSource {
    type Error = DeviceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use BootSource::*;
        Ok(match value {
            0x0 => Jtag,
            0x1 => Qspi24,
            0x2 => Qspi32,
            0x3 => Sd0,
            0x5 => Sd1,
            0x6 => Emmc,
            0x7 => Usb,
            0x8 => Ospi,
            0x9 => Pcie,
            0xA => Smap,
            0xB => Sbi,
            0xE => Sd1Ls,
            0xF => Ddr,
            other => return Err(DeviceError::UnknownSource(other)),
        })
    }
}

impl fmt::Display for BootSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootSource::Jtag => "jtag",
            BootSource::Qspi24 => "qspi24",
            BootSource::Qspi32 => "qspi32",
            BootSource::Sd0 => "sd0",
            BootSource::Sd1 => "sd1",
            BootSource::Emmc => "emmc",
            BootSource::Usb => "usb",
            BootSource::Ospi => "ospi",
            BootSource::Pcie => "pcie",
            BootSource::Smap => "smap",
            BootSource::Sbi => "sbi",
            BootSource::Sd1Ls => "sd1-ls",
            BootSource::Ddr => "ddr",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BootSource {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use BootSource::*;
        [
            Jtag, Qspi24, Qspi32, Sd0, Sd1, Emmc, Usb, Ospi, Pcie, Smap, Sbi, Sd1Ls, Ddr,
        ]
        .into_iter()
        .find(|source| source.to_string() == s)
        .ok_or_else(|| DeviceError::Transport(format!("unknown boot source name {s:?}")))
    }
}

bitflags! {
    /// Transfer flags passed through to the transport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Return before the source side completes.
        const SRC_NONBLOCKING = 0x1;
        /// Return before the destination side completes.
        const DST_NONBLOCKING = 0x2;
        /// Read from a fixed AXI address (keyhole source).
        const READ_AXI_FIXED = 0x4;
        /// Use DMA engine 0.
        const PMCDMA_0 = 0x100;
        /// Use DMA engine 1.
        const PMCDMA_1 = 0x200;
    }
}

/// Errors raised by the registry and boot transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No transport is registered for the source.
    #[error("unsupported boot source {0}")]
    Unsupported(BootSource),
    /// Boot mode value with no known source.
    #[error("unknown boot mode {0:#x}")]
    UnknownSource(u32),
    /// Raw transport failure reported by a device.
    #[error("{0}")]
    Transport(String),
    /// Transport initialisation failed.
    #[error("init of {device} failed: {reason}")]
    Init {
        /// Source being initialised.
        device: BootSource,
        /// Transport reason.
        reason: String,
    },
    /// Transport copy failed.
    #[error("copy of {len} bytes from {device}:{src:#x} failed: {reason}")]
    Copy {
        /// Source device.
        device: BootSource,
        /// Source offset.
        src: u64,
        /// Transfer length.
        len: usize,
        /// Transport reason.
        reason: String,
    },
    /// Read past the end of the device.
    #[error("read of {len} bytes at {src:#x} exceeds device size {size:#x}")]
    OutOfRange {
        /// Source offset.
        src: u64,
        /// Transfer length.
        len: usize,
        /// Device size in bytes.
        size: u64,
    },
    /// The capability was issued before the source was initialised again.
    #[error("stale copy capability for {0}")]
    StaleCapability(BootSource),
    /// Writing the destination failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Transport driving one boot source.
pub trait BootDevice {
    /// Bring the transport up.
    fn init(&mut self) -> Result<(), DeviceError>;

    /// Read `buf.len()` bytes starting at byte offset `src`.
    fn read(&mut self, src: u64, buf: &mut [u8], flags: CopyFlags) -> Result<(), DeviceError>;

    /// Size of the backing store, when known.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// Proof that a boot source was initialised. Required by every copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCapability {
    source: BootSource,
    generation: u32,
}

impl CopyCapability {
    /// Source this capability copies from.
    pub fn source(&self) -> BootSource {
        self.source
    }
}

struct Slot {
    device: Box<dyn BootDevice>,
    generation: u32,
    ready: bool,
}

/// Fixed table of boot sources and their transports.
#[derive(Default)]
pub struct DeviceRegistry {
    slots: BTreeMap<BootSource, Slot>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("sources", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transport for `source`, returning any transport it replaces.
    pub fn register(
        &mut self,
        source: BootSource,
        device: Box<dyn BootDevice>,
    ) -> Option<Box<dyn BootDevice>> {
        let previous = self.slots.insert(
            source,
            Slot {
                device,
                generation: 0,
                ready: false,
            },
        );
        debug!("[registry] transport registered for {source}");
        previous.map(|slot| slot.device)
    }

    /// Whether a transport is registered for `source`.
    pub fn supports(&self, source: BootSource) -> bool {
        self.slots.contains_key(&source)
    }

    /// Initialise `source` and issue a fresh capability.
    pub fn init(&mut self, source: BootSource) -> Result<CopyCapability, DeviceError> {
        let slot = self
            .slots
            .get_mut(&source)
            .ok_or(DeviceError::Unsupported(source))?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.ready = false;
        slot.device.init().map_err(|e| DeviceError::Init {
            device: source,
            reason: e.to_string(),
        })?;
        slot.ready = true;
        info!("[registry] {source} initialised (generation {})", slot.generation);
        Ok(CopyCapability {
            source,
            generation: slot.generation,
        })
    }

    /// Read `buf.len()` bytes at `src` into a local buffer.
    ///
    /// Reads past the end of a device that reports its size fail before the
    /// transport is touched.
    pub fn read(
        &mut self,
        cap: CopyCapability,
        src: u64,
        buf: &mut [u8],
        flags: CopyFlags,
    ) -> Result<(), DeviceError> {
        let slot = self.slot(cap)?;
        let len = buf.len();
        if let Some(size) = slot.device.size() {
            if src.checked_add(len as u64).map_or(true, |end| end > size) {
                return Err(DeviceError::OutOfRange { src, len, size });
            }
        }
        slot.device
            .read(src, buf, flags)
            .map_err(|e| DeviceError::Copy {
                device: cap.source,
                src,
                len,
                reason: e.to_string(),
            })
    }

    /// Copy `len` bytes from `src` on the boot source to `dest` on the bus.
    pub fn copy(
        &mut self,
        cap: CopyCapability,
        src: u64,
        dest: u64,
        len: usize,
        flags: CopyFlags,
        bus: &mut dyn MemoryBus,
    ) -> Result<(), DeviceError> {
        debug!(
            "[registry] copy {len:#x} bytes {}:{src:#x} -> {dest:#x}",
            cap.source
        );
        let mut bounce = vec![0u8; BOUNCE_LEN.min(len)];
        let mut done = 0usize;
        while done < len {
            let n = (len - done).min(BOUNCE_LEN);
            self.read(cap, src + done as u64, &mut bounce[..n], flags)?;
            bus.write_bytes(dest + done as u64, &bounce[..n])?;
            done += n;
        }
        Ok(())
    }

    fn slot(&mut self, cap: CopyCapability) -> Result<&mut Slot, DeviceError> {
        let slot = self
            .slots
            .get_mut(&cap.source)
            .ok_or(DeviceError::Unsupported(cap.source))?;
        if !slot.ready || slot.generation != cap.generation {
            return Err(DeviceError::StaleCapability(cap.source));
        }
        Ok(slot)
    }
}
