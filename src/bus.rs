// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the memory bus seen by copies and command handlers.
// Author: Lukas Bower

//! Destination memory and register access.
//!
//! Partition copies and command handlers reach memory and device registers
//! only through [`MemoryBus`]. Firmware backs it with physical accesses;
//! tooling and tests use the sparse [`SimMemory`].

use std::collections::BTreeMap;
use std::ops::Range;

use thiserror::Error;

/// Errors raised by bus accesses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The address range is not backed by memory.
    #[error("unmapped access at {addr:#x} ({len} bytes)")]
    Unmapped {
        /// First byte accessed.
        addr: u64,
        /// Access length in bytes.
        len: usize,
    },
    /// A word access was not 4-byte aligned.
    #[error("unaligned word access at {0:#x}")]
    Unaligned(u64),
}

/// Byte and word access to destination memory.
pub trait MemoryBus {
    /// Read `buf.len()` bytes starting at `addr`.
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BusError>;

    /// Write `data` starting at `addr`.
    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), BusError>;

    /// Read one little-endian word.
    fn read32(&mut self, addr: u64) -> Result<u32, BusError> {
        if addr % 4 != 0 {
            return Err(BusError::Unaligned(addr));
        }
        let mut word = [0u8; 4];
        self.read_bytes(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write one little-endian word.
    fn write32(&mut self, addr: u64, value: u32) -> Result<(), BusError> {
        if addr % 4 != 0 {
            return Err(BusError::Unaligned(addr));
        }
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, _us: u32) {}
}

const PAGE_SIZE: u64 = 0x1000;

/// Sparse simulated memory. Unwritten bytes read as zero.
#[derive(Debug, Default)]
pub struct SimMemory {
    pages: BTreeMap<u64, Box<[u8]>>,
    holes: Vec<Range<u64>>,
    elapsed_us: u64,
    writes: u64,
}

impl SimMemory {
    /// Empty memory with every address mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make accesses touching `range` fail with [`BusError::Unmapped`].
    pub fn unmap(&mut self, range: Range<u64>) {
        self.holes.push(range);
    }

    /// Total microseconds spent in [`MemoryBus::delay_us`].
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }

    /// Number of write accesses performed.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Read `len` bytes without going through the trait.
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let at = addr + i;
                self.pages
                    .get(&(at / PAGE_SIZE))
                    .map_or(0, |page| page[(at % PAGE_SIZE) as usize])
            })
            .collect()
    }

    /// Read one word without going through the trait.
    pub fn peek32(&self, addr: u64) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), BusError> {
        let end = addr.saturating_add(len as u64);
        if self.holes.iter().any(|h| addr < h.end && h.start < end) {
            return Err(BusError::Unmapped { addr, len });
        }
        Ok(())
    }
}

impl MemoryBus for SimMemory {
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BusError> {
        self.check(addr, buf.len())?;
        buf.copy_from_slice(&self.peek(addr, buf.len()));
        Ok(())
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), BusError> {
        self.check(addr, data.len())?;
        self.writes += 1;
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u64;
            let page = self
                .pages
                .entry(at / PAGE_SIZE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[(at % PAGE_SIZE) as usize] = *byte;
        }
        Ok(())
    }

    fn delay_us(&mut self, us: u32) {
        self.elapsed_us += u64::from(us);
    }
}
