// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serve boot images from memory.
// Author: Lukas Bower

use super::{BootDevice, CopyFlags, DeviceError};

/// Boot device backed by an in-memory image, as used for DDR and JTAG boot.
#[derive(Debug, Clone, Default)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// Device serving `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BootDevice for MemDevice {
    fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read(&mut self, src: u64, buf: &mut [u8], _flags: CopyFlags) -> Result<(), DeviceError> {
        let size = self.data.len() as u64;
        let end = src
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= size)
            .ok_or(DeviceError::OutOfRange {
                src,
                len: buf.len(),
                size,
            })?;
        buf.copy_from_slice(&self.data[src as usize..end as usize]);
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
