// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Reference writer for command streams.
// Author: Lukas Bower

use super::general::{api, MODULE_ID};
use super::{CmdHeader, CDO_HEADER_WORDS, CDO_IDENTIFICATION, CDO_VERSION};

/// Builds a command stream, header included.
#[derive(Debug, Clone, Default)]
pub struct CdoBuilder {
    body: Vec<u32>,
    open: Vec<usize>,
}

impl CdoBuilder {
    /// Empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary command.
    #[must_use]
    pub fn command(mut self, module_id: u8, api_id: u8, payload: &[u32]) -> Self {
        CmdHeader::new(module_id, api_id, payload.len() as u32).encode_into(&mut self.body);
        self.body.extend_from_slice(payload);
        self
    }

    fn general(self, api_id: u8, payload: &[u32]) -> Self {
        self.command(MODULE_ID, api_id, payload)
    }

    /// Query whether the general module implements `api_id`.
    #[must_use]
    pub fn features(self, api_id: u8) -> Self {
        self.general(api::FEATURES, &[u32::from(api_id)])
    }

    /// Write a 32-bit register.
    #[must_use]
    pub fn write(self, addr: u32, value: u32) -> Self {
        self.general(api::WRITE, &[addr, value])
    }

    /// Write a register at a 64-bit address.
    #[must_use]
    pub fn write64(self, addr: u64, value: u32) -> Self {
        self.general(api::WRITE64, &[hi(addr), lo(addr), value])
    }

    /// Read-modify-write the bits selected by `mask`.
    #[must_use]
    pub fn mask_write(self, addr: u32, mask: u32, value: u32) -> Self {
        self.general(api::MASK_WRITE, &[addr, mask, value])
    }

    /// Read-modify-write at a 64-bit address.
    #[must_use]
    pub fn mask_write64(self, addr: u64, mask: u32, value: u32) -> Self {
        self.general(api::MASK_WRITE64, &[hi(addr), lo(addr), mask, value])
    }

    /// Poll until `reg & mask == expected`.
    #[must_use]
    pub fn mask_poll(self, addr: u32, mask: u32, expected: u32, timeout_us: u32) -> Self {
        self.general(api::MASK_POLL, &[addr, mask, expected, timeout_us])
    }

    /// Poll at a 64-bit address.
    #[must_use]
    pub fn mask_poll64(self, addr: u64, mask: u32, expected: u32, timeout_us: u32) -> Self {
        self.general(
            api::MASK_POLL64,
            &[hi(addr), lo(addr), mask, expected, timeout_us],
        )
    }

    /// Busy-wait.
    #[must_use]
    pub fn delay(self, us: u32) -> Self {
        self.general(api::DELAY, &[us])
    }

    /// Copy `data` to `addr`.
    #[must_use]
    pub fn dma_write(self, addr: u64, data: &[u32]) -> Self {
        let mut payload = vec![hi(addr), lo(addr)];
        payload.extend_from_slice(data);
        self.general(api::DMA_WRITE, &payload)
    }

    /// Stream `data` into a window of `window` bytes at `addr`.
    #[must_use]
    pub fn keyhole_write(self, addr: u64, window: u32, data: &[u32]) -> Self {
        let mut payload = vec![hi(addr), lo(addr), window];
        payload.extend_from_slice(data);
        self.general(api::KEYHOLE_WRITE, &payload)
    }

    /// Fill `count` words at `addr` with `value`.
    #[must_use]
    pub fn set(self, addr: u64, count: u32, value: u32) -> Self {
        self.general(api::SET, &[hi(addr), lo(addr), count, value])
    }

    /// Zero `count` words at `addr`.
    #[must_use]
    pub fn clear(self, addr: u64, count: u32) -> Self {
        self.general(api::CLEAR, &[hi(addr), lo(addr), count])
    }

    /// No-op carrying `words` words of padding.
    #[must_use]
    pub fn nop(self, words: usize) -> Self {
        self.general(api::NOP, &vec![0; words])
    }

    /// Log `message`.
    #[must_use]
    pub fn log(self, message: &str) -> Self {
        let mut bytes = message.as_bytes().to_vec();
        bytes.resize(bytes.len().div_ceil(4) * 4, 0);
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.general(api::LOG_STRING, &words)
    }

    /// Open a block; its length is filled in by the matching [`CdoBuilder::end`].
    #[must_use]
    pub fn begin(mut self) -> Self {
        self = self.general(api::BEGIN, &[0]);
        self.open.push(self.body.len() - 1);
        self
    }

    /// Close the innermost open block.
    #[must_use]
    pub fn end(mut self) -> Self {
        self = self.general(api::END, &[]);
        if let Some(slot) = self.open.pop() {
            self.body[slot] = (self.body.len() - (slot + 1)) as u32;
        }
        self
    }

    /// Leave the innermost `levels` blocks.
    #[must_use]
    pub fn break_blocks(self, levels: u32) -> Self {
        self.general(api::BREAK, &[levels])
    }

    /// Command words without the stream header.
    pub fn body(&self) -> &[u32] {
        &self.body
    }

    /// Stream words with header.
    pub fn finish(self) -> Vec<u32> {
        let mut words = vec![
            (CDO_HEADER_WORDS - 1) as u32,
            CDO_IDENTIFICATION,
            CDO_VERSION,
            self.body.len() as u32,
        ];
        words.push(pdi_format::checksum(&words));
        words.extend(self.body);
        words
    }

    /// Stream bytes with header.
    pub fn finish_bytes(self) -> Vec<u8> {
        self.finish().iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

fn hi(addr: u64) -> u32 {
    (addr >> 32) as u32
}

fn lo(addr: u64) -> u32 {
    addr as u32
}
