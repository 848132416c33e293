// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Caller-owned staging buffer for command stream chunks.
// Author: Lukas Bower

/// Two chunk-sized halves plus a decoded word view.
///
/// The loader copies a chunk into one half and, with double buffering, the
/// next chunk into the other half before the first one executes. The buffer
/// is lent to the loader for one partition at a time.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    chunk_size: usize,
    halves: [Vec<u8>; 2],
    words: Vec<u32>,
}

impl StagingBuffer {
    /// Buffer for chunks of `chunk_size` bytes, rounded down to 16 bytes and at least 16.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = (chunk_size & !0xF).max(16);
        Self {
            chunk_size,
            halves: [vec![0; chunk_size], vec![0; chunk_size]],
            words: Vec::with_capacity(chunk_size / 4),
        }
    }

    /// Bytes per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn half_mut(&mut self, half: usize) -> &mut [u8] {
        &mut self.halves[half & 1]
    }

    /// Decode the first `len` bytes of `half` as little-endian words.
    pub(crate) fn words(&mut self, half: usize, len: usize) -> &[u32] {
        self.words.clear();
        self.words.extend(
            self.halves[half & 1][..len]
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        &self.words
    }
}

/// Bytes to request for a transfer of `len` bytes.
///
/// Transfers are rounded up to `align`; the final chunk of a command stream
/// is only rounded to a word.
pub fn copy_len(len: usize, is_final_cdo_chunk: bool, align: usize) -> usize {
    let align = if is_final_cdo_chunk { 4 } else { align };
    len.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_lengths_round_to_alignment() {
        assert_eq!(copy_len(20, false, 16), 32);
        assert_eq!(copy_len(32, false, 16), 32);
        assert_eq!(copy_len(20, true, 16), 20);
        assert_eq!(copy_len(18, true, 16), 20);
        assert_eq!(copy_len(0, false, 16), 0);
    }

    #[test]
    fn chunk_size_is_aligned() {
        assert_eq!(StagingBuffer::new(0x1007).chunk_size(), 0x1000);
        assert_eq!(StagingBuffer::new(3).chunk_size(), 16);
    }

    #[test]
    fn words_decode_little_endian() {
        let mut staging = StagingBuffer::new(16);
        staging.half_mut(1)[..8].copy_from_slice(&[1, 0, 0, 0, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(staging.words(1, 8), &[1, 0x1234_5678]);
    }
}
