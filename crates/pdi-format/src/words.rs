// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Little-endian word cursor and checksum helpers for header codecs.
// Author: Lukas Bower

use crate::FormatError;

/// Ones-complement checksum over `words`: `!(w0 + w1 + ... + wn)` with wrapping adds.
#[must_use]
pub fn checksum(words: &[u32]) -> u32 {
    !words.iter().fold(0u32, |acc, w| acc.wrapping_add(*w))
}

/// Validate a structure whose final word is the checksum of all preceding words.
pub fn validate_checksum(what: &'static str, words: &[u32]) -> Result<(), FormatError> {
    let Some((stored, body)) = words.split_last() else {
        return Err(FormatError::Truncated {
            what,
            need: 4,
            have: 0,
        });
    };
    let computed = checksum(body);
    if computed != *stored {
        return Err(FormatError::Checksum {
            what,
            stored: *stored,
            computed,
        });
    }
    Ok(())
}

/// Sequential reader over a little-endian word buffer.
pub struct WordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WordReader<'a> {
    /// Wrap `buf`, requiring at least `need` bytes for `what`.
    pub fn new(what: &'static str, buf: &'a [u8], need: usize) -> Result<Self, FormatError> {
        if buf.len() < need {
            return Err(FormatError::Truncated {
                what,
                need,
                have: buf.len(),
            });
        }
        Ok(Self {
            buf: &buf[..need],
            pos: 0,
        })
    }

    /// Read the next word. Reads past the checked length yield zero.
    pub fn word(&mut self) -> u32 {
        let Some(bytes) = self.buf.get(self.pos..self.pos + 4) else {
            return 0;
        };
        self.pos += 4;
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Read a 64-bit value stored as low word then high word.
    pub fn dword(&mut self) -> u64 {
        let lo = u64::from(self.word());
        let hi = u64::from(self.word());
        (hi << 32) | lo
    }

    /// Read `N` consecutive words.
    pub fn array<const N: usize>(&mut self) -> [u32; N] {
        let mut out = [0u32; N];
        for slot in &mut out {
            *slot = self.word();
        }
        out
    }

    /// Read `count` consecutive words into a vector.
    pub fn vec(&mut self, count: usize) -> Vec<u32> {
        (0..count).map(|_| self.word()).collect()
    }

    /// All words of the checked region, independent of the cursor.
    #[must_use]
    pub fn all_words(&self) -> Vec<u32> {
        self.buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Sequential little-endian word writer.
#[derive(Default)]
pub struct WordWriter {
    words: Vec<u32>,
}

impl WordWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one word.
    pub fn word(&mut self, value: u32) {
        self.words.push(value);
    }

    /// Append a 64-bit value as low word then high word.
    pub fn dword(&mut self, value: u64) {
        self.words.push(value as u32);
        self.words.push((value >> 32) as u32);
    }

    /// Append a slice of words.
    pub fn words(&mut self, values: &[u32]) {
        self.words.extend_from_slice(values);
    }

    /// Words written so far.
    #[must_use]
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    /// Append the checksum of words `[from..]` and return the byte encoding.
    #[must_use]
    pub fn finish_with_checksum(mut self, from: usize) -> Vec<u8> {
        let sum = checksum(&self.words[from..]);
        self.words.push(sum);
        self.into_bytes()
    }

    /// Encode the written words as little-endian bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
