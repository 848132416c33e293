// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide the boot image header layouts and codec shared by the loader and tooling.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Boot image (PDI) header layouts.
//!
//! The boot header, image header table and partition header array are an
//! external contract with the packaging and signing tools, so every layout in
//! this crate is bit-exact: all fields are little-endian 32-bit words and every
//! structure ends with a ones-complement checksum word.
//!
//! ```text
//!   image base + 0x0000  boot header         (0x1734 bytes, full images only)
//!   image base + meta    image header table  (0x80 bytes)
//!   image base + ph*4    partition headers   (0x80 bytes each)
//!   image base + data*4  partition payloads
//! ```

mod boot_header;
mod builder;
mod partition;
mod table;
mod words;

pub use boot_header::*;
pub use builder::{BuiltImage, ImageBuilder, PartitionSpec};
pub use partition::*;
pub use table::*;
pub use words::{checksum, validate_checksum, WordReader, WordWriter};

/// Errors produced while decoding or validating boot image headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Input buffer was shorter than the fixed structure length.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        /// Structure being decoded.
        what: &'static str,
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },
    /// A fixed identification word did not match.
    #[error("bad {what}: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        /// Field that carried the mismatching word.
        what: &'static str,
        /// Expected value.
        expected: u32,
        /// Value found in the image.
        found: u32,
    },
    /// The trailing checksum word did not match the computed checksum.
    #[error("{what} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Structure whose checksum failed.
        what: &'static str,
        /// Checksum stored in the image.
        stored: u32,
        /// Checksum computed over the structure.
        computed: u32,
    },
    /// Partition count is zero or exceeds [`MAX_PARTITIONS`].
    #[error("partition count {0} outside 1..={max}", max = MAX_PARTITIONS)]
    PartitionCount(u32),
    /// Image count exceeds [`MAX_IMAGES`].
    #[error("image count {0} exceeds {max}", max = MAX_IMAGES)]
    ImageCount(u32),
    /// A partition header field is out of range.
    #[error("partition {index}: invalid {field} ({value:#x})")]
    InvalidPartition {
        /// Zero-based partition index.
        index: usize,
        /// Offending field.
        field: &'static str,
        /// Raw field value.
        value: u64,
    },
    /// A table offset points inside the boot header or is zero.
    #[error("invalid {what} offset {value:#x}")]
    InvalidOffset {
        /// Offset being validated.
        what: &'static str,
        /// Raw offset value.
        value: u32,
    },
}
