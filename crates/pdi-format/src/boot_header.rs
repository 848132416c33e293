// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode and encode the fixed-offset boot header.
// Author: Lukas Bower

//! Boot header layout (byte offsets from the image base):
//!
//! ```text
//!   0x0000  SMAP bus width words          4 words
//!   0x0010  width detection (0xAA995566)
//!   0x0014  image identification ("XNLX")
//!   0x0018  encryption key source
//!   0x001C  PLM source offset
//!   0x0020  PMC data load address
//!   0x0024  PMC data length
//!   0x0028  total PMC data length
//!   0x002C  PLM length
//!   0x0030  total PLM length
//!   0x0034  boot header attributes
//!   0x0038  black key                     8 words
//!   0x0058  black IV                      3 words
//!   0x0064  secure header IV              3 words
//!   0x0070  PUF shutter value
//!   0x0074  PMC data secure header IV     3 words
//!   0x0080  reserved                      17 words
//!   0x00C4  meta header offset
//!   0x00C8  reserved                      24 words
//!   0x0128  register init table           1024 words
//!   0x1128  PUF helper data               386 words
//!   0x1730  checksum over 0x0010..0x1730
//! ```

use crate::words::{validate_checksum, WordReader, WordWriter};
use crate::FormatError;

/// Byte length of the boot header including its checksum.
pub const BOOT_HEADER_LEN: usize = 0x1734;
/// Byte offset of the boot header from the image base.
pub const BOOT_HEADER_OFFSET: u64 = 0;
/// Expected width detection word.
pub const WIDTH_DETECTION: u32 = 0xAA99_5566;
/// Expected image identification word ("XNLX").
pub const IMAGE_IDENTIFICATION: u32 = 0x584C_4E58;

/// Words in the register initialisation table.
pub const REG_INIT_WORDS: usize = 1024;
/// Words of PUF helper data.
pub const PUF_HELPER_WORDS: usize = 386;

const SMAP_WORDS: usize = 4;
const RESERVED_A_WORDS: usize = 17;
const RESERVED_B_WORDS: usize = 24;

/// Fixed-size boot header read from the start of a full image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootHeader {
    /// SMAP bus width detection words.
    pub smap_width: [u32; SMAP_WORDS],
    /// Must equal [`WIDTH_DETECTION`].
    pub width_detection: u32,
    /// Must equal [`IMAGE_IDENTIFICATION`].
    pub image_id: u32,
    /// Encryption key source selector.
    pub enc_key_source: u32,
    /// Offset of the PLM within the image.
    pub plm_src_offset: u32,
    /// PMC data load address.
    pub pmc_data_load_addr: u32,
    /// PMC data length in bytes.
    pub pmc_data_len: u32,
    /// Total PMC data length including security overhead.
    pub total_pmc_data_len: u32,
    /// PLM length in bytes.
    pub plm_len: u32,
    /// Total PLM length including security overhead.
    pub total_plm_len: u32,
    /// Boot header attribute bits.
    pub attributes: u32,
    /// Black key material.
    pub black_key: [u32; 8],
    /// Black key IV.
    pub black_iv: [u32; 3],
    /// Secure header IV.
    pub secure_header_iv: [u32; 3],
    /// PUF shutter value.
    pub puf_shutter: u32,
    /// Secure header IV for PMC data.
    pub pmc_data_iv: [u32; 3],
    /// Reserved words between the IVs and the meta header offset.
    pub reserved_a: Vec<u32>,
    /// Byte offset of the image header table from the image base.
    pub meta_header_offset: u32,
    /// Reserved words before the register init table.
    pub reserved_b: Vec<u32>,
    /// Register initialisation address/value pairs.
    pub reg_init: Vec<u32>,
    /// PUF helper data.
    pub puf_helper: Vec<u32>,
    /// Stored checksum.
    pub checksum: u32,
}

impl Default for BootHeader {
    fn default() -> Self {
        Self {
            smap_width: [0xDD00_0000, 0x4400_2211, 0x0000_88CC, 0xAA99_5566],
            width_detection: WIDTH_DETECTION,
            image_id: IMAGE_IDENTIFICATION,
            enc_key_source: 0,
            plm_src_offset: 0,
            pmc_data_load_addr: 0,
            pmc_data_len: 0,
            total_pmc_data_len: 0,
            plm_len: 0,
            total_plm_len: 0,
            attributes: 0,
            black_key: [0; 8],
            black_iv: [0; 3],
            secure_header_iv: [0; 3],
            puf_shutter: 0,
            pmc_data_iv: [0; 3],
            reserved_a: vec![0; RESERVED_A_WORDS],
            meta_header_offset: 0,
            reserved_b: vec![0; RESERVED_B_WORDS],
            reg_init: vec![0xFFFF_FFFF; REG_INIT_WORDS],
            puf_helper: vec![0; PUF_HELPER_WORDS],
            checksum: 0,
        }
    }
}

impl BootHeader {
    /// Decode and validate a boot header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = WordReader::new("boot header", bytes, BOOT_HEADER_LEN)?;
        let header = Self {
            smap_width: r.array(),
            width_detection: r.word(),
            image_id: r.word(),
            enc_key_source: r.word(),
            plm_src_offset: r.word(),
            pmc_data_load_addr: r.word(),
            pmc_data_len: r.word(),
            total_pmc_data_len: r.word(),
            plm_len: r.word(),
            total_plm_len: r.word(),
            attributes: r.word(),
            black_key: r.array(),
            black_iv: r.array(),
            secure_header_iv: r.array(),
            puf_shutter: r.word(),
            pmc_data_iv: r.array(),
            reserved_a: r.vec(RESERVED_A_WORDS),
            meta_header_offset: r.word(),
            reserved_b: r.vec(RESERVED_B_WORDS),
            reg_init: r.vec(REG_INIT_WORDS),
            puf_helper: r.vec(PUF_HELPER_WORDS),
            checksum: r.word(),
        };
        if header.width_detection != WIDTH_DETECTION {
            return Err(FormatError::BadMagic {
                what: "width detection word",
                expected: WIDTH_DETECTION,
                found: header.width_detection,
            });
        }
        if header.image_id != IMAGE_IDENTIFICATION {
            return Err(FormatError::BadMagic {
                what: "image identification word",
                expected: IMAGE_IDENTIFICATION,
                found: header.image_id,
            });
        }
        validate_checksum("boot header", &r.all_words()[SMAP_WORDS..])?;
        if (header.meta_header_offset as usize) < BOOT_HEADER_LEN
            || header.meta_header_offset % 4 != 0
        {
            return Err(FormatError::InvalidOffset {
                what: "meta header",
                value: header.meta_header_offset,
            });
        }
        Ok(header)
    }

    /// Encode the header, recomputing the checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WordWriter::new();
        w.words(&self.smap_width);
        w.word(self.width_detection);
        w.word(self.image_id);
        w.word(self.enc_key_source);
        w.word(self.plm_src_offset);
        w.word(self.pmc_data_load_addr);
        w.word(self.pmc_data_len);
        w.word(self.total_pmc_data_len);
        w.word(self.plm_len);
        w.word(self.total_plm_len);
        w.word(self.attributes);
        w.words(&self.black_key);
        w.words(&self.black_iv);
        w.words(&self.secure_header_iv);
        w.word(self.puf_shutter);
        w.words(&self.pmc_data_iv);
        w.words(&fixed(&self.reserved_a, RESERVED_A_WORDS));
        w.word(self.meta_header_offset);
        w.words(&fixed(&self.reserved_b, RESERVED_B_WORDS));
        w.words(&fixed(&self.reg_init, REG_INIT_WORDS));
        w.words(&fixed(&self.puf_helper, PUF_HELPER_WORDS));
        w.finish_with_checksum(SMAP_WORDS)
    }
}

fn fixed(words: &[u32], len: usize) -> Vec<u32> {
    let mut out = words.to_vec();
    out.resize(len, 0);
    out
}
