// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode and encode the image header table.
// Author: Lukas Bower

use crate::words::{validate_checksum, WordReader, WordWriter};
use crate::FormatError;

/// Byte length of the image header table.
pub const IMAGE_HEADER_TABLE_LEN: usize = 0x80;
/// Upper bound on partitions in one image.
pub const MAX_PARTITIONS: u32 = 32;
/// Upper bound on images in one boot image.
pub const MAX_IMAGES: u32 = 32;
/// Image header table version written by the reference builder.
pub const IHT_VERSION: u32 = 0x0004_0000;

/// Image header table: partition count, table location and checksum.
///
/// Word layout: version, image count, image header word offset, partition
/// count, partition header word offset, secondary boot device address, IDCODE,
/// attributes, PDI id, 3 reserved, total header length, 3 meta header IV words,
/// encryption key source, extended IDCODE, AC offset, 3 KEK IV words, optional
/// data length, 8 reserved, checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageHeaderTable {
    /// Table format version.
    pub version: u32,
    /// Number of image headers.
    pub image_count: u32,
    /// Word offset of the first image header.
    pub image_header_word_offset: u32,
    /// Number of partition headers.
    pub partition_count: u32,
    /// Word offset of the first partition header.
    pub partition_header_word_offset: u32,
    /// Secondary boot device address.
    pub sbd_addr: u32,
    /// Device IDCODE the image targets.
    pub idcode: u32,
    /// Attribute bits.
    pub attributes: u32,
    /// Image identifier.
    pub pdi_id: u32,
    /// Reserved words.
    pub reserved: [u32; 3],
    /// Total meta header length.
    pub total_header_len: u32,
    /// Meta header secure header IV.
    pub iv_meta_header: [u32; 3],
    /// Encryption key source for headers.
    pub enc_key_source: u32,
    /// Extended IDCODE.
    pub ext_idcode: u32,
    /// Authentication certificate offset of the meta header.
    pub ac_offset: u32,
    /// KEK IV for meta header decryption.
    pub kek_iv: [u32; 3],
    /// Optional data length in words.
    pub optional_data_len: u32,
    /// Trailing reserved words.
    pub reserved_tail: [u32; 8],
    /// Stored checksum.
    pub checksum: u32,
}

impl Default for ImageHeaderTable {
    fn default() -> Self {
        Self {
            version: IHT_VERSION,
            image_count: 1,
            image_header_word_offset: 0,
            partition_count: 0,
            partition_header_word_offset: 0,
            sbd_addr: 0,
            idcode: 0,
            attributes: 0,
            pdi_id: 0,
            reserved: [0; 3],
            total_header_len: 0,
            iv_meta_header: [0; 3],
            enc_key_source: 0,
            ext_idcode: 0,
            ac_offset: 0,
            kek_iv: [0; 3],
            optional_data_len: 0,
            reserved_tail: [0; 8],
            checksum: 0,
        }
    }
}

impl ImageHeaderTable {
    /// Decode and validate the table: checksum, partition and image bounds.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = WordReader::new("image header table", bytes, IMAGE_HEADER_TABLE_LEN)?;
        let table = Self {
            version: r.word(),
            image_count: r.word(),
            image_header_word_offset: r.word(),
            partition_count: r.word(),
            partition_header_word_offset: r.word(),
            sbd_addr: r.word(),
            idcode: r.word(),
            attributes: r.word(),
            pdi_id: r.word(),
            reserved: r.array(),
            total_header_len: r.word(),
            iv_meta_header: r.array(),
            enc_key_source: r.word(),
            ext_idcode: r.word(),
            ac_offset: r.word(),
            kek_iv: r.array(),
            optional_data_len: r.word(),
            reserved_tail: r.array(),
            checksum: r.word(),
        };
        validate_checksum("image header table", &r.all_words())?;
        if table.partition_count == 0 || table.partition_count > MAX_PARTITIONS {
            return Err(FormatError::PartitionCount(table.partition_count));
        }
        if table.image_count > MAX_IMAGES {
            return Err(FormatError::ImageCount(table.image_count));
        }
        if table.partition_header_word_offset == 0 {
            return Err(FormatError::InvalidOffset {
                what: "partition header table",
                value: 0,
            });
        }
        Ok(table)
    }

    /// Encode the table, recomputing the checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WordWriter::new();
        w.word(self.version);
        w.word(self.image_count);
        w.word(self.image_header_word_offset);
        w.word(self.partition_count);
        w.word(self.partition_header_word_offset);
        w.word(self.sbd_addr);
        w.word(self.idcode);
        w.word(self.attributes);
        w.word(self.pdi_id);
        w.words(&self.reserved);
        w.word(self.total_header_len);
        w.words(&self.iv_meta_header);
        w.word(self.enc_key_source);
        w.word(self.ext_idcode);
        w.word(self.ac_offset);
        w.words(&self.kek_iv);
        w.word(self.optional_data_len);
        w.words(&self.reserved_tail);
        w.finish_with_checksum(0)
    }

    /// Byte offset of the partition header array from the image base.
    #[must_use]
    pub fn partition_headers_offset(&self) -> u64 {
        u64::from(self.partition_header_word_offset) * 4
    }
}
