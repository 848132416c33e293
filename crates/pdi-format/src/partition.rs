// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode, validate and encode partition headers.
// Author: Lukas Bower

use core::fmt;

use crate::words::{validate_checksum, WordReader, WordWriter};
use crate::FormatError;

/// Byte length of one partition header.
pub const PARTITION_HEADER_LEN: usize = 0x80;

/// Attribute mask for the execution state of A-class cores (set = AArch32).
pub const ATTR_EXEC_STATE_MASK: u32 = 0x0000_0008;
/// Attribute mask for the destination CPU.
pub const ATTR_DEST_CPU_MASK: u32 = 0x0000_0F00;
/// Attribute mask for the partition owner.
pub const ATTR_OWNER_MASK: u32 = 0x0003_0000;
/// Attribute mask for the high vector selection of R-class cores.
pub const ATTR_HIVEC_MASK: u32 = 0x0080_0000;
/// Attribute mask for the partition type.
pub const ATTR_TYPE_MASK: u32 = 0x0700_0000;

const DEST_CPU_SHIFT: u32 = 8;
const OWNER_SHIFT: u32 = 16;
const TYPE_SHIFT: u32 = 24;

/// Partition payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum PartitionType {
    /// ELF image.
    Elf = 1,
    /// Command stream (CDO).
    Cdo = 2,
    /// Configuration frame data.
    Cfi = 3,
    /// Raw data.
    Raw = 4,
    /// Raw ELF data.
    RawElf = 5,
    /// Global signal configuration frames.
    CfiGsc = 6,
    /// Global signal configuration frames, unmask pass.
    CfiGscUnmask = 7,
}

impl TryFrom<u32> for PartitionType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use PartitionType::*;
        Ok(match value {
            1 => Elf,
            2 => Cdo,
            3 => Cfi,
            4 => Raw,
            5 => RawElf,
            6 => CfiGsc,
            7 => CfiGscUnmask,
            other => return Err(other),
        })
    }
}

/// How the loader processes a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Stream of command objects run through the interpreter.
    CommandStream,
    /// Executable or data bytes copied to the load address.
    Data,
}

/// Partition owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Owner {
    /// Loaded by this loader.
    Plm,
    /// Loaded by another agent sharing the image.
    NonPlm,
}

/// Destination processor of a partition.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum Cpu {
    /// No destination processor.
    None = 0,
    /// Application core 0.
    A72_0 = 1,
    /// Application core 1.
    A72_1 = 2,
    /// Real-time core 0.
    R5_0 = 5,
    /// Real-time core 1.
    R5_1 = 6,
    /// Real-time cores in lockstep.
    R5Lockstep = 7,
    /// Processing system manager.
    Psm = 8,
}

impl TryFrom<u32> for Cpu {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Cpu::None,
            1 => Cpu::A72_0,
            2 => Cpu::A72_1,
            5 => Cpu::R5_0,
            6 => Cpu::R5_1,
            7 => Cpu::R5Lockstep,
            8 => Cpu::Psm,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cpu::None => "none",
            Cpu::A72_0 => "a72-0",
            Cpu::A72_1 => "a72-1",
            Cpu::R5_0 => "r5-0",
            Cpu::R5_1 => "r5-1",
            Cpu::R5Lockstep => "r5-lockstep",
            Cpu::Psm => "psm",
        };
        f.write_str(name)
    }
}

/// Execution state of the destination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ExecState {
    /// 64-bit.
    Aarch64,
    /// 32-bit.
    Aarch32,
}

/// Exception vector location of the destination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum VectorLocation {
    /// Low vectors.
    Low,
    /// High vectors.
    High,
}

/// One partition header. Indices are zero-based.
///
/// Word layout: encrypted length, unencrypted length, total length, next
/// partition offset, execution address (2 words), load address (2 words), data
/// word offset, attributes, section count, checksum word offset, partition id,
/// authentication certificate offset, 3 IV words, encryption status, 3 KEK IV
/// words, encryption revoke id, 9 reserved, checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PartitionHeader {
    /// Zero-based position in the partition header array.
    pub index: usize,
    /// Encrypted length in words.
    pub enc_word_len: u32,
    /// Unencrypted length in words.
    pub unenc_word_len: u32,
    /// Total length in words including any authentication certificate.
    pub total_word_len: u32,
    /// Word offset of the next partition header.
    pub next_header_word_offset: u32,
    /// Execution address on the destination core.
    pub dest_exec_addr: u64,
    /// Load address.
    pub dest_load_addr: u64,
    /// Word offset of the partition payload from the image base.
    pub data_word_offset: u32,
    /// Raw attribute bits.
    pub attributes: u32,
    /// Section count.
    pub section_count: u32,
    /// Word offset of the checksum when enabled.
    pub checksum_word_offset: u32,
    /// Partition identifier.
    pub partition_id: u32,
    /// Word offset of the authentication certificate, zero when unsigned.
    pub auth_cert_word_offset: u32,
    /// Secure header IV.
    pub iv: [u32; 3],
    /// Encryption status / key selection, zero when plaintext.
    pub enc_status: u32,
    /// KEK IV.
    pub kek_iv: [u32; 3],
    /// Revocation id for encrypted partitions.
    pub enc_revoke_id: u32,
    /// Reserved words.
    pub reserved: [u32; 9],
    /// Stored checksum.
    pub checksum: u32,
}

impl Default for PartitionHeader {
    fn default() -> Self {
        Self {
            index: 0,
            enc_word_len: 0,
            unenc_word_len: 0,
            total_word_len: 0,
            next_header_word_offset: 0,
            dest_exec_addr: 0,
            dest_load_addr: 0,
            data_word_offset: 0,
            attributes: 0,
            section_count: 0,
            checksum_word_offset: 0,
            partition_id: 0,
            auth_cert_word_offset: 0,
            iv: [0; 3],
            enc_status: 0,
            kek_iv: [0; 3],
            enc_revoke_id: 0,
            reserved: [0; 9],
            checksum: 0,
        }
    }
}

impl PartitionHeader {
    /// Decode header `index` and verify its checksum and field ranges.
    pub fn decode(bytes: &[u8], index: usize) -> Result<Self, FormatError> {
        let mut r = WordReader::new("partition header", bytes, PARTITION_HEADER_LEN)?;
        let header = Self {
            index,
            enc_word_len: r.word(),
            unenc_word_len: r.word(),
            total_word_len: r.word(),
            next_header_word_offset: r.word(),
            dest_exec_addr: r.dword(),
            dest_load_addr: r.dword(),
            data_word_offset: r.word(),
            attributes: r.word(),
            section_count: r.word(),
            checksum_word_offset: r.word(),
            partition_id: r.word(),
            auth_cert_word_offset: r.word(),
            iv: r.array(),
            enc_status: r.word(),
            kek_iv: r.array(),
            enc_revoke_id: r.word(),
            reserved: r.array(),
            checksum: r.word(),
        };
        validate_checksum("partition header", &r.all_words())?;
        header.validate()?;
        Ok(header)
    }

    /// Check field ranges. A failure here aborts the whole load.
    pub fn validate(&self) -> Result<(), FormatError> {
        let invalid = |field: &'static str, value: u64| FormatError::InvalidPartition {
            index: self.index,
            field,
            value,
        };
        if self.enc_word_len == 0 || self.unenc_word_len == 0 || self.total_word_len == 0 {
            return Err(invalid("length", 0));
        }
        if self.total_word_len < self.unenc_word_len || self.total_word_len < self.enc_word_len {
            return Err(invalid("total length", u64::from(self.total_word_len)));
        }
        if self.data_word_offset == 0 {
            return Err(invalid("data offset", 0));
        }
        PartitionType::try_from((self.attributes & ATTR_TYPE_MASK) >> TYPE_SHIFT)
            .map_err(|v| invalid("partition type", u64::from(v)))?;
        Cpu::try_from((self.attributes & ATTR_DEST_CPU_MASK) >> DEST_CPU_SHIFT)
            .map_err(|v| invalid("destination cpu", u64::from(v)))?;
        let owner = (self.attributes & ATTR_OWNER_MASK) >> OWNER_SHIFT;
        if owner > 1 {
            return Err(invalid("owner", u64::from(owner)));
        }
        Ok(())
    }

    /// Encode the header, recomputing the checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WordWriter::new();
        w.word(self.enc_word_len);
        w.word(self.unenc_word_len);
        w.word(self.total_word_len);
        w.word(self.next_header_word_offset);
        w.dword(self.dest_exec_addr);
        w.dword(self.dest_load_addr);
        w.word(self.data_word_offset);
        w.word(self.attributes);
        w.word(self.section_count);
        w.word(self.checksum_word_offset);
        w.word(self.partition_id);
        w.word(self.auth_cert_word_offset);
        w.words(&self.iv);
        w.word(self.enc_status);
        w.words(&self.kek_iv);
        w.word(self.enc_revoke_id);
        w.words(&self.reserved);
        w.finish_with_checksum(0)
    }

    /// Partition type. Validated headers always carry a known type.
    #[must_use]
    pub fn partition_type(&self) -> PartitionType {
        PartitionType::try_from((self.attributes & ATTR_TYPE_MASK) >> TYPE_SHIFT)
            .unwrap_or(PartitionType::Raw)
    }

    /// Processing kind derived from the partition type.
    #[must_use]
    pub fn kind(&self) -> PartitionKind {
        match self.partition_type() {
            PartitionType::Cdo => PartitionKind::CommandStream,
            _ => PartitionKind::Data,
        }
    }

    /// Partition owner.
    #[must_use]
    pub fn owner(&self) -> Owner {
        if self.attributes & ATTR_OWNER_MASK == 0 {
            Owner::Plm
        } else {
            Owner::NonPlm
        }
    }

    /// Destination processor. Validated headers always carry a known CPU.
    #[must_use]
    pub fn dest_cpu(&self) -> Cpu {
        Cpu::try_from((self.attributes & ATTR_DEST_CPU_MASK) >> DEST_CPU_SHIFT).unwrap_or(Cpu::None)
    }

    /// Execution state of the destination core.
    #[must_use]
    pub fn exec_state(&self) -> ExecState {
        if self.attributes & ATTR_EXEC_STATE_MASK == 0 {
            ExecState::Aarch64
        } else {
            ExecState::Aarch32
        }
    }

    /// Vector location of the destination core.
    #[must_use]
    pub fn vector_location(&self) -> VectorLocation {
        if self.attributes & ATTR_HIVEC_MASK == 0 {
            VectorLocation::Low
        } else {
            VectorLocation::High
        }
    }

    /// Byte offset of the payload from the image base.
    #[must_use]
    pub fn src_byte_offset(&self) -> u64 {
        u64::from(self.data_word_offset) * 4
    }

    /// Unencrypted payload length in bytes.
    #[must_use]
    pub fn unenc_byte_len(&self) -> u64 {
        u64::from(self.unenc_word_len) * 4
    }

    /// Whether the payload is encrypted or carries an authentication certificate.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.enc_status != 0 || self.auth_cert_word_offset != 0
    }

    /// Compose the attribute word from typed fields.
    #[must_use]
    pub fn attributes_for(
        ty: PartitionType,
        owner: Owner,
        cpu: Cpu,
        exec_state: ExecState,
        vector: VectorLocation,
    ) -> u32 {
        let mut attrs = ((ty as u32) << TYPE_SHIFT) | ((cpu as u32) << DEST_CPU_SHIFT);
        if owner == Owner::NonPlm {
            attrs |= 1 << OWNER_SHIFT;
        }
        if exec_state == ExecState::Aarch32 {
            attrs |= ATTR_EXEC_STATE_MASK;
        }
        if vector == VectorLocation::High {
            attrs |= ATTR_HIVEC_MASK;
        }
        attrs
    }
}

impl fmt::Display for PartitionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition #{} id={:#x} type={:?} owner={:?} cpu={} load={:#x} exec={:#x} len={}w",
            self.index,
            self.partition_id,
            self.partition_type(),
            self.owner(),
            self.dest_cpu(),
            self.dest_load_addr,
            self.dest_exec_addr,
            self.unenc_word_len,
        )
    }
}
