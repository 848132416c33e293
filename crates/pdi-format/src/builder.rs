// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Reference writer assembling bit-exact boot images for tooling and tests.
// Author: Lukas Bower

use crate::{
    BootHeader, Cpu, ExecState, ImageHeaderTable, Owner, PartitionHeader, PartitionType,
    VectorLocation, BOOT_HEADER_LEN, IMAGE_HEADER_TABLE_LEN, PARTITION_HEADER_LEN,
};

const DATA_ALIGN: usize = 64;

/// Description of one partition to place in a built image.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Partition type.
    pub ty: PartitionType,
    /// Owner.
    pub owner: Owner,
    /// Destination CPU.
    pub cpu: Cpu,
    /// Execution state.
    pub exec_state: ExecState,
    /// Vector location.
    pub vector: VectorLocation,
    /// Load address.
    pub load_addr: u64,
    /// Execution address.
    pub exec_addr: u64,
    /// Partition identifier.
    pub partition_id: u32,
    /// Encryption status word written to the header.
    pub enc_status: u32,
    /// Payload bytes, zero padded to a word boundary when built.
    pub data: Vec<u8>,
}

impl PartitionSpec {
    /// A data partition loaded at `load_addr`.
    #[must_use]
    pub fn data(load_addr: u64, data: Vec<u8>) -> Self {
        Self {
            ty: PartitionType::Raw,
            owner: Owner::Plm,
            cpu: Cpu::None,
            exec_state: ExecState::Aarch64,
            vector: VectorLocation::Low,
            load_addr,
            exec_addr: 0,
            partition_id: 0,
            enc_status: 0,
            data,
        }
    }

    /// A command stream partition holding `words`.
    #[must_use]
    pub fn cdo(words: &[u32]) -> Self {
        Self {
            ty: PartitionType::Cdo,
            data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
            ..Self::data(0, Vec::new())
        }
    }

    /// Mark the partition as destined for `cpu`, entering at `exec_addr`.
    #[must_use]
    pub fn for_cpu(mut self, cpu: Cpu, exec_addr: u64) -> Self {
        self.ty = PartitionType::Elf;
        self.cpu = cpu;
        self.exec_addr = exec_addr;
        self
    }

    /// Set the owner.
    #[must_use]
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Set the execution state.
    #[must_use]
    pub fn exec_state(mut self, state: ExecState) -> Self {
        self.exec_state = state;
        self
    }

    /// Set the vector location.
    #[must_use]
    pub fn vector(mut self, vector: VectorLocation) -> Self {
        self.vector = vector;
        self
    }

    /// Set the partition identifier.
    #[must_use]
    pub fn id(mut self, id: u32) -> Self {
        self.partition_id = id;
        self
    }

    /// Set the encryption status word.
    #[must_use]
    pub fn encrypted(mut self, enc_status: u32) -> Self {
        self.enc_status = enc_status;
        self
    }
}

/// Built image bytes together with the headers that were written.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Image bytes.
    pub bytes: Vec<u8>,
    /// Boot header, absent for partial images.
    pub boot_header: Option<BootHeader>,
    /// Image header table.
    pub table: ImageHeaderTable,
    /// Partition headers in table order.
    pub partitions: Vec<PartitionHeader>,
}

/// Reference writer for boot images.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    partial: bool,
    boot_header: BootHeader,
    table: ImageHeaderTable,
    partitions: Vec<PartitionSpec>,
}

impl ImageBuilder {
    /// Builder for a full image starting with a boot header.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for a partial image starting with the image header table.
    #[must_use]
    pub fn partial() -> Self {
        Self {
            partial: true,
            ..Self::default()
        }
    }

    /// Override boot header fields; offsets and checksum are recomputed on build.
    #[must_use]
    pub fn boot_header(mut self, header: BootHeader) -> Self {
        self.boot_header = header;
        self
    }

    /// Override table fields; counts, offsets and checksum are recomputed on build.
    #[must_use]
    pub fn table(mut self, table: ImageHeaderTable) -> Self {
        self.table = table;
        self
    }

    /// Append a partition.
    #[must_use]
    pub fn partition(mut self, spec: PartitionSpec) -> Self {
        self.partitions.push(spec);
        self
    }

    /// Lay out and encode the image.
    #[must_use]
    pub fn build(self) -> BuiltImage {
        let meta_offset = if self.partial {
            0
        } else {
            align_up(BOOT_HEADER_LEN, DATA_ALIGN)
        };
        let headers_offset = meta_offset + IMAGE_HEADER_TABLE_LEN;
        let mut data_offset = align_up(
            headers_offset + PARTITION_HEADER_LEN * self.partitions.len(),
            DATA_ALIGN,
        );

        let mut partitions = Vec::with_capacity(self.partitions.len());
        let mut payloads = Vec::with_capacity(self.partitions.len());
        for (index, spec) in self.partitions.iter().enumerate() {
            let mut data = spec.data.clone();
            data.resize(align_up(data.len().max(4), 4), 0);
            let words = (data.len() / 4) as u32;
            let next = if index + 1 < self.partitions.len() {
                ((headers_offset + PARTITION_HEADER_LEN * (index + 1)) / 4) as u32
            } else {
                0
            };
            let mut header = PartitionHeader {
                index,
                enc_word_len: words,
                unenc_word_len: words,
                total_word_len: words,
                next_header_word_offset: next,
                dest_exec_addr: spec.exec_addr,
                dest_load_addr: spec.load_addr,
                data_word_offset: (data_offset / 4) as u32,
                attributes: PartitionHeader::attributes_for(
                    spec.ty,
                    spec.owner,
                    spec.cpu,
                    spec.exec_state,
                    spec.vector,
                ),
                partition_id: spec.partition_id,
                enc_status: spec.enc_status,
                ..PartitionHeader::default()
            };
            header.checksum = trailing_word(&header.encode());
            payloads.push((data_offset, data));
            data_offset = align_up(data_offset + payloads[index].1.len(), DATA_ALIGN);
            partitions.push(header);
        }

        let mut table = self.table;
        table.partition_count = partitions.len() as u32;
        table.partition_header_word_offset = (headers_offset / 4) as u32;
        table.total_header_len = (headers_offset + PARTITION_HEADER_LEN * partitions.len()
            - meta_offset) as u32;
        table.checksum = trailing_word(&table.encode());

        let mut bytes = vec![0u8; data_offset];
        let boot_header = if self.partial {
            None
        } else {
            let mut header = self.boot_header;
            header.meta_header_offset = meta_offset as u32;
            let encoded = header.encode();
            header.checksum = trailing_word(&encoded);
            bytes[..BOOT_HEADER_LEN].copy_from_slice(&encoded);
            Some(header)
        };
        bytes[meta_offset..headers_offset].copy_from_slice(&table.encode());
        for (index, header) in partitions.iter().enumerate() {
            let at = headers_offset + PARTITION_HEADER_LEN * index;
            bytes[at..at + PARTITION_HEADER_LEN].copy_from_slice(&header.encode());
        }
        for (offset, data) in &payloads {
            bytes[*offset..*offset + data.len()].copy_from_slice(data);
        }

        BuiltImage {
            bytes,
            boot_header,
            table,
            partitions,
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn trailing_word(bytes: &[u8]) -> u32 {
    let n = bytes.len();
    u32::from_le_bytes([bytes[n - 4], bytes[n - 3], bytes[n - 2], bytes[n - 1]])
}
