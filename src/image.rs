// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read and validate the meta header before any partition is copied.
// Author: Lukas Bower

//! Meta-header parser.
//!
//! The boot header, the image header table and the partition header array
//! are read through the copy registry and fully validated before the loader
//! touches partition content. One bad header aborts the whole load.

use log::{debug, info};
use pdi_format::{
    BootHeader, ImageHeaderTable, PartitionHeader, BOOT_HEADER_LEN, BOOT_HEADER_OFFSET,
    IMAGE_HEADER_TABLE_LEN, PARTITION_HEADER_LEN,
};

use crate::device::{CopyCapability, CopyFlags, DeviceRegistry};
use crate::error::LoaderError;

const HEADER_FLAGS: CopyFlags = CopyFlags::PMCDMA_0;

/// Validated headers of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    /// Boot header; absent for partial images.
    pub boot_header: Option<BootHeader>,
    /// Image header table.
    pub table: ImageHeaderTable,
    /// Partition headers in table order, indexed from zero.
    pub partitions: Vec<PartitionHeader>,
}

impl MetaHeader {
    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

/// Read the fixed-offset boot header of the image at `image_base`.
pub fn read_boot_header(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    image_base: u64,
) -> Result<BootHeader, LoaderError> {
    let mut buf = vec![0u8; BOOT_HEADER_LEN];
    registry.read(cap, image_base + BOOT_HEADER_OFFSET, &mut buf, HEADER_FLAGS)?;
    let header = BootHeader::decode(&buf)?;
    debug!(
        "[image] boot header ok, meta header at {:#x}",
        header.meta_header_offset
    );
    Ok(header)
}

/// Read the image header table at `meta_offset` and check its checksum and bounds.
pub fn read_and_validate_image_header_table(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    image_base: u64,
    meta_offset: u64,
) -> Result<ImageHeaderTable, LoaderError> {
    let mut buf = [0u8; IMAGE_HEADER_TABLE_LEN];
    registry.read(cap, image_base + meta_offset, &mut buf, HEADER_FLAGS)?;
    let table = ImageHeaderTable::decode(&buf)?;
    debug!(
        "[image] header table ok: {} partitions at {:#x}",
        table.partition_count,
        table.partition_headers_offset()
    );
    Ok(table)
}

/// Read every partition header named by `table` and verify each one.
pub fn read_and_verify_partition_headers(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    image_base: u64,
    table: &ImageHeaderTable,
) -> Result<Vec<PartitionHeader>, LoaderError> {
    let count = table.partition_count as usize;
    let mut buf = vec![0u8; count * PARTITION_HEADER_LEN];
    registry.read(
        cap,
        image_base + table.partition_headers_offset(),
        &mut buf,
        HEADER_FLAGS,
    )?;
    buf.chunks_exact(PARTITION_HEADER_LEN)
        .enumerate()
        .map(|(index, bytes)| PartitionHeader::decode(bytes, index).map_err(LoaderError::from))
        .collect()
}

/// Read the complete meta header. Partial images carry no boot header and
/// start with the image header table.
pub fn read_meta_header(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    image_base: u64,
    partial: bool,
) -> Result<MetaHeader, LoaderError> {
    let (boot_header, meta_offset) = if partial {
        (None, 0)
    } else {
        let header = read_boot_header(registry, cap, image_base)?;
        let offset = u64::from(header.meta_header_offset);
        (Some(header), offset)
    };
    let table = read_and_validate_image_header_table(registry, cap, image_base, meta_offset)?;
    let partitions = read_and_verify_partition_headers(registry, cap, image_base, &table)?;
    for header in &partitions {
        info!("[image] {header}");
    }
    Ok(MetaHeader {
        boot_header,
        table,
        partitions,
    })
}
