// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate that the reference writer and the header decoders agree field for field.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use pdi_format::{
    BootHeader, Cpu, ExecState, FormatError, ImageBuilder, ImageHeaderTable, Owner,
    PartitionHeader, PartitionSpec, VectorLocation, IMAGE_HEADER_TABLE_LEN, PARTITION_HEADER_LEN,
};

fn sample_builder() -> ImageBuilder {
    ImageBuilder::new()
        .boot_header(BootHeader {
            plm_len: 0x1_0000,
            attributes: 0xC0,
            black_iv: [1, 2, 3],
            ..BootHeader::default()
        })
        .table(ImageHeaderTable {
            idcode: 0x04CA_8093,
            pdi_id: 0x1234,
            ..ImageHeaderTable::default()
        })
        .partition(PartitionSpec::cdo(&[0x4, 0x584C_4E58, 0x200, 0, !0x584C_4E5Cu32]).id(1))
        .partition(
            PartitionSpec::data(0xFFFC_0000, vec![0xAB; 37])
                .for_cpu(Cpu::R5_0, 0xFFFC_0000)
                .exec_state(ExecState::Aarch32)
                .vector(VectorLocation::High)
                .id(2),
        )
        .partition(PartitionSpec::data(0x8000_0000, vec![0x11; 4096]).owner(Owner::NonPlm))
        .partition(
            PartitionSpec::data(0x1_0000_0000, vec![7; 64]).for_cpu(Cpu::A72_0, 0x1_0000_0000),
        )
}

#[test]
fn headers_round_trip_bit_for_bit() {
    let built = sample_builder().build();
    let bytes = &built.bytes;

    let boot = BootHeader::decode(bytes).expect("boot header");
    assert_eq!(Some(&boot), built.boot_header.as_ref());

    let meta = boot.meta_header_offset as usize;
    let table =
        ImageHeaderTable::decode(&bytes[meta..meta + IMAGE_HEADER_TABLE_LEN]).expect("table");
    assert_eq!(table, built.table);
    assert_eq!(table.partition_count, 4);

    let base = table.partition_headers_offset() as usize;
    for (index, expected) in built.partitions.iter().enumerate() {
        let at = base + index * PARTITION_HEADER_LEN;
        let header = PartitionHeader::decode(&bytes[at..at + PARTITION_HEADER_LEN], index)
            .expect("partition header");
        assert_eq!(&header, expected);
        assert_eq!(header.encode(), bytes[at..at + PARTITION_HEADER_LEN].to_vec());
    }
}

#[test]
fn payloads_land_at_declared_offsets() {
    let built = sample_builder().build();
    let second = &built.partitions[1];
    let start = second.src_byte_offset() as usize;
    assert_eq!(second.unenc_word_len, 10);
    assert_eq!(&built.bytes[start..start + 37], &[0xAB; 37][..]);
    assert_eq!(&built.bytes[start + 37..start + 40], &[0, 0, 0][..]);
}

#[test]
fn partial_image_starts_with_table() {
    let built = ImageBuilder::partial()
        .partition(PartitionSpec::data(0x1000, vec![1; 8]))
        .build();
    assert!(built.boot_header.is_none());
    let table = ImageHeaderTable::decode(&built.bytes).expect("table at offset zero");
    assert_eq!(table.partition_count, 1);
    assert!(matches!(
        BootHeader::decode(&built.bytes),
        Err(FormatError::Truncated { .. } | FormatError::BadMagic { .. })
    ));
}
