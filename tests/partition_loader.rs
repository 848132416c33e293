// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end partition loading, handoff recording and core start-up.
// Author: Lukas Bower

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{init_logging, loader, loader_with, touched, RecordingPm};
use plm_loader::pdi_format::{
    Cpu, ExecState, ImageBuilder, Owner, PartitionHeader, PartitionSpec, VectorLocation,
};
use plm_loader::{
    BootSource, CdoBuilder, CdoError, ErrorPolicy, HandoffError, LoaderConfig, LoaderError,
    MemoryBus, PartitionError, PartitionSecurity, PartitionState, SecurityError, SimMemory, Stage,
    StagingBuffer,
};

const XOR_KEY: u8 = 0x5A;

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_KEY).collect()
}

struct XorHook {
    calls: Rc<Cell<usize>>,
}

impl PartitionSecurity for XorHook {
    fn authenticate_and_decrypt(
        &mut self,
        header: &PartitionHeader,
        data: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        self.calls.set(self.calls.get() + 1);
        if header.partition_id == 0xBAD {
            return Err(SecurityError::Authentication("signature mismatch".into()));
        }
        Ok(xor(data))
    }
}

fn small_chunks(double_buffer: bool) -> LoaderConfig {
    LoaderConfig {
        chunk_size: 64,
        double_buffer,
        ..LoaderConfig::default()
    }
}

#[test]
fn data_partition_copy_is_rounded_to_alignment() {
    init_logging();
    let payload: Vec<u8> = (1..=20).collect();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x4000, payload.clone()))
        .build();
    let src = built.partitions[0].src_byte_offset();
    let (mut loader, reads) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut staging = loader.staging_buffer();
    let mut mem = SimMemory::new();

    let state = loader
        .load_partition(&mut image, 0, &mut staging, &mut mem)
        .unwrap();
    assert_eq!(state, PartitionState::Validated);
    assert!(reads.borrow().contains(&(src, 32)));
    assert_eq!(mem.peek(0x4000, 20), payload);
}

#[test]
fn foreign_partitions_are_skipped_without_copying() {
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x1000, vec![0xAA; 64]).owner(Owner::NonPlm))
        .partition(PartitionSpec::data(0x2000, vec![0xBB; 64]))
        .build();
    let foreign = built.partitions[0].clone();
    let (mut loader, reads) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    let summary = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap();

    assert_eq!(summary.partitions, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.loaded, 1);
    assert_eq!(
        image.states(),
        &[PartitionState::Skipped, PartitionState::Validated]
    );
    assert!(!touched(
        &reads,
        foreign.src_byte_offset(),
        foreign.unenc_byte_len()
    ));
    assert_eq!(mem.peek(0x1000, 4), vec![0; 4]);
    assert_eq!(mem.peek(0x2000, 4), vec![0xBB; 4]);
}

#[test]
fn partitions_cannot_be_processed_twice() {
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x1000, vec![1; 16]))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut staging = loader.staging_buffer();
    let mut mem = SimMemory::new();
    loader
        .load_partition(&mut image, 0, &mut staging, &mut mem)
        .unwrap();

    let err = loader
        .load_partition(&mut image, 0, &mut staging, &mut mem)
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::HeaderCheck));
    assert!(matches!(
        err,
        LoaderError::Partition {
            index: 0,
            source: PartitionError::AlreadyProcessed(PartitionState::Validated),
            ..
        }
    ));
    assert!(matches!(
        loader.load_partition(&mut image, 3, &mut staging, &mut mem),
        Err(LoaderError::IndexOutOfRange { index: 3, count: 1 })
    ));
}

#[test]
fn first_entry_per_core_wins_and_cores_start_in_order() {
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x1000, vec![1; 16]).for_cpu(Cpu::A72_0, 0x1000))
        .partition(
            PartitionSpec::data(0x2000, vec![2; 16])
                .for_cpu(Cpu::R5_0, 0x2000)
                .exec_state(ExecState::Aarch32)
                .vector(VectorLocation::High),
        )
        .partition(PartitionSpec::data(0x3000, vec![3; 16]).for_cpu(Cpu::A72_0, 0x3000))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    let summary = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap();
    assert_eq!(summary.handoffs, 2);
    assert_eq!(image.state(2), Some(PartitionState::Validated));
    assert_eq!(mem.peek(0x3000, 4), vec![3; 4]);

    let mut pm = RecordingPm::default();
    assert_eq!(loader.start_cores(&mut image, &mut pm).unwrap(), 2);
    assert_eq!(pm.woken, vec![(Cpu::A72_0, 0x1000), (Cpu::R5_0, 0x2000)]);
    assert!(pm.exec_states.contains(&(Cpu::R5_0, ExecState::Aarch32)));
    assert!(pm.vectors.contains(&(Cpu::R5_0, VectorLocation::High)));
    assert!(image.handoff().is_empty());
}

#[test]
fn wake_failure_leaves_unstarted_cores_recorded() {
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x1000, vec![1; 16]).for_cpu(Cpu::R5_0, 0x1000))
        .partition(PartitionSpec::data(0x2000, vec![2; 16]).for_cpu(Cpu::A72_1, 0x2000))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut SimMemory::new())
        .unwrap();

    let mut pm = RecordingPm {
        refuse: Some(Cpu::A72_1),
        ..RecordingPm::default()
    };
    let err = loader.start_cores(&mut image, &mut pm).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Handoff(HandoffError::Wake {
            cpu: Cpu::A72_1,
            entry: 0x2000,
            ..
        })
    ));
    assert_eq!(pm.woken, vec![(Cpu::R5_0, 0x1000)]);
    assert_eq!(image.handoff().len(), 1);
}

#[test]
fn command_stream_partition_runs_through_interpreter() {
    let stream = CdoBuilder::new()
        .write(0x100, 0xAB)
        .mask_write(0x100, 0xF0, 0x30)
        .set(0x200, 4, 0x77)
        .finish();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::cdo(&stream))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    let summary = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap();

    assert_eq!(summary.commands, 3);
    assert_eq!(summary.handoffs, 0);
    assert_eq!(mem.peek32(0x100), 0x3B);
    assert_eq!(mem.peek32(0x20C), 0x77);
    assert_eq!(image.reports().len(), 1);
}

fn long_dma_image() -> (Vec<u8>, Vec<u32>) {
    let data: Vec<u32> = (0..100).map(|i| 0xD000_0000 | i).collect();
    let stream = CdoBuilder::new()
        .dma_write(0x9000, &data)
        .write(0x8000, 1)
        .finish();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::cdo(&stream))
        .build();
    (built.bytes, data)
}

#[test]
fn split_commands_resume_with_and_without_double_buffering() {
    for double_buffer in [false, true] {
        let (bytes, data) = long_dma_image();
        let (mut loader, _) = loader_with(bytes, small_chunks(double_buffer));
        let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
        let mut mem = SimMemory::new();
        let summary = loader
            .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
            .unwrap();

        assert_eq!(summary.commands, 2);
        assert!(image.reports()[0].1.resumes > 0);
        for (i, word) in data.iter().enumerate() {
            assert_eq!(mem.peek32(0x9000 + 4 * i as u64), *word);
        }
        assert_eq!(mem.peek32(0x8000), 1);
    }
}

#[test]
fn keyhole_reads_past_the_chunk_from_the_boot_source() {
    let data: Vec<u32> = (0..40).map(|i| 0xC0DE_0000 | i).collect();
    let stream = CdoBuilder::new()
        .keyhole_write(0x8000, 16, &data)
        .write(0x300, 0x5A)
        .finish();
    for double_buffer in [false, true] {
        let built = ImageBuilder::new()
            .partition(PartitionSpec::cdo(&stream))
            .build();
        let (mut loader, _) = loader_with(built.bytes, small_chunks(double_buffer));
        let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
        let mut mem = SimMemory::new();
        let summary = loader
            .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
            .unwrap();

        assert_eq!(summary.commands, 2, "double_buffer={double_buffer}");
        assert_eq!(image.reports()[0].1.resumes, 0);
        for k in 0..4 {
            assert_eq!(mem.peek32(0x8000 + 4 * k), data[36 + k as usize]);
        }
        assert_eq!(mem.peek32(0x300), 0x5A);
    }
}

#[test]
fn staging_buffer_smaller_than_dma_transfer_is_rejected() {
    let stream = CdoBuilder::new().write(0x100, 1).finish();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::cdo(&stream))
        .build();
    let config = LoaderConfig {
        chunk_size: 64,
        dma_alignment: 64,
        ..LoaderConfig::default()
    };
    let (mut loader, _) = loader_with(built.bytes, config);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();

    let err = loader
        .load_all(&mut image, &mut StagingBuffer::new(16), &mut mem)
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Copy));
    assert!(matches!(
        err,
        LoaderError::Partition {
            source: PartitionError::StagingBuffer {
                chunk_size: 16,
                alignment: 64
            },
            ..
        }
    ));
    assert_eq!(mem.peek32(0x100), 0);
}

#[test]
fn failing_command_aborts_remaining_partitions() {
    let stream = CdoBuilder::new().write(0x5000, 1).write(0x100, 2).finish();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::cdo(&stream))
        .partition(PartitionSpec::data(0x2000, vec![9; 16]))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    mem.unmap(0x5000..0x5004);

    let err = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Execute));
    assert_eq!(err.command_ids(), Some((1, 3)));
    assert_eq!(image.state(0), Some(PartitionState::Copying));
    assert_eq!(image.state(1), Some(PartitionState::HeaderChecked));
    assert_eq!(mem.peek32(0x100), 0);
    assert_eq!(mem.peek(0x2000, 4), vec![0; 4]);
}

#[test]
fn deferred_policy_completes_the_stream() {
    let stream = CdoBuilder::new().write(0x5000, 1).write(0x100, 2).finish();
    for escalate in [false, true] {
        let built = ImageBuilder::new()
            .partition(PartitionSpec::cdo(&stream))
            .build();
        let config = LoaderConfig {
            error_policy: ErrorPolicy::Defer,
            escalate_deferred_errors: escalate,
            ..LoaderConfig::default()
        };
        let (mut loader, _) = loader_with(built.bytes, config);
        let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
        let mut mem = SimMemory::new();
        mem.unmap(0x5000..0x5004);
        let result = loader.load_all(&mut image, &mut loader.staging_buffer(), &mut mem);

        assert_eq!(mem.peek32(0x100), 2);
        if escalate {
            assert!(matches!(
                result,
                Err(LoaderError::Partition {
                    stage: Stage::Execute,
                    source: PartitionError::Cdo(CdoError::DeferredFailures(1)),
                    ..
                })
            ));
        } else {
            let summary = result.unwrap();
            assert_eq!(summary.deferred, 1);
            assert_eq!(summary.commands, 2);
        }
    }
}

#[test]
fn secure_partitions_need_a_hook() {
    let plain: Vec<u8> = (0..32).collect();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x6000, xor(&plain)).encrypted(1))
        .build();
    let (mut loader, _) = loader(built.bytes);
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let err = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut SimMemory::new())
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Validate));
    assert!(matches!(
        err,
        LoaderError::Partition {
            source: PartitionError::NoSecurityHook,
            ..
        }
    ));
}

#[test]
fn secure_partitions_are_decrypted_before_use() {
    let plain: Vec<u8> = (0..32).collect();
    let stream = CdoBuilder::new().write(0x700, 0x1234).finish_bytes();
    let built = ImageBuilder::new()
        .partition(PartitionSpec::data(0x6000, xor(&plain)).encrypted(1))
        .partition(
            PartitionSpec {
                data: xor(&stream),
                ..PartitionSpec::cdo(&[])
            }
            .encrypted(1),
        )
        .build();
    let calls = Rc::new(Cell::new(0));
    let (loader, _) = loader(built.bytes);
    let mut loader = loader.with_security(Box::new(XorHook {
        calls: Rc::clone(&calls),
    }));
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    let summary = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap();

    assert_eq!(calls.get(), 2);
    assert_eq!(summary.commands, 1);
    assert_eq!(mem.peek(0x6000, 32), plain);
    assert_eq!(mem.read32(0x700).unwrap(), 0x1234);
}

#[test]
fn rejected_authentication_stops_before_copy() {
    let built = ImageBuilder::new()
        .partition(
            PartitionSpec::data(0x6000, vec![0xFF; 32])
                .encrypted(1)
                .id(0xBAD),
        )
        .build();
    let (loader, _) = loader(built.bytes);
    let mut loader = loader.with_security(Box::new(XorHook {
        calls: Rc::default(),
    }));
    let mut image = loader.load_image(BootSource::Ddr, 0).unwrap();
    let mut mem = SimMemory::new();
    let err = loader
        .load_all(&mut image, &mut loader.staging_buffer(), &mut mem)
        .unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Partition {
            stage: Stage::Validate,
            source: PartitionError::Security(SecurityError::Authentication(_)),
            ..
        }
    ));
    assert_eq!(mem.write_count(), 0);
}
