// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Chunked command stream execution through the interpreter.
// Author: Lukas Bower

mod common;

use common::init_logging;
use plm_loader::cdo::{
    general, BlockStack, CdoReport, CmdHeader, DeferredFailure, Handler, HandlerError,
    StreamOptions,
};
use plm_loader::{
    CdoBuilder, CdoError, CdoStream, Command, ErrorPolicy, ExecContext, Interpreter, MemoryBus,
    Module, Progress, SimMemory,
};

fn interp() -> Interpreter {
    Interpreter::with_general_module().unwrap()
}

fn run_split(
    interp: &Interpreter,
    words: &[u32],
    chunk: usize,
    opts: StreamOptions,
    mem: &mut SimMemory,
) -> Result<CdoReport, CdoError> {
    let mut stream = CdoStream::new(interp, opts);
    for piece in words.chunks(chunk) {
        stream.process_chunk(piece, mem, None)?;
    }
    stream.finish()
}

fn sample_stream() -> Vec<u32> {
    let data: Vec<u32> = (0..12).map(|i| 0xA500_0000 | i).collect();
    CdoBuilder::new()
        .write(0x10, 1)
        .dma_write(0x1000, &data)
        .mask_write(0x10, 0xF0, 0x50)
        .nop(300)
        .write64(0x1_0000_0040, 7)
        .set(0x2000, 3, 0x99)
        .log("stream done")
        .finish()
}

#[test]
fn every_split_point_gives_the_same_result() {
    init_logging();
    let interp = interp();
    let words = sample_stream();
    let mut reference = SimMemory::new();
    let whole = run_split(
        &interp,
        &words,
        words.len(),
        StreamOptions::default(),
        &mut reference,
    )
    .unwrap();
    assert_eq!(whole.commands, 7);
    assert_eq!(whole.words, words.len() as u32);

    for split in 1..words.len() {
        let mut mem = SimMemory::new();
        let mut stream = CdoStream::new(&interp, StreamOptions::default());
        stream.process_chunk(&words[..split], &mut mem, None).unwrap();
        stream.process_chunk(&words[split..], &mut mem, None).unwrap();
        assert!(stream.is_complete(), "split at {split}");
        let report = stream.finish().unwrap();
        assert_eq!(report.commands, whole.commands, "split at {split}");
        for addr in [0x10, 0x1000, 0x102C, 0x1_0000_0040, 0x2008] {
            assert_eq!(mem.peek32(addr), reference.peek32(addr), "split at {split}");
        }
    }
    assert_eq!(reference.peek32(0x10), 0x51);
    assert_eq!(reference.peek32(0x102C), 0xA500_000B);
}

#[test]
fn long_command_resumes_across_small_chunks() {
    let interp = interp();
    let data: Vec<u32> = (0..64).collect();
    let words = CdoBuilder::new().dma_write(0x4000, &data).finish();
    let mut mem = SimMemory::new();
    let report = run_split(&interp, &words, 8, StreamOptions::default(), &mut mem).unwrap();
    assert_eq!(report.commands, 1);
    assert!(report.resumes >= 7);
    assert_eq!(mem.peek32(0x4000 + 4 * 63), 63);
}

#[test]
fn two_chunk_command_completes_after_resume() {
    let interp = interp();
    let words = [0, 0x3000, 11, 12, 13, 14, 15, 16];
    let header = CmdHeader::new(general::MODULE_ID, general::api::DMA_WRITE, 8);
    let mut mem = SimMemory::new();
    let mut blocks = BlockStack::new();

    let mut cmd = Command::new(header, &words[..5]);
    let mut ctx = ExecContext::new(&mut mem, &mut blocks);
    assert_eq!(interp.execute(&mut cmd, &mut ctx).unwrap(), Progress::Partial);
    assert_eq!(cmd.processed_len, 5);
    assert!(cmd.is_resumable());

    let cont = cmd.into_continuation().unwrap();
    assert_eq!(cont.pending_words(), 3);
    let mut cmd = cont.bind(&words[5..]);
    assert_eq!(interp.resume(&mut cmd, &mut ctx).unwrap(), Progress::Complete);
    assert_eq!(cmd.processed_len, cmd.full_len());
    for (i, word) in words[2..].iter().enumerate() {
        assert_eq!(mem.peek32(0x3000 + 4 * i as u64), *word);
    }
}

#[test]
#[should_panic(expected = "never executed")]
fn resume_before_execute_panics() {
    let interp = interp();
    let payload = [0, 0x100, 1];
    let mut cmd = Command::new(
        CmdHeader::new(general::MODULE_ID, general::api::DMA_WRITE, 8),
        &payload,
    );
    let mut mem = SimMemory::new();
    let mut blocks = BlockStack::new();
    let mut ctx = ExecContext::new(&mut mem, &mut blocks);
    let _ = interp.resume(&mut cmd, &mut ctx);
}

#[test]
fn unregistered_module_runs_no_handler() {
    let interp = interp();
    let words = CdoBuilder::new().command(9, 0, &[]).write(0x10, 1).finish();
    let mut mem = SimMemory::new();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert_eq!(
        err,
        CdoError::ModuleNotRegistered {
            module_id: 9,
            api_id: 0
        }
    );
    assert!(err.to_string().contains("module not registered"));
    assert_eq!(mem.write_count(), 0);
}

#[test]
fn api_ids_outside_the_handler_table() {
    let interp = interp();
    let mut mem = SimMemory::new();
    let words = CdoBuilder::new().command(1, 0x40, &[]).finish();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert_eq!(
        err,
        CdoError::InvalidApiId {
            module_id: 1,
            api_id: 0x40
        }
    );

    let words = CdoBuilder::new().command(1, 0x0E, &[]).finish();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert!(err.to_string().starts_with("handler null"));
}

fn defer() -> StreamOptions {
    StreamOptions {
        policy: ErrorPolicy::Defer,
        ..StreamOptions::default()
    }
}

#[test]
fn deferred_failure_is_recorded_once() {
    let interp = interp();
    let words = CdoBuilder::new()
        .write(0x5000, 1)
        .write(0x100, 2)
        .finish();
    let mut mem = SimMemory::new();
    mem.unmap(0x5000..0x5004);
    let report = run_split(&interp, &words, 64, defer(), &mut mem).unwrap();
    assert_eq!(
        report.deferred,
        vec![DeferredFailure {
            offset: 5,
            module_id: 1,
            api_id: 3,
            code: 0x2103,
        }]
    );
    assert_eq!(report.commands, 2);
    assert_eq!(mem.peek32(0x100), 2);

    let escalate = StreamOptions {
        escalate_deferred: true,
        ..defer()
    };
    let err = run_split(&interp, &words, 64, escalate, &mut mem).unwrap_err();
    assert_eq!(err, CdoError::DeferredFailures(1));
}

#[test]
fn deferred_failure_skips_the_rest_of_a_split_command() {
    let interp = interp();
    let data = vec![0xFFFF_FFFF; 40];
    let words = CdoBuilder::new()
        .dma_write(0x5000, &data)
        .write(0x100, 3)
        .finish();
    let mut mem = SimMemory::new();
    mem.unmap(0x5000..0x6000);
    let report = run_split(&interp, &words, 16, defer(), &mut mem).unwrap();
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.resumes, 0);
    assert_eq!(mem.peek32(0x100), 3);
}

#[test]
fn break_skips_to_the_end_of_the_block() {
    let interp = interp();
    let words = CdoBuilder::new()
        .begin()
        .write(0x10, 1)
        .begin()
        .write(0x14, 2)
        .break_blocks(2)
        .write(0x18, 3)
        .end()
        .write(0x1C, 4)
        .end()
        .write(0x20, 5)
        .finish();
    for chunk in [4, 7, words.len()] {
        let mut mem = SimMemory::new();
        let mut stream = CdoStream::new(&interp, StreamOptions::default());
        for piece in words.chunks(chunk) {
            stream.process_chunk(piece, &mut mem, None).unwrap();
        }
        assert_eq!(stream.block_depth(), 0);
        stream.finish().unwrap();
        assert_eq!(mem.peek32(0x10), 1);
        assert_eq!(mem.peek32(0x14), 2);
        assert_eq!(mem.peek32(0x18), 0, "chunk {chunk}");
        assert_eq!(mem.peek32(0x1C), 0, "chunk {chunk}");
        assert_eq!(mem.peek32(0x20), 5);
    }
}

#[test]
fn unbalanced_blocks_fail() {
    let interp = interp();
    let mut mem = SimMemory::new();
    let words = CdoBuilder::new().end().finish();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert!(matches!(
        err,
        CdoError::Handler {
            source: HandlerError::BlockUnderflow,
            ..
        }
    ));

    let mut deep = CdoBuilder::new();
    for _ in 0..11 {
        deep = deep.begin();
    }
    let err = run_split(&interp, &deep.finish(), 64, StreamOptions::default(), &mut mem)
        .unwrap_err();
    assert!(matches!(
        err,
        CdoError::Handler {
            source: HandlerError::BlockOverflow(10),
            ..
        }
    ));
}

#[test]
fn begin_body_overflowing_the_offset_fails_the_command() {
    let interp = interp();
    let words = CdoBuilder::new()
        .command(general::MODULE_ID, general::api::BEGIN, &[u32::MAX])
        .write(0x10, 1)
        .finish();
    let mut mem = SimMemory::new();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert!(matches!(
        err,
        CdoError::Handler {
            source: HandlerError::Argument {
                what: "begin body",
                value: u32::MAX
            },
            code: 0x211F,
            ..
        }
    ));
    assert_eq!(mem.peek32(0x10), 0);

    let report = run_split(&interp, &words, 64, defer(), &mut mem).unwrap();
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.deferred[0].offset, 5);
    assert_eq!(mem.peek32(0x10), 1);
}

#[test]
fn block_ending_past_the_stream_is_rejected() {
    let interp = interp();
    let words = CdoBuilder::new()
        .command(general::MODULE_ID, general::api::BEGIN, &[1000])
        .break_blocks(1)
        .write(0x10, 1)
        .finish();
    let mut mem = SimMemory::new();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert!(matches!(
        err,
        CdoError::Handler {
            source: HandlerError::BlockEnd {
                end: 1007,
                stream_end: 12
            },
            ..
        }
    ));
    assert_eq!(mem.peek32(0x10), 0);

    // A block closed by the last command ends exactly at the stream end.
    let words = CdoBuilder::new().begin().write(0x14, 2).end().finish();
    let report = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap();
    assert_eq!(report.commands, 3);
    assert_eq!(mem.peek32(0x14), 2);
}

#[test]
fn destination_ranges_past_the_address_space_fail() {
    let interp = interp();
    let top = u64::MAX - 3;
    let cases = [
        (CdoBuilder::new().dma_write(top, &[1, 2]), 8),
        (CdoBuilder::new().set(top, 4, 0xFF), 16),
        (CdoBuilder::new().keyhole_write(top, 16, &[1]), 16),
    ];
    for (builder, len) in cases {
        let mut mem = SimMemory::new();
        let err = run_split(&interp, &builder.finish(), 64, StreamOptions::default(), &mut mem)
            .unwrap_err();
        assert!(
            matches!(
                err,
                CdoError::Handler {
                    source: HandlerError::AddressOverflow { addr, len: l },
                    ..
                } if addr == top && l == len
            ),
            "{err:?}"
        );
        assert_eq!(mem.write_count(), 0);
    }
}

#[test]
fn keyhole_without_source_resumes_with_next_chunk() {
    let interp = interp();
    let data: Vec<u32> = (0..40).collect();
    let words = CdoBuilder::new()
        .keyhole_write(0x8000, 16, &data)
        .write(0x300, 1)
        .finish();
    let mut mem = SimMemory::new();
    let report = run_split(&interp, &words, 16, StreamOptions::default(), &mut mem).unwrap();
    assert!(report.resumes > 0);
    for k in 0..4u32 {
        assert_eq!(mem.peek32(0x8000 + 4 * u64::from(k)), 36 + k);
    }
    assert_eq!(mem.peek32(0x8010), 0);
    assert_eq!(mem.peek32(0x300), 1);
}

#[test]
fn stream_header_is_validated() {
    let interp = interp();
    let mut words = CdoBuilder::new().nop(0).finish();
    words[1] = 0x1234_5678;
    let mut mem = SimMemory::new();
    let err = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap_err();
    assert_eq!(err, CdoError::StreamHeader("identification word"));
}

#[test]
fn truncated_stream_is_reported_at_finish() {
    let interp = interp();
    let words = CdoBuilder::new().write(0x10, 1).dma_write(0x20, &[1, 2, 3, 4]).finish();
    let mut mem = SimMemory::new();
    let mut stream = CdoStream::new(&interp, StreamOptions::default());
    stream
        .process_chunk(&words[..words.len() - 2], &mut mem, None)
        .unwrap();
    assert!(!stream.is_complete());
    assert_eq!(stream.finish().unwrap_err(), CdoError::Truncated { offset: 8 });
}

#[test]
fn padding_after_the_stream_is_ignored() {
    let interp = interp();
    let mut words = CdoBuilder::new().write(0x10, 1).finish();
    words.extend_from_slice(&[0xDEAD_BEEF; 6]);
    let mut mem = SimMemory::new();
    let report = run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap();
    assert_eq!(report.commands, 1);
    assert_eq!(mem.write_count(), 1);
}

fn stamp(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    ctx.bus.write32(u64::from(cmd.arg(0)?), 0x5EA1)?;
    Ok(())
}

#[test]
fn registered_modules_receive_their_commands() {
    let mut interp = interp();
    interp
        .modules_mut()
        .register(Module::new(20, "stamp", vec![None, Some(stamp as Handler)]))
        .unwrap();
    let words = CdoBuilder::new().command(20, 1, &[0x40]).finish();
    let mut mem = SimMemory::new();
    run_split(&interp, &words, 64, StreamOptions::default(), &mut mem).unwrap();
    assert_eq!(mem.read32(0x40).unwrap(), 0x5EA1);
}
