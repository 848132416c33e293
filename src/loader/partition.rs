// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Copy, decrypt or execute the content of one partition.
// Author: Lukas Bower

use log::{debug, info};
use pdi_format::{PartitionHeader, PartitionKind};

use super::{copy_len, ImageLoader, LoadedImage, StagingBuffer};
use crate::bus::MemoryBus;
use crate::cdo::{CdoReport, CdoStream, Interpreter, KeyholeSource, StreamOptions};
use crate::config::LoaderConfig;
use crate::device::{CopyCapability, CopyFlags, DeviceError, DeviceRegistry};
use crate::error::PartitionError;

const COPY_FLAGS: CopyFlags = CopyFlags::PMCDMA_0;

/// Boot source view handed to keyhole handlers while a chunk executes.
struct ChunkSource<'r> {
    registry: &'r mut DeviceRegistry,
    cap: CopyCapability,
    next_src: u64,
    end: u64,
    prefetched: bool,
}

impl KeyholeSource for ChunkSource<'_> {
    fn next_src(&self) -> u64 {
        self.next_src
    }

    fn next_chunk_copy_started(&self) -> bool {
        self.prefetched
    }

    fn read_ahead(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let src = self.next_src + offset;
        if src + buf.len() as u64 > self.end {
            return Err(DeviceError::OutOfRange {
                src,
                len: buf.len(),
                size: self.end,
            });
        }
        self.registry.read(self.cap, src, buf, COPY_FLAGS)
    }
}

/// Process the content of `header`. Returns stream statistics for command
/// stream partitions.
pub(super) fn process(
    loader: &mut ImageLoader,
    image: &LoadedImage,
    header: &PartitionHeader,
    staging: &mut StagingBuffer,
    bus: &mut dyn MemoryBus,
) -> Result<Option<CdoReport>, PartitionError> {
    let ImageLoader {
        registry,
        interp,
        config,
        security,
    } = loader;
    let src = image.address + header.src_byte_offset();
    info!("[loader] processing {header}");

    if header.is_secure() {
        let hook = security.as_mut().ok_or(PartitionError::NoSecurityHook)?;
        let mut data = vec![0u8; header.total_word_len as usize * 4];
        registry.read(image.cap, src, &mut data, COPY_FLAGS)?;
        let plain = hook.authenticate_and_decrypt(header, &data)?;
        debug!("[loader] {} plaintext bytes after authentication", plain.len());
        return match header.kind() {
            PartitionKind::CommandStream => {
                run_plain_stream(interp, config, &plain, staging.chunk_size(), bus).map(Some)
            }
            PartitionKind::Data => {
                bus.write_bytes(header.dest_load_addr, &plain)?;
                Ok(None)
            }
        };
    }

    match header.kind() {
        PartitionKind::CommandStream => {
            let end = src + header.unenc_byte_len();
            let report = run_stream(registry, image.cap, interp, config, src, end, staging, bus)?;
            info!(
                "[loader] stream done: {} commands, {} deferred failures",
                report.commands,
                report.deferred.len()
            );
            Ok(Some(report))
        }
        PartitionKind::Data => {
            let len = copy_len(header.unenc_byte_len() as usize, false, config.dma_alignment);
            registry.copy(image.cap, src, header.dest_load_addr, len, COPY_FLAGS, bus)?;
            Ok(None)
        }
    }
}

/// Copy the chunk starting at `src` into `half`. Returns the stream bytes in it.
fn fetch(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    staging: &mut StagingBuffer,
    half: usize,
    src: u64,
    end: u64,
    align: usize,
) -> Result<usize, DeviceError> {
    let remaining = end.saturating_sub(src) as usize;
    let len = remaining.min(staging.chunk_size());
    if len == 0 {
        return Ok(0);
    }
    let n = copy_len(len, len == remaining, align);
    registry.read(cap, src, &mut staging.half_mut(half)[..n], COPY_FLAGS)?;
    Ok(len)
}

#[allow(clippy::too_many_arguments)]
fn run_stream(
    registry: &mut DeviceRegistry,
    cap: CopyCapability,
    interp: &Interpreter,
    config: &LoaderConfig,
    mut src: u64,
    end: u64,
    staging: &mut StagingBuffer,
    bus: &mut dyn MemoryBus,
) -> Result<CdoReport, PartitionError> {
    let align = config.dma_alignment;
    let chunk_size = staging.chunk_size();
    if chunk_size < align || chunk_size % align != 0 {
        return Err(PartitionError::StagingBuffer {
            chunk_size,
            alignment: align,
        });
    }
    let mut stream = CdoStream::new(interp, StreamOptions::from(config));
    let mut half = 0;
    let mut len = fetch(registry, cap, staging, half, src, end, align)?;
    src += len as u64;

    while len > 0 {
        let mut next_len = 0;
        if config.double_buffer {
            next_len = fetch(registry, cap, staging, half ^ 1, src, end, align)?;
        }
        let prefetched = next_len > 0;
        let mut source = ChunkSource {
            registry: &mut *registry,
            cap,
            next_src: src,
            end,
            prefetched,
        };
        stream.process_chunk(staging.words(half, len), &mut *bus, Some(&mut source))?;

        let extra = u64::from(stream.settle_keyhole(prefetched)) * 4;
        if stream.is_complete() {
            break;
        }
        if prefetched {
            half ^= 1;
            len = next_len;
        } else {
            src += extra;
            len = fetch(registry, cap, staging, half, src, end, align)?;
        }
        src += len as u64;
    }
    Ok(stream.finish()?)
}

fn run_plain_stream(
    interp: &Interpreter,
    config: &LoaderConfig,
    plain: &[u8],
    chunk_size: usize,
    bus: &mut dyn MemoryBus,
) -> Result<CdoReport, PartitionError> {
    let words: Vec<u32> = plain
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let mut stream = CdoStream::new(interp, StreamOptions::from(config));
    for chunk in words.chunks(chunk_size / 4) {
        stream.process_chunk(chunk, &mut *bus, None)?;
        if stream.is_complete() {
            break;
        }
    }
    Ok(stream.finish()?)
}
