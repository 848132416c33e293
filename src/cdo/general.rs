// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Built-in general module: register access, DMA, keyhole and block control.
// Author: Lukas Bower

//! General module (id 1).
//!
//! Addresses in 32-bit commands are single words; 64-bit commands carry the
//! high word first.
//!
//! | api  | command       | payload                                      |
//! |------|---------------|----------------------------------------------|
//! | 0x00 | features      | api id                                       |
//! | 0x01 | mask poll     | addr, mask, expected, timeout us             |
//! | 0x02 | mask write    | addr, mask, value                            |
//! | 0x03 | write         | addr, value                                  |
//! | 0x04 | delay         | us                                           |
//! | 0x05 | dma write     | addr hi, addr lo, data...                    |
//! | 0x06 | mask poll 64  | addr hi, addr lo, mask, expected, timeout us |
//! | 0x07 | mask write 64 | addr hi, addr lo, mask, value                |
//! | 0x08 | write 64      | addr hi, addr lo, value                      |
//! | 0x0C | set           | addr hi, addr lo, count, value               |
//! | 0x0D | clear         | addr hi, addr lo, count                      |
//! | 0x11 | nop           | ignored                                      |
//! | 0x12 | keyhole write | addr hi, addr lo, window bytes, data...      |
//! | 0x13 | log string    | UTF-8 bytes, NUL padded                      |
//! | 0x1F | begin         | words to the end of the matching end         |
//! | 0x20 | end           | none                                         |
//! | 0x21 | break         | levels (default 1)                           |

use log::{debug, info};

use super::{Command, ExecContext, Handler, HandlerError, Module};

/// Module id of the general module.
pub const MODULE_ID: u8 = 1;

/// Api ids of the general module.
pub mod api {
    #![allow(missing_docs)]
    pub const FEATURES: u8 = 0x00;
    pub const MASK_POLL: u8 = 0x01;
    pub const MASK_WRITE: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const DELAY: u8 = 0x04;
    pub const DMA_WRITE: u8 = 0x05;
    pub const MASK_POLL64: u8 = 0x06;
    pub const MASK_WRITE64: u8 = 0x07;
    pub const WRITE64: u8 = 0x08;
    pub const SET: u8 = 0x0C;
    pub const CLEAR: u8 = 0x0D;
    pub const NOP: u8 = 0x11;
    pub const KEYHOLE_WRITE: u8 = 0x12;
    pub const LOG_STRING: u8 = 0x13;
    pub const BEGIN: u8 = 0x1F;
    pub const END: u8 = 0x20;
    pub const BREAK: u8 = 0x21;
}

const FILL_BURST_WORDS: usize = 64;
const KEYHOLE_BOUNCE_BYTES: usize = 0x400;

/// The general module with its handler table.
pub fn module() -> Module {
    Module::new(MODULE_ID, "general", handler_table())
}

fn handler_table() -> Vec<Option<Handler>> {
    let entries: [(u8, Handler); 17] = [
        (api::FEATURES, features),
        (api::MASK_POLL, mask_poll),
        (api::MASK_WRITE, mask_write),
        (api::WRITE, write),
        (api::DELAY, delay),
        (api::DMA_WRITE, dma_write),
        (api::MASK_POLL64, mask_poll64),
        (api::MASK_WRITE64, mask_write64),
        (api::WRITE64, write64),
        (api::SET, set),
        (api::CLEAR, clear),
        (api::NOP, nop),
        (api::KEYHOLE_WRITE, keyhole_write),
        (api::LOG_STRING, log_string),
        (api::BEGIN, begin),
        (api::END, end),
        (api::BREAK, break_blocks),
    ];
    let mut table = vec![None; usize::from(api::BREAK) + 1];
    for (api_id, handler) in entries {
        table[usize::from(api_id)] = Some(handler);
    }
    table
}

fn features(cmd: &mut Command<'_>, _ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let queried = cmd.arg(0)?;
    let supported = usize::try_from(queried)
        .ok()
        .and_then(|api_id| handler_table().get(api_id).copied().flatten())
        .is_some();
    cmd.response[0] = u32::from(supported);
    Ok(())
}

fn poll(
    ctx: &mut ExecContext<'_>,
    addr: u64,
    mask: u32,
    expected: u32,
    timeout_us: u32,
) -> Result<(), HandlerError> {
    let budget = if timeout_us == 0 {
        ctx.poll_retries
    } else {
        timeout_us
    };
    for _ in 0..=budget {
        if ctx.bus.read32(addr)? & mask == expected {
            return Ok(());
        }
        ctx.bus.delay_us(1);
    }
    Err(HandlerError::PollTimeout {
        addr,
        mask,
        expected,
    })
}

fn mask_poll(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let addr = u64::from(cmd.arg(0)?);
    let timeout = cmd.payload.get(3).copied().unwrap_or(0);
    poll(ctx, addr, cmd.arg(1)?, cmd.arg(2)?, timeout)
}

fn mask_poll64(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let addr = cmd.addr64(0)?;
    let timeout = cmd.payload.get(4).copied().unwrap_or(0);
    poll(ctx, addr, cmd.arg(2)?, cmd.arg(3)?, timeout)
}

fn masked_write(
    ctx: &mut ExecContext<'_>,
    addr: u64,
    mask: u32,
    value: u32,
) -> Result<(), HandlerError> {
    let current = ctx.bus.read32(addr)?;
    ctx.bus.write32(addr, (current & !mask) | (value & mask))?;
    Ok(())
}

fn mask_write(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    masked_write(ctx, u64::from(cmd.arg(0)?), cmd.arg(1)?, cmd.arg(2)?)
}

fn mask_write64(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    masked_write(ctx, cmd.addr64(0)?, cmd.arg(2)?, cmd.arg(3)?)
}

fn write(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    ctx.bus.write32(u64::from(cmd.arg(0)?), cmd.arg(1)?)?;
    Ok(())
}

fn write64(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    ctx.bus.write32(cmd.addr64(0)?, cmd.arg(2)?)?;
    Ok(())
}

fn delay(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    ctx.bus.delay_us(cmd.arg(0)?);
    Ok(())
}

fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn split_addr(addr: u64) -> [u32; 2] {
    [addr as u32, (addr >> 32) as u32]
}

fn join_addr(words: &[u32]) -> u64 {
    u64::from(words[0]) | (u64::from(words[1]) << 32)
}

/// End of the `len` byte range starting at `addr`.
fn range_end(addr: u64, len: u64) -> Result<u64, HandlerError> {
    addr.checked_add(len).ok_or(HandlerError::AddressOverflow { addr, len })
}

/// Resumable: the next destination address is kept in `resume_data[0..2]`.
fn dma_write(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let payload = cmd.payload;
    let (dest, data) = if cmd.processed_len == 0 {
        (cmd.addr64(0)?, &payload[2..])
    } else {
        (join_addr(&cmd.resume_data), payload)
    };
    let end = range_end(dest, 4 * data.len() as u64)?;
    ctx.bus.write_bytes(dest, &to_bytes(data))?;
    let next = split_addr(end);
    cmd.resume_data[..2].copy_from_slice(&next);
    Ok(())
}

fn fill(ctx: &mut ExecContext<'_>, addr: u64, count: u32, value: u32) -> Result<(), HandlerError> {
    range_end(addr, 4 * u64::from(count))?;
    let burst = to_bytes(&[value; FILL_BURST_WORDS]);
    let mut done = 0usize;
    let count = count as usize;
    while done < count {
        let n = (count - done).min(FILL_BURST_WORDS);
        ctx.bus.write_bytes(addr + 4 * done as u64, &burst[..4 * n])?;
        done += n;
    }
    Ok(())
}

fn set(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    fill(ctx, cmd.addr64(0)?, cmd.arg(2)?, cmd.arg(3)?)
}

fn clear(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    fill(ctx, cmd.addr64(0)?, cmd.arg(2)?, 0)
}

fn nop(_cmd: &mut Command<'_>, _ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    Ok(())
}

/// Write consecutive words into a window that wraps every `window` bytes.
///
/// `resume_data` holds the window base (`[0..2]`), its size (`[2]`) and the
/// byte position reached (`[3]`).
fn keyhole_words(
    state: &mut [u32; 4],
    ctx: &mut ExecContext<'_>,
    data: &[u32],
) -> Result<(), HandlerError> {
    let base = join_addr(&state[..2]);
    for word in data {
        ctx.bus.write32(range_end(base, u64::from(state[3]))?, *word)?;
        state[3] = (state[3] + 4) % state[2];
    }
    Ok(())
}

/// Keyhole transfer. When the payload runs past the chunk and a source is
/// attached, the rest is read straight from the boot source and reported in
/// `keyhole.extra_words`; otherwise the command resumes with the next chunk.
fn keyhole_write(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let payload = cmd.payload;
    let data = if cmd.processed_len == 0 {
        let base = cmd.addr64(0)?;
        let window = cmd.arg(2)?;
        if window < 4 || window % 4 != 0 {
            return Err(HandlerError::Argument {
                what: "keyhole window",
                value: window,
            });
        }
        range_end(base, u64::from(window))?;
        let [lo, hi] = split_addr(base);
        cmd.resume_data = [lo, hi, window, 0];
        &payload[3..]
    } else {
        payload
    };
    keyhole_words(&mut cmd.resume_data, ctx, data)?;

    let beyond = cmd.remaining() - payload.len() as u32;
    if beyond == 0 {
        return Ok(());
    }
    let Some(source) = ctx.source.take() else {
        return Ok(());
    };
    let src_addr = source.next_src();
    let started = source.next_chunk_copy_started();
    let total = beyond as usize * 4;
    let mut bounce = [0u8; KEYHOLE_BOUNCE_BYTES];
    let mut done = 0usize;
    let result = loop {
        if done == total {
            break Ok(());
        }
        let n = (total - done).min(KEYHOLE_BOUNCE_BYTES);
        if let Err(e) = source.read_ahead(done as u64, &mut bounce[..n]) {
            break Err(HandlerError::from(e));
        }
        let words: Vec<u32> = bounce[..n]
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if let Err(e) = keyhole_words(&mut cmd.resume_data, ctx, &words) {
            break Err(e);
        }
        done += n;
    };
    ctx.source = Some(source);
    result?;
    debug!("[cdo] keyhole read {beyond} words past the chunk at {src_addr:#x}");
    cmd.keyhole.src_addr = src_addr;
    cmd.keyhole.extra_words = beyond;
    cmd.keyhole.next_chunk_copy_started = started;
    Ok(())
}

fn log_string(cmd: &mut Command<'_>, _ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let bytes = to_bytes(cmd.payload);
    let text = String::from_utf8_lossy(&bytes);
    info!("[cdo] {}", text.trim_end_matches('\0'));
    Ok(())
}

fn begin(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let body = cmd.arg(0)?;
    let end = ctx
        .offset
        .checked_add(cmd.header.total_words())
        .and_then(|end| end.checked_add(body))
        .ok_or(HandlerError::Argument {
            what: "begin body",
            value: body,
        })?;
    if end > ctx.stream_end {
        return Err(HandlerError::BlockEnd {
            end,
            stream_end: ctx.stream_end,
        });
    }
    ctx.blocks.push(end)?;
    debug!("[cdo] begin block depth {} ends at {end:#x}", ctx.blocks.depth());
    Ok(())
}

fn end(_cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    ctx.blocks.pop()?;
    Ok(())
}

fn break_blocks(cmd: &mut Command<'_>, ctx: &mut ExecContext<'_>) -> Result<(), HandlerError> {
    let levels = cmd.payload.first().copied().unwrap_or(1).max(1);
    let target = ctx.blocks.break_out(levels as usize)?;
    let here = ctx.offset.saturating_add(cmd.header.total_words());
    if target < here {
        return Err(HandlerError::BreakTarget {
            target,
            offset: here,
        });
    }
    ctx.break_to = Some(target);
    Ok(())
}
