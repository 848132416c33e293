// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Command header decoding and the per-command execution record.
// Author: Lukas Bower

use super::{Handler, HandlerError, RESPONSE_WORDS};

const LEN_SHIFT: u32 = 16;
const MODULE_SHIFT: u32 = 8;
const LONG_LEN_MARKER: u32 = 0xFF;

/// Decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    /// Module id, bits `[15:8]`.
    pub module_id: u8,
    /// Api id, bits `[7:0]`.
    pub api_id: u8,
    /// Payload length in words.
    pub payload_len: u32,
    /// Header length in words, 1 or 2.
    pub header_words: u32,
}

impl CmdHeader {
    /// Header for a payload of `payload_len` words.
    pub fn new(module_id: u8, api_id: u8, payload_len: u32) -> Self {
        Self {
            module_id,
            api_id,
            payload_len,
            header_words: if payload_len >= LONG_LEN_MARKER { 2 } else { 1 },
        }
    }

    /// Header words implied by the first header word.
    pub fn header_words(first: u32) -> usize {
        if (first >> LEN_SHIFT) & 0xFF == LONG_LEN_MARKER {
            2
        } else {
            1
        }
    }

    /// Decode from the start of `words`; `None` if the header is incomplete.
    pub fn decode(words: &[u32]) -> Option<Self> {
        let first = *words.first()?;
        let short_len = (first >> LEN_SHIFT) & 0xFF;
        let (payload_len, header_words) = if short_len == LONG_LEN_MARKER {
            (*words.get(1)?, 2)
        } else {
            (short_len, 1)
        };
        Some(Self {
            module_id: (first >> MODULE_SHIFT) as u8,
            api_id: first as u8,
            payload_len,
            header_words,
        })
    }

    /// Append the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u32>) {
        let ids = (u32::from(self.module_id) << MODULE_SHIFT) | u32::from(self.api_id);
        if self.header_words == 2 {
            out.push((LONG_LEN_MARKER << LEN_SHIFT) | ids);
            out.push(self.payload_len);
        } else {
            out.push((self.payload_len << LEN_SHIFT) | ids);
        }
    }

    /// Header plus payload words.
    pub fn total_words(&self) -> u32 {
        self.header_words.saturating_add(self.payload_len)
    }

    /// Command id: module id in the high byte, api id in the low byte.
    pub fn cmd_id(&self) -> u16 {
        (u16::from(self.module_id) << 8) | u16::from(self.api_id)
    }
}

/// Keyhole continuation carried to the loader's next copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyholeState {
    /// Boot source offset the extra words were read from.
    pub src_addr: u64,
    /// Stream words the handler read straight from the boot source.
    pub extra_words: u32,
    /// Whether the next chunk had already been copied when the words were read.
    pub next_chunk_copy_started: bool,
}

/// One command in flight.
///
/// `payload` holds only the words available for this invocation; a command
/// split across chunks sees its payload in pieces while `processed_len`
/// advances towards the full length.
#[derive(Debug)]
pub struct Command<'a> {
    /// Decoded header.
    pub header: CmdHeader,
    /// Payload words available for this invocation.
    pub payload: &'a [u32],
    /// Payload words processed so far.
    pub processed_len: u32,
    /// Response words returned to a mailbox caller.
    pub response: [u32; RESPONSE_WORDS],
    /// Handler scratch preserved across resumes.
    pub resume_data: [u32; 4],
    /// Keyhole continuation state.
    pub keyhole: KeyholeState,
    /// Log and skip a failure instead of propagating it.
    pub deferred_error: bool,
    /// Error code of a failure that was deferred during the last invocation.
    pub deferred_status: Option<u32>,
    pub(crate) resume_handler: Option<Handler>,
    pub(crate) fed: u32,
}

impl<'a> Command<'a> {
    /// Fresh command with no progress.
    pub fn new(header: CmdHeader, payload: &'a [u32]) -> Self {
        Self {
            header,
            payload,
            processed_len: 0,
            response: [0; RESPONSE_WORDS],
            resume_data: [0; 4],
            keyhole: KeyholeState::default(),
            deferred_error: false,
            deferred_status: None,
            resume_handler: None,
            fed: 0,
        }
    }

    /// Full payload length from the header.
    pub fn full_len(&self) -> u32 {
        self.header.payload_len
    }

    /// Payload words still to process.
    pub fn remaining(&self) -> u32 {
        self.full_len().saturating_sub(self.processed_len)
    }

    /// Whether a handler has run and the command can be resumed.
    pub fn is_resumable(&self) -> bool {
        self.resume_handler.is_some()
    }

    /// Payload word `index` of this invocation.
    pub fn arg(&self, index: usize) -> Result<u32, HandlerError> {
        self.payload.get(index).copied().ok_or(HandlerError::Payload {
            need: index + 1,
            have: self.payload.len(),
        })
    }

    /// 64-bit address from the high word at `index` and the low word after it.
    pub fn addr64(&self, index: usize) -> Result<u64, HandlerError> {
        let hi = self.arg(index)?;
        let lo = self.arg(index + 1)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Freeze an unfinished command so it can be resumed with the next chunk.
    ///
    /// Returns `None` when no handler has run yet.
    pub fn into_continuation(self) -> Option<Continuation> {
        Some(Continuation {
            header: self.header,
            processed_len: self.processed_len,
            response: self.response,
            resume_data: self.resume_data,
            keyhole: self.keyhole,
            deferred_error: self.deferred_error,
            handler: self.resume_handler?,
            fed: self.fed,
        })
    }
}

/// A partially executed command detached from its chunk.
#[derive(Debug, Clone)]
pub struct Continuation {
    header: CmdHeader,
    processed_len: u32,
    response: [u32; RESPONSE_WORDS],
    resume_data: [u32; 4],
    keyhole: KeyholeState,
    deferred_error: bool,
    handler: Handler,
    pub(crate) fed: u32,
}

impl Continuation {
    /// Header of the suspended command.
    pub fn header(&self) -> CmdHeader {
        self.header
    }

    /// Payload words processed before suspension.
    pub fn processed_len(&self) -> u32 {
        self.processed_len
    }

    /// Stream words of the payload not yet delivered.
    pub fn pending_words(&self) -> u32 {
        self.header.payload_len.saturating_sub(self.fed)
    }

    /// Attach the next piece of payload, ready for [`Interpreter::resume`].
    ///
    /// [`Interpreter::resume`]: super::Interpreter::resume
    pub fn bind(self, payload: &[u32]) -> Command<'_> {
        Command {
            header: self.header,
            payload,
            processed_len: self.processed_len,
            response: self.response,
            resume_data: self.resume_data,
            keyhole: self.keyhole,
            deferred_error: self.deferred_error,
            deferred_status: None,
            resume_handler: Some(self.handler),
            fed: self.fed,
        }
    }
}
