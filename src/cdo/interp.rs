// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Dispatch commands to module handlers with resumable execution.
// Author: Lukas Bower

use heapless::Vec as BoundedVec;
use log::{debug, error};

use super::{
    general, module_error_code, CdoError, CmdHeader, Command, HandlerError, ModuleTable,
    MAX_BLOCK_DEPTH, RESPONSE_WORDS,
};
use crate::bus::MemoryBus;
use crate::device::DeviceError;

const DEFAULT_POLL_RETRIES: u32 = 1_000_000;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The full payload has been processed.
    Complete,
    /// More payload is expected; freeze the command and resume it later.
    Partial,
}

/// Stream data that follows the chunk currently being executed.
///
/// Keyhole handlers read the rest of a long payload straight from the boot
/// source instead of waiting for further chunks.
pub trait KeyholeSource {
    /// Boot source offset of the first stream byte after the current chunk.
    fn next_src(&self) -> u64;

    /// Whether the next chunk has already been copied into the staging buffer.
    fn next_chunk_copy_started(&self) -> bool;

    /// Read `buf.len()` bytes starting `offset` bytes after the current chunk.
    fn read_ahead(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
}

/// End offsets of open begin blocks, innermost last.
#[derive(Debug, Clone, Default)]
pub struct BlockStack {
    ends: BoundedVec<u32, MAX_BLOCK_DEPTH>,
}

impl BlockStack {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a block ending at stream word offset `end`.
    pub fn push(&mut self, end: u32) -> Result<(), HandlerError> {
        self.ends
            .push(end)
            .map_err(|_| HandlerError::BlockOverflow(MAX_BLOCK_DEPTH))
    }

    /// Close the innermost block.
    pub fn pop(&mut self) -> Result<u32, HandlerError> {
        self.ends.pop().ok_or(HandlerError::BlockUnderflow)
    }

    /// Close the innermost `levels` blocks, returning where the outermost of them ends.
    pub fn break_out(&mut self, levels: usize) -> Result<u32, HandlerError> {
        let depth = self.ends.len();
        if levels == 0 || levels > depth {
            return Err(HandlerError::BlockUnderflow);
        }
        let target = self.ends[depth - levels];
        self.ends.truncate(depth - levels);
        Ok(target)
    }

    /// Open block count.
    pub fn depth(&self) -> usize {
        self.ends.len()
    }
}

/// Everything a handler may touch besides its command.
pub struct ExecContext<'a> {
    /// Memory and registers.
    pub bus: &'a mut dyn MemoryBus,
    /// Begin/end bookkeeping of the owning stream.
    pub blocks: &'a mut BlockStack,
    /// Stream word offset of the command header.
    pub offset: u32,
    /// Stream word offset one past the last command word.
    pub stream_end: u32,
    /// Boot source access for keyhole transfers, if the stream has one.
    pub source: Option<&'a mut dyn KeyholeSource>,
    /// Set by a break handler: stream word offset to continue from.
    pub break_to: Option<u32>,
    /// Poll iterations allowed when a mask poll carries no timeout.
    pub poll_retries: u32,
}

impl<'a> ExecContext<'a> {
    /// Context without a keyhole source or stream bound, positioned at offset 0.
    pub fn new(bus: &'a mut dyn MemoryBus, blocks: &'a mut BlockStack) -> Self {
        Self {
            bus,
            blocks,
            offset: 0,
            stream_end: u32::MAX,
            source: None,
            break_to: None,
            poll_retries: DEFAULT_POLL_RETRIES,
        }
    }
}

/// Resolves commands to handlers and runs them.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    modules: ModuleTable,
}

impl Interpreter {
    /// Interpreter over `modules`.
    pub fn new(modules: ModuleTable) -> Self {
        Self { modules }
    }

    /// Interpreter with only the general module registered.
    pub fn with_general_module() -> Result<Self, CdoError> {
        let mut modules = ModuleTable::new();
        modules.register(general::module())?;
        Ok(Self::new(modules))
    }

    /// Registered modules.
    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// Mutable access for registering further modules.
    pub fn modules_mut(&mut self) -> &mut ModuleTable {
        &mut self.modules
    }

    /// Resolve and run the handler for a fresh command.
    ///
    /// No handler runs when the module, api id or handler slot is missing.
    pub fn execute(
        &self,
        cmd: &mut Command<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Progress, CdoError> {
        let CmdHeader {
            module_id, api_id, ..
        } = cmd.header;
        let module = self
            .modules
            .get(module_id)
            .ok_or(CdoError::ModuleNotRegistered { module_id, api_id })?;
        let handler = module.handler(api_id)?;
        debug!(
            "[cdo] {}:{api_id} len {} at {:#x}",
            module.name(),
            cmd.full_len(),
            ctx.offset
        );
        self.invoke(handler, cmd, ctx)
    }

    /// Continue a command that previously returned [`Progress::Partial`].
    ///
    /// # Panics
    ///
    /// Panics if the command was never executed.
    pub fn resume(
        &self,
        cmd: &mut Command<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Progress, CdoError> {
        let Some(handler) = cmd.resume_handler else {
            panic!(
                "resume of command {:#06x} that was never executed",
                cmd.header.cmd_id()
            );
        };
        self.invoke(handler, cmd, ctx)
    }

    fn invoke(
        &self,
        handler: super::Handler,
        cmd: &mut Command<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Progress, CdoError> {
        let CmdHeader {
            module_id, api_id, ..
        } = cmd.header;
        cmd.keyhole.extra_words = 0;
        cmd.deferred_status = None;
        match handler(cmd, ctx) {
            Ok(()) => {
                cmd.processed_len += cmd.payload.len() as u32 + cmd.keyhole.extra_words;
            }
            Err(source) => {
                let code = module_error_code(module_id, api_id);
                if !cmd.deferred_error {
                    return Err(CdoError::Handler {
                        module_id,
                        api_id,
                        code,
                        source,
                    });
                }
                error!(
                    "[cdo] deferred failure {code:#06x} at {:#x} ({module_id}:{api_id}): {source}",
                    ctx.offset
                );
                cmd.deferred_status = Some(code);
                cmd.processed_len = cmd.full_len();
            }
        }
        cmd.resume_handler = Some(handler);
        Ok(if cmd.processed_len >= cmd.full_len() {
            Progress::Complete
        } else {
            Progress::Partial
        })
    }

    /// Execute one complete command from a mailbox buffer and return its response.
    pub fn dispatch_buffer(
        &self,
        words: &[u32],
        bus: &mut dyn MemoryBus,
    ) -> Result<[u32; RESPONSE_WORDS], CdoError> {
        let truncated = CdoError::Truncated { offset: 0 };
        let header = CmdHeader::decode(words).ok_or(truncated.clone())?;
        let total = header.total_words() as usize;
        let start = header.header_words as usize;
        if words.len() < total {
            return Err(truncated);
        }
        let mut cmd = Command::new(header, &words[start..total]);
        let mut blocks = BlockStack::new();
        let mut ctx = ExecContext::new(bus, &mut blocks);
        match self.execute(&mut cmd, &mut ctx)? {
            Progress::Complete => Ok(cmd.response),
            Progress::Partial => Err(truncated),
        }
    }
}
