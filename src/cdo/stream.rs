// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Feed chunked command streams through the interpreter.
// Author: Lukas Bower

use heapless::Vec as BoundedVec;
use log::{debug, warn};

use super::{
    BlockStack, CdoError, CmdHeader, Command, Continuation, ErrorPolicy, ExecContext, Interpreter,
    KeyholeSource, Progress, CDO_HEADER_WORDS, CDO_IDENTIFICATION, TEMP_CMD_WORDS,
};
use crate::bus::MemoryBus;
use crate::config::LoaderConfig;

/// Per-stream execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Abort or defer on handler failure.
    pub policy: ErrorPolicy,
    /// Poll budget for mask polls without a timeout.
    pub poll_retries: u32,
    /// Fail the stream at its end if any failure was deferred.
    pub escalate_deferred: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&LoaderConfig::default())
    }
}

impl From<&LoaderConfig> for StreamOptions {
    fn from(cfg: &LoaderConfig) -> Self {
        Self {
            policy: cfg.error_policy,
            poll_retries: cfg.mask_poll_retries,
            escalate_deferred: cfg.escalate_deferred_errors,
        }
    }
}

/// A command failure that was logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredFailure {
    /// Stream word offset of the command.
    pub offset: u32,
    /// Module id.
    pub module_id: u8,
    /// Api id.
    pub api_id: u8,
    /// Module-scoped error code.
    pub code: u32,
}

/// Statistics of one executed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdoReport {
    /// Commands run to completion.
    pub commands: u32,
    /// Resume invocations of split commands.
    pub resumes: u32,
    /// Stream words consumed, header included.
    pub words: u32,
    /// Failures deferred under [`ErrorPolicy::Defer`].
    pub deferred: Vec<DeferredFailure>,
}

/// Incremental executor for one command stream.
///
/// Chunks are fed in order with [`CdoStream::process_chunk`]; the stream keeps
/// the begin/end stack, any suspended command and any partially received
/// short command between chunks.
pub struct CdoStream<'i> {
    interp: &'i Interpreter,
    opts: StreamOptions,
    header: BoundedVec<u32, CDO_HEADER_WORDS>,
    end: u32,
    offset: u32,
    blocks: BlockStack,
    pending: Option<(u32, Continuation)>,
    temp: BoundedVec<u32, TEMP_CMD_WORDS>,
    temp_offset: u32,
    skip: u32,
    keyhole_words: u32,
    report: CdoReport,
}

fn reborrow<'r>(
    source: &'r mut Option<&mut dyn KeyholeSource>,
) -> Option<&'r mut dyn KeyholeSource> {
    match source {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

impl<'i> CdoStream<'i> {
    /// Stream executing through `interp`.
    pub fn new(interp: &'i Interpreter, opts: StreamOptions) -> Self {
        Self {
            interp,
            opts,
            header: BoundedVec::new(),
            end: 0,
            offset: 0,
            blocks: BlockStack::new(),
            pending: None,
            temp: BoundedVec::new(),
            temp_offset: 0,
            skip: 0,
            keyhole_words: 0,
            report: CdoReport::default(),
        }
    }

    /// Stream word offset of the next word expected.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Statistics so far.
    pub fn report(&self) -> &CdoReport {
        &self.report
    }

    /// Open begin blocks.
    pub fn block_depth(&self) -> usize {
        self.blocks.depth()
    }

    /// Whether every command word has been consumed.
    pub fn is_complete(&self) -> bool {
        self.header.is_full()
            && self.offset >= self.end
            && self.pending.is_none()
            && self.temp.is_empty()
    }

    /// Account for words a keyhole handler read straight from the boot source.
    ///
    /// If the next chunk was already copied those words are still in it and
    /// are skipped when it arrives; otherwise the caller advances its source
    /// offset past them. Returns the word count.
    pub fn settle_keyhole(&mut self, prefetched: bool) -> u32 {
        let words = std::mem::take(&mut self.keyhole_words);
        if prefetched {
            self.skip += words;
        } else {
            self.offset += words;
        }
        words
    }

    /// Execute every complete command in `chunk`.
    pub fn process_chunk(
        &mut self,
        chunk: &[u32],
        bus: &mut dyn MemoryBus,
        mut source: Option<&mut dyn KeyholeSource>,
    ) -> Result<(), CdoError> {
        let mut words = chunk;
        while !words.is_empty() {
            let used = if self.skip > 0 {
                let n = (self.skip as usize).min(words.len());
                self.skip -= n as u32;
                n
            } else if !self.header.is_full() {
                self.take_header(words)?
            } else if self.offset >= self.end {
                words.len()
            } else {
                let limit = ((self.end - self.offset) as usize).min(words.len());
                let avail = &words[..limit];
                if let Some((at, cont)) = self.pending.take() {
                    self.resume(at, cont, avail, &mut *bus, &mut source)?
                } else if !self.temp.is_empty() {
                    self.fill_temp(avail, &mut *bus)?
                } else {
                    self.start(avail, &mut *bus, &mut source)?
                }
            };
            words = &words[used..];
            self.offset += used as u32;
        }
        Ok(())
    }

    /// Check that the stream ended cleanly and return its statistics.
    pub fn finish(mut self) -> Result<CdoReport, CdoError> {
        if !self.header.is_full() {
            return Err(CdoError::StreamHeader("stream shorter than its header"));
        }
        if let Some((at, _)) = self.pending {
            return Err(CdoError::Truncated { offset: at });
        }
        if !self.temp.is_empty() {
            return Err(CdoError::Truncated {
                offset: self.temp_offset,
            });
        }
        if self.offset < self.end {
            return Err(CdoError::Truncated {
                offset: self.offset,
            });
        }
        if self.blocks.depth() > 0 {
            warn!("[cdo] stream ended with {} open blocks", self.blocks.depth());
        }
        self.report.words = self.end;
        if self.opts.escalate_deferred && !self.report.deferred.is_empty() {
            return Err(CdoError::DeferredFailures(self.report.deferred.len()));
        }
        Ok(self.report)
    }

    fn take_header(&mut self, words: &[u32]) -> Result<usize, CdoError> {
        let n = (CDO_HEADER_WORDS - self.header.len()).min(words.len());
        for word in &words[..n] {
            let _ = self.header.push(*word);
        }
        if !self.header.is_full() {
            return Ok(n);
        }
        let h = &self.header;
        if h[0] as usize != CDO_HEADER_WORDS - 1 {
            return Err(CdoError::StreamHeader("header length"));
        }
        if h[1] != CDO_IDENTIFICATION {
            return Err(CdoError::StreamHeader("identification word"));
        }
        if pdi_format::checksum(&h[..4]) != h[4] {
            return Err(CdoError::StreamHeader("checksum"));
        }
        self.end = (CDO_HEADER_WORDS as u32)
            .checked_add(h[3])
            .ok_or(CdoError::StreamHeader("length"))?;
        debug!("[cdo] stream version {:#x}, {} command words", h[2], h[3]);
        Ok(n)
    }

    fn start(
        &mut self,
        avail: &[u32],
        bus: &mut dyn MemoryBus,
        source: &mut Option<&mut dyn KeyholeSource>,
    ) -> Result<usize, CdoError> {
        let at = self.offset;
        let Some(header) = CmdHeader::decode(avail) else {
            return self.buffer(avail);
        };
        let hw = header.header_words as usize;
        let total = header.total_words() as usize;
        if at as usize + total > self.end as usize {
            return Err(CdoError::Truncated { offset: at });
        }
        if avail.len() >= total {
            self.run(header, &avail[hw..total], at, bus, source)?;
            return Ok(total);
        }
        // Handlers see at least the first TEMP_CMD_WORDS words of a split command.
        if avail.len() < TEMP_CMD_WORDS {
            return self.buffer(avail);
        }
        self.run(header, &avail[hw..], at, bus, source)?;
        Ok(avail.len())
    }

    fn buffer(&mut self, avail: &[u32]) -> Result<usize, CdoError> {
        self.temp_offset = self.offset;
        self.temp
            .extend_from_slice(avail)
            .map_err(|_| CdoError::Truncated {
                offset: self.offset,
            })?;
        Ok(avail.len())
    }

    fn fill_temp(&mut self, avail: &[u32], bus: &mut dyn MemoryBus) -> Result<usize, CdoError> {
        let at = self.temp_offset;
        let hw = CmdHeader::header_words(self.temp[0]);
        let mut used = 0;
        if self.temp.len() < hw {
            used = (hw - self.temp.len()).min(avail.len());
            let _ = self.temp.extend_from_slice(&avail[..used]);
        }
        let Some(header) = CmdHeader::decode(&self.temp) else {
            return Ok(used);
        };
        let total = header.total_words() as usize;
        if at as usize + total > self.end as usize {
            return Err(CdoError::Truncated { offset: at });
        }
        let goal = total.min(TEMP_CMD_WORDS);
        let n = (goal - self.temp.len()).min(avail.len() - used);
        let _ = self.temp.extend_from_slice(&avail[used..used + n]);
        used += n;
        if self.temp.len() == goal {
            let whole = std::mem::take(&mut self.temp);
            // The rest of the command follows in this chunk, not past it.
            self.run(header, &whole[hw..], at, bus, &mut None)?;
        }
        Ok(used)
    }

    fn run(
        &mut self,
        header: CmdHeader,
        payload: &[u32],
        at: u32,
        bus: &mut dyn MemoryBus,
        source: &mut Option<&mut dyn KeyholeSource>,
    ) -> Result<(), CdoError> {
        let interp = self.interp;
        let mut cmd = Command::new(header, payload);
        cmd.deferred_error = self.opts.policy == ErrorPolicy::Defer;
        let mut ctx = self.context(bus, at, source);
        let progress = interp.execute(&mut cmd, &mut ctx)?;
        let break_to = ctx.break_to;
        cmd.fed = payload.len() as u32;
        self.settle(at, cmd, progress, break_to);
        Ok(())
    }

    fn resume(
        &mut self,
        at: u32,
        cont: Continuation,
        avail: &[u32],
        bus: &mut dyn MemoryBus,
        source: &mut Option<&mut dyn KeyholeSource>,
    ) -> Result<usize, CdoError> {
        let n = (cont.pending_words() as usize).min(avail.len());
        let interp = self.interp;
        let mut cmd = cont.bind(&avail[..n]);
        let mut ctx = self.context(bus, at, source);
        let progress = interp.resume(&mut cmd, &mut ctx)?;
        let break_to = ctx.break_to;
        cmd.fed += n as u32;
        self.report.resumes += 1;
        self.settle(at, cmd, progress, break_to);
        Ok(n)
    }

    fn context<'c>(
        &'c mut self,
        bus: &'c mut dyn MemoryBus,
        at: u32,
        source: &'c mut Option<&mut dyn KeyholeSource>,
    ) -> ExecContext<'c> {
        ExecContext {
            bus,
            blocks: &mut self.blocks,
            offset: at,
            stream_end: self.end,
            source: reborrow(source),
            break_to: None,
            poll_retries: self.opts.poll_retries,
        }
    }

    fn settle(&mut self, at: u32, mut cmd: Command<'_>, progress: Progress, break_to: Option<u32>) {
        let extra = std::mem::take(&mut cmd.keyhole.extra_words);
        self.keyhole_words += extra;
        if let Some(code) = cmd.deferred_status.take() {
            self.report.deferred.push(DeferredFailure {
                offset: at,
                module_id: cmd.header.module_id,
                api_id: cmd.header.api_id,
                code,
            });
        }
        match progress {
            Progress::Partial => {
                self.pending = cmd.into_continuation().map(|cont| (at, cont));
            }
            Progress::Complete => {
                self.report.commands += 1;
                // Stream words of a command abandoned by a deferred failure.
                self.skip += cmd.full_len().saturating_sub(cmd.fed + extra);
                if let Some(target) = break_to {
                    let cmd_end = at + cmd.header.total_words();
                    debug!("[cdo] break from {at:#x} to {target:#x}");
                    self.skip += target.saturating_sub(cmd_end);
                }
            }
        }
    }
}
