// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode and execute configuration data object (CDO) command streams.
// Author: Lukas Bower

//! Command interpreter.
//!
//! A command stream starts with a five word header followed by commands. Each
//! command header word packs the payload length in bits `[23:16]`, the module
//! id in `[15:8]` and the api id in `[7:0]`; a length of 255 moves the length
//! into the next word. Commands are dispatched to [`Module`] handler tables
//! registered in a [`ModuleTable`].
//!
//! Streams arrive in chunks. A short command split by a chunk boundary is
//! buffered until complete; a longer command runs on the words available and
//! is frozen into a [`Continuation`] that is resumed on the next chunk.

mod builder;
mod command;
pub mod general;
mod interp;
mod module;
mod stream;

use serde::Deserialize;
use thiserror::Error;

use crate::bus::BusError;
use crate::device::DeviceError;

pub use builder::CdoBuilder;
pub use command::{CmdHeader, Command, Continuation, KeyholeState};
pub use interp::{BlockStack, ExecContext, Interpreter, KeyholeSource, Progress};
pub use module::{Handler, Module, ModuleTable};
pub use stream::{CdoReport, CdoStream, DeferredFailure, StreamOptions};

/// Words in the stream header.
pub const CDO_HEADER_WORDS: usize = 5;
/// Stream header identification word ("XLNX").
pub const CDO_IDENTIFICATION: u32 = 0x584C_4E58;
/// Stream format version written by [`CdoBuilder`].
pub const CDO_VERSION: u32 = 0x0000_0200;
/// Longest command, header included, buffered whole across a chunk boundary.
pub const TEMP_CMD_WORDS: usize = 8;
/// Number of module slots.
pub const MAX_MODULES: usize = 32;
/// First module id reported with the extended error base.
pub const EXTENDED_MODULE_BASE: u8 = 16;
/// Words in a command response.
pub const RESPONSE_WORDS: usize = 8;
/// Maximum begin/end nesting.
pub const MAX_BLOCK_DEPTH: usize = 10;

const ERR_MODULE_BASE: u32 = 0x2000;
const ERR_EXTENDED_MODULE_BASE: u32 = 0x3000;

/// How a failing command affects the rest of its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Propagate the failure and stop the stream.
    #[default]
    Abort,
    /// Log the failure and continue with the next command.
    Defer,
}

/// Errors raised by command handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Register or memory access failed.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Reading keyhole data from the boot source failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A mask poll did not match in time.
    #[error("mask poll at {addr:#x} timed out (mask {mask:#x}, expected {expected:#x})")]
    PollTimeout {
        /// Polled address.
        addr: u64,
        /// Poll mask.
        mask: u32,
        /// Expected masked value.
        expected: u32,
    },
    /// The payload is shorter than the command requires.
    #[error("payload too short: need {need} words, have {have}")]
    Payload {
        /// Words required.
        need: usize,
        /// Words present.
        have: usize,
    },
    /// Begin blocks nested deeper than [`MAX_BLOCK_DEPTH`].
    #[error("begin/end nesting exceeds {0} levels")]
    BlockOverflow(usize),
    /// End or break without an open begin block.
    #[error("no open begin block")]
    BlockUnderflow,
    /// A break would jump backwards in the stream.
    #[error("break target {target:#x} precedes offset {offset:#x}")]
    BreakTarget {
        /// Word offset the break jumps to.
        target: u32,
        /// Current word offset.
        offset: u32,
    },
    /// A begin block would end past the last command of the stream.
    #[error("block end {end:#x} beyond stream end {stream_end:#x}")]
    BlockEnd {
        /// Word offset the block ends at.
        end: u32,
        /// Word offset one past the last command word.
        stream_end: u32,
    },
    /// A destination range runs past the top of the address space.
    #[error("{len:#x} bytes at {addr:#x} overflow the address space")]
    AddressOverflow {
        /// First destination byte.
        addr: u64,
        /// Range length in bytes.
        len: u64,
    },
    /// A payload argument is out of range.
    #[error("invalid {what} {value:#x}")]
    Argument {
        /// Argument name.
        what: &'static str,
        /// Raw value.
        value: u32,
    },
    /// The handler rejected the command with a module status.
    #[error("status {0:#x}")]
    Status(u32),
}

/// Errors raised while decoding or dispatching a command stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdoError {
    /// No module is registered under the command's module id.
    #[error("module not registered: module {module_id} api {api_id}")]
    ModuleNotRegistered {
        /// Module id from the command header.
        module_id: u8,
        /// Api id from the command header.
        api_id: u8,
    },
    /// The api id is beyond the module's handler table.
    #[error("invalid API id {api_id} for module {module_id}")]
    InvalidApiId {
        /// Module id from the command header.
        module_id: u8,
        /// Api id from the command header.
        api_id: u8,
    },
    /// The handler slot for the api id is empty.
    #[error("handler null: module {module_id} api {api_id}")]
    HandlerNull {
        /// Module id from the command header.
        module_id: u8,
        /// Api id from the command header.
        api_id: u8,
    },
    /// The handler failed.
    #[error("command {module_id}:{api_id} failed with {code:#06x}: {source}")]
    Handler {
        /// Module id from the command header.
        module_id: u8,
        /// Api id from the command header.
        api_id: u8,
        /// Module-scoped error code.
        code: u32,
        /// Handler failure.
        source: HandlerError,
    },
    /// A module id is out of range or already taken.
    #[error("cannot register module {0}")]
    Registration(u8),
    /// The stream header failed validation.
    #[error("invalid stream header: {0}")]
    StreamHeader(&'static str),
    /// The stream or buffer ended inside a command.
    #[error("stream ended inside a command at word {offset:#x}")]
    Truncated {
        /// Word offset of the unfinished command.
        offset: u32,
    },
    /// Failures were deferred and escalation is enabled.
    #[error("{0} deferred command failures")]
    DeferredFailures(usize),
}

impl CdoError {
    /// Module id of the failing command, when known.
    pub fn module_id(&self) -> Option<u8> {
        match self {
            CdoError::ModuleNotRegistered { module_id, .. }
            | CdoError::InvalidApiId { module_id, .. }
            | CdoError::HandlerNull { module_id, .. }
            | CdoError::Handler { module_id, .. } => Some(*module_id),
            _ => None,
        }
    }

    /// Api id of the failing command, when known.
    pub fn api_id(&self) -> Option<u8> {
        match self {
            CdoError::ModuleNotRegistered { api_id, .. }
            | CdoError::InvalidApiId { api_id, .. }
            | CdoError::HandlerNull { api_id, .. }
            | CdoError::Handler { api_id, .. } => Some(*api_id),
            _ => None,
        }
    }
}

/// Compose the module-scoped error code reported for a failing command.
///
/// Modules below [`EXTENDED_MODULE_BASE`] report `0x2000` plus the low twelve
/// bits of the command id; extended modules report `0x3000` plus the command
/// id rebased to the first extended module.
pub fn module_error_code(module_id: u8, api_id: u8) -> u32 {
    if module_id < EXTENDED_MODULE_BASE {
        let cmd_id = (u32::from(module_id) << 8) | u32::from(api_id);
        ERR_MODULE_BASE + (cmd_id & 0xFFF)
    } else {
        let cmd_id = (u32::from(module_id - EXTENDED_MODULE_BASE) << 8) | u32::from(api_id);
        ERR_EXTENDED_MODULE_BASE + (cmd_id & 0xFFF)
    }
}
