// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared fixtures for loader integration tests.
// Author: Lukas Bower
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use plm_loader::pdi_format::{Cpu, ExecState, VectorLocation};
use plm_loader::{
    BootDevice, BootSource, CopyFlags, DeviceError, DeviceRegistry, ImageLoader, Interpreter,
    LoaderConfig, PowerError, PowerManager,
};

pub type ReadLog = Rc<RefCell<Vec<(u64, usize)>>>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory boot device that records every read.
pub struct RecordingDevice {
    data: Vec<u8>,
    reads: ReadLog,
}

impl RecordingDevice {
    pub fn new(data: Vec<u8>) -> (Self, ReadLog) {
        let reads = ReadLog::default();
        (
            Self {
                data,
                reads: Rc::clone(&reads),
            },
            reads,
        )
    }
}

impl BootDevice for RecordingDevice {
    fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read(&mut self, src: u64, buf: &mut [u8], _flags: CopyFlags) -> Result<(), DeviceError> {
        self.reads.borrow_mut().push((src, buf.len()));
        let start = src as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(DeviceError::OutOfRange {
                src,
                len: buf.len(),
                size: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Loader serving `image` from DDR with `config`.
pub fn loader_with(image: Vec<u8>, config: LoaderConfig) -> (ImageLoader, ReadLog) {
    let (device, reads) = RecordingDevice::new(image);
    let mut registry = DeviceRegistry::new();
    registry.register(BootSource::Ddr, Box::new(device));
    let interp = Interpreter::with_general_module().unwrap();
    (ImageLoader::new(registry, interp, config).unwrap(), reads)
}

pub fn loader(image: Vec<u8>) -> (ImageLoader, ReadLog) {
    loader_with(image, LoaderConfig::default())
}

/// Whether any recorded read touched `[start, start + len)`.
pub fn touched(reads: &ReadLog, start: u64, len: u64) -> bool {
    reads
        .borrow()
        .iter()
        .any(|(src, n)| *src < start + len && start < *src + *n as u64)
}

#[derive(Debug, Default)]
pub struct RecordingPm {
    pub exec_states: Vec<(Cpu, ExecState)>,
    pub vectors: Vec<(Cpu, VectorLocation)>,
    pub woken: Vec<(Cpu, u64)>,
    pub refuse: Option<Cpu>,
}

impl PowerManager for RecordingPm {
    fn set_exec_state(&mut self, cpu: Cpu, state: ExecState) -> Result<(), PowerError> {
        self.exec_states.push((cpu, state));
        Ok(())
    }

    fn set_vector_location(&mut self, cpu: Cpu, vector: VectorLocation) -> Result<(), PowerError> {
        self.vectors.push((cpu, vector));
        Ok(())
    }

    fn request_wake(&mut self, cpu: Cpu, entry: u64) -> Result<(), PowerError> {
        if self.refuse == Some(cpu) {
            return Err(PowerError(format!("{cpu} held in reset")));
        }
        self.woken.push((cpu, entry));
        Ok(())
    }
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
