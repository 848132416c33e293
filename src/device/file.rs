// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serve boot images from a host file.
// Author: Lukas Bower

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use super::{BootDevice, CopyFlags, DeviceError};

/// Boot device reading an image file, standing in for SD or flash on a host.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Option<File>,
}

impl FileDevice {
    /// Device for `path`. The file is opened by [`BootDevice::init`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

impl BootDevice for FileDevice {
    fn init(&mut self) -> Result<(), DeviceError> {
        let file = File::open(&self.path)
            .map_err(|e| DeviceError::Transport(format!("{}: {e}", self.path.display())))?;
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self, src: u64, buf: &mut [u8], _flags: CopyFlags) -> Result<(), DeviceError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DeviceError::Transport("file device not initialised".into()))?;
        file.seek(SeekFrom::Start(src))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    fn size(&self) -> Option<u64> {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
    }
}
