//! DaddyMax DMX512 dongle driver
//!
//! The dongle's kernel driver exposes a character device (default
//! `/dev/daddymax`). Each update writes one DMX frame to it:
//!
//! | Byte  | Content |
//! |-------|---------|
//! | 0     | DMX start code (0x00) |
//! | 1-512 | Channel levels |
//!
//! The dongle has a single output and cannot be duplexed.

use super::{DeviceError, DimmerDevice};
use crate::config::DaddyMaxConfig;
use crate::types::DeviceDescriptor;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Registry name of this backend
pub const MODULE_NAME: &str = "daddymax_kernel";

/// Channels in one DMX512 universe
pub const DMX_CHANNELS: u32 = 512;

/// DMX null start code
const START_CODE: u8 = 0x00;

pub struct DaddyMaxDevice {
    path: PathBuf,
    port: Option<File>,
    frame: Vec<u8>,
    /// Set after the first failed write so a dead dongle doesn't flood the log
    write_failed: bool,
}

impl DaddyMaxDevice {
    pub fn new(config: &DaddyMaxConfig) -> Self {
        Self {
            path: config.device_path.clone(),
            port: None,
            frame: Vec::with_capacity(DMX_CHANNELS as usize + 1),
            write_failed: false,
        }
    }

    /// Fill the frame buffer: start code followed by exactly one universe
    fn build_frame(&mut self, levels: &[u8]) {
        let n = levels.len().min(DMX_CHANNELS as usize);
        self.frame.clear();
        self.frame.push(START_CODE);
        self.frame.extend_from_slice(&levels[..n]);
        self.frame.resize(DMX_CHANNELS as usize + 1, 0);
    }
}

#[cfg(unix)]
fn is_char_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_char_device(_path: &Path) -> bool {
    false
}

impl DimmerDevice for DaddyMaxDevice {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn query_existence(&self) -> bool {
        is_char_device(&self.path)
    }

    fn query_device(&self) -> Result<DeviceDescriptor, DeviceError> {
        if self.port.is_none() {
            return Err(DeviceError::NotInitialized);
        }
        Ok(DeviceDescriptor {
            channel_count: DMX_CHANNELS,
            output_count: 1,
            duplexed: false,
            duplex_capable: false,
        })
    }

    fn initialize(&mut self) -> Result<(), DeviceError> {
        let port = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| DeviceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;

        log::info!("[daddymax] Opened {}", self.path.display());
        self.port = Some(port);
        self.write_failed = false;
        Ok(())
    }

    fn deinitialize(&mut self) {
        if self.port.take().is_some() {
            log::info!("[daddymax] Closed {}", self.path.display());
        }
    }

    fn set_duplex_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
        log::debug!("[daddymax] Duplex mode {} rejected", enabled);
        Err(DeviceError::Unsupported)
    }

    fn update_device(&mut self, levels: &[u8]) {
        if self.port.is_none() {
            return;
        }
        self.build_frame(levels);

        let Some(port) = self.port.as_mut() else {
            return;
        };
        match port.write_all(&self.frame) {
            Ok(()) => self.write_failed = false,
            Err(e) => {
                if !self.write_failed {
                    log::error!("[daddymax] Write error: {}", e);
                }
                self.write_failed = true;
            }
        }
    }
}
