//! Terminal test device
//!
//! Renders one bar per channel to a terminal instead of driving hardware.
//! Always present, so it is the fallback when no dongle is plugged in.
//!
//! Geometry follows the terminal: `(rows - 5) / 3` channels on 3 outputs,
//! and duplex mode spreads all three outputs into separate channels
//! (three times as many).

use super::{DeviceError, DimmerDevice};
use crate::config::TestDevConfig;
use crate::types::{DeviceDescriptor, MAX_INTENSITY};
use std::io::Write;

/// Registry name of this backend
pub const MODULE_NAME: &str = "testdev";

/// Rows reserved for the prompt below the bars
const RESERVED_ROWS: u16 = 5;
/// Outputs on the simulated rack
const OUTPUTS: u32 = 3;

pub struct TestDevice {
    rows: u16,
    columns: u16,
    render: bool,
    output: Option<Box<dyn Write + Send>>,
    info: Option<DeviceDescriptor>,
    last_rendered: Vec<u8>,
}

impl TestDevice {
    /// Test device rendering to stderr when `config.render` is set
    ///
    /// Stdout is not used: in process mode it carries the worker protocol.
    pub fn new(config: &TestDevConfig) -> Self {
        let output: Option<Box<dyn Write + Send>> = if config.render {
            Some(Box::new(std::io::stderr()))
        } else {
            None
        };
        Self::with_output(config, output)
    }

    /// Test device rendering into an arbitrary writer
    pub fn with_output(config: &TestDevConfig, output: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            rows: config.rows,
            columns: config.columns.max(8),
            render: config.render,
            output,
            info: None,
            last_rendered: Vec::new(),
        }
    }

    fn base_channels(&self) -> u32 {
        u32::from(self.rows.saturating_sub(RESERVED_ROWS) / 3)
    }

    /// One text line per channel: `NNN [****      ]`
    fn render_bars(&self, levels: &[u8]) -> String {
        let width = usize::from(self.columns) - 6;
        let mut out = String::from("\x1b[H");
        for (i, &level) in levels.iter().enumerate() {
            let stars = (usize::from(level) * width) / usize::from(MAX_INTENSITY);
            out.push_str(&format!(
                "{:>3} [{}{}]\n",
                i + 1,
                "*".repeat(stars),
                " ".repeat(width - stars)
            ));
        }
        out
    }
}

impl DimmerDevice for TestDevice {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn query_existence(&self) -> bool {
        true
    }

    fn query_device(&self) -> Result<DeviceDescriptor, DeviceError> {
        self.info.ok_or(DeviceError::NotInitialized)
    }

    fn initialize(&mut self) -> Result<(), DeviceError> {
        let channels = self.base_channels();
        if channels == 0 {
            return Err(DeviceError::Unavailable(format!(
                "terminal too small ({} rows)",
                self.rows
            )));
        }
        self.info = Some(DeviceDescriptor {
            channel_count: channels,
            output_count: OUTPUTS,
            duplexed: false,
            duplex_capable: true,
        });
        self.last_rendered.clear();
        log::info!("[testdev] Initialized with {} channels", channels);
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.info = None;
        self.last_rendered.clear();
    }

    fn set_duplex_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
        let base = self.base_channels();
        let info = self.info.as_mut().ok_or(DeviceError::NotInitialized)?;
        info.duplexed = enabled;
        info.channel_count = if enabled { base * OUTPUTS } else { base };
        self.last_rendered.clear();
        Ok(())
    }

    fn update_device(&mut self, levels: &[u8]) {
        if !self.render || self.info.is_none() || levels == self.last_rendered.as_slice() {
            return;
        }
        let frame = self.render_bars(levels);
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.write_all(frame.as_bytes()).and_then(|_| output.flush()) {
                log::warn!("[testdev] Render failed: {}", e);
            }
        }
        self.last_rendered.clear();
        self.last_rendered.extend_from_slice(levels);
    }
}
