//! Host-side channel pipeline
//!
//! Logical channel → patch → raw level → grand master / blackout → cooked
//! level → worker. The raw and cooked tables are indexed by physical
//! channel. Only cooked values that actually change are sent to the worker,
//! and a cooked value is committed only once its SET_CHANNEL went out, so
//! the table always mirrors what the worker has been told.

use crate::error::{DimmerError, Result};
use crate::protocol::ProtocolError;
use crate::types::MAX_INTENSITY;

/// Destination for cooked level changes
pub trait LevelSink {
    fn send_level(&mut self, channel: usize, level: u8) -> std::result::Result<(), ProtocolError>;
}

/// Scale a raw level by the grand master
pub fn cook(raw: u8, grand_master: u8) -> u8 {
    (u16::from(raw) * u16::from(grand_master) / u16::from(MAX_INTENSITY)) as u8
}

#[derive(Debug, Clone)]
pub struct ChannelPipeline {
    /// logical → physical
    patch: Vec<usize>,
    raw: Vec<u8>,
    cooked: Vec<u8>,
    blackout: bool,
    grand_master: u8,
}

impl Default for ChannelPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPipeline {
    /// Empty pipeline (no device), full grand master, blackout off
    pub fn new() -> Self {
        Self {
            patch: Vec::new(),
            raw: Vec::new(),
            cooked: Vec::new(),
            blackout: false,
            grand_master: MAX_INTENSITY,
        }
    }

    /// Replace the tables with `channels` zeroed entries and an identity patch
    ///
    /// Blackout and grand master survive. On allocation failure the previous
    /// tables are left untouched.
    pub fn resize(&mut self, channels: usize) -> Result<()> {
        let mut patch = Vec::new();
        let mut raw = Vec::new();
        let mut cooked = Vec::new();
        patch.try_reserve_exact(channels)?;
        raw.try_reserve_exact(channels)?;
        cooked.try_reserve_exact(channels)?;

        patch.extend(0..channels);
        raw.resize(channels, 0);
        cooked.resize(channels, 0);

        self.patch = patch;
        self.raw = raw;
        self.cooked = cooked;
        log::debug!("[pipeline] Resized to {} channels", channels);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.patch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }

    pub fn patch_table(&self) -> &[usize] {
        &self.patch
    }

    pub fn raw_levels(&self) -> &[u8] {
        &self.raw
    }

    pub fn cooked_levels(&self) -> &[u8] {
        &self.cooked
    }

    pub fn is_blackout(&self) -> bool {
        self.blackout
    }

    pub fn grand_master(&self) -> u8 {
        self.grand_master
    }

    /// Raw level behind a logical channel
    pub fn raw_level(&self, logical: usize) -> Option<u8> {
        self.patch.get(logical).map(|&p| self.raw[p])
    }

    fn target(&self, raw: u8) -> u8 {
        if self.blackout {
            0
        } else {
            cook(raw, self.grand_master)
        }
    }

    /// Set the raw level of a logical channel
    pub fn write(&mut self, logical: usize, level: u8, sink: &mut dyn LevelSink) -> Result<()> {
        let physical = *self
            .patch
            .get(logical)
            .ok_or(DimmerError::InvalidChannel(logical))?;

        let cooked = self.target(level);
        if cooked != self.cooked[physical] {
            sink.send_level(physical, cooked)?;
            self.cooked[physical] = cooked;
        }
        self.raw[physical] = level;
        Ok(())
    }

    /// Route a logical channel to a physical one
    ///
    /// Only affects later writes; current levels are not moved.
    pub fn patch(&mut self, logical: usize, physical: usize) -> Result<()> {
        let len = self.patch.len();
        if physical >= len {
            return Err(DimmerError::InvalidArgument(format!(
                "physical channel {} out of range (0..{})",
                physical, len
            )));
        }
        let slot = self.patch.get_mut(logical).ok_or_else(|| {
            DimmerError::InvalidArgument(format!(
                "logical channel {} out of range (0..{})",
                logical, len
            ))
        })?;
        *slot = physical;
        Ok(())
    }

    /// Switch blackout on or off
    ///
    /// On: every physical channel is driven to zero. Off: every channel is
    /// recooked from its raw level.
    pub fn set_blackout(&mut self, on: bool, sink: &mut dyn LevelSink) -> Result<()> {
        self.blackout = on;
        self.refresh(sink)
    }

    pub fn set_grand_master(&mut self, level: u8, sink: &mut dyn LevelSink) -> Result<()> {
        self.grand_master = level;
        self.refresh(sink)
    }

    /// Bring every cooked value in line with raw, grand master and blackout
    ///
    /// Stops at the first failed send; channels already sent stay committed.
    pub fn refresh(&mut self, sink: &mut dyn LevelSink) -> Result<()> {
        for physical in 0..self.cooked.len() {
            let target = self.target(self.raw[physical]);
            if target != self.cooked[physical] {
                sink.send_level(physical, target)?;
                self.cooked[physical] = target;
            }
        }
        Ok(())
    }
}
