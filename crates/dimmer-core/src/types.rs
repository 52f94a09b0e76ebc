//! Shared value types for the dimmer engine
//!
//! These types cross every layer: backends fill in [`DeviceDescriptor`],
//! the worker ships it over the wire, and the facade keeps a copy in its
//! [`SystemState`].

use serde::{Deserialize, Serialize};

/// Full intensity for a single channel
pub const MAX_INTENSITY: u8 = u8::MAX;

/// Static shape of a hardware device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Addressable channels in the current duplex mode
    pub channel_count: u32,
    /// Physical outputs on the device
    pub output_count: u32,
    /// Whether duplex mode is currently enabled
    pub duplexed: bool,
    /// Whether the device can switch into duplex mode at all
    pub duplex_capable: bool,
}

impl DeviceDescriptor {
    /// Channel count as a buffer length
    pub fn channels(&self) -> usize {
        self.channel_count as usize
    }
}

/// Global control state reported by `Dimmer::query_system`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemState {
    /// Number of backends that reported their hardware as present
    pub device_count: usize,
    /// Registry ids of the present backends, in discovery order
    pub devices: Vec<usize>,
    /// Registry id of the selected backend
    pub current: Option<usize>,
}

impl SystemState {
    /// Whether `id` was found present during discovery
    pub fn is_available(&self, id: usize) -> bool {
        self.devices.contains(&id)
    }
}
