//! Dimmer device backends
//!
//! Maps backend ids to device-specific drivers. Each driver knows how to
//! detect its hardware, describe it, and push a full frame of cooked levels
//! to it. Drivers only ever run inside the device worker.

pub mod daddymax;
pub mod testdev;

use crate::config::DevicesConfig;
use crate::types::DeviceDescriptor;

/// Errors a backend can report through the capability interface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device is not initialized")]
    NotInitialized,

    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Operation not supported by this device")]
    Unsupported,
}

/// Trait for dimmer device drivers
///
/// Every call is expected to return quickly: the worker calls
/// [`update_device`](DimmerDevice::update_device) on every loop iteration
/// while the device is active.
pub trait DimmerDevice: Send {
    /// Stable, human-readable module identifier
    fn module_name(&self) -> &str;

    /// Whether the underlying hardware is present
    ///
    /// Must only report; a missing device is `false`, never a panic.
    fn query_existence(&self) -> bool;

    /// Current shape of the device
    fn query_device(&self) -> Result<DeviceDescriptor, DeviceError>;

    /// Acquire the hardware
    ///
    /// Callers must not initialize twice without deinitializing in between.
    fn initialize(&mut self) -> Result<(), DeviceError>;

    /// Release the hardware. Always succeeds from the caller's point of view.
    fn deinitialize(&mut self);

    /// Switch duplex mode to `enabled` (the desired state, not a toggle)
    fn set_duplex_mode(&mut self, enabled: bool) -> Result<(), DeviceError>;

    /// Push the full cooked level buffer to the hardware
    ///
    /// Called unconditionally every tick, even when nothing changed.
    fn update_device(&mut self, levels: &[u8]);

    /// Copy the module name into `buffer`, truncating if needed
    ///
    /// The result is always NUL-terminated when `buffer` is non-empty.
    /// Returns the number of name bytes written (excluding the terminator).
    fn copy_module_name(&self, buffer: &mut [u8]) -> usize {
        let Some(room) = buffer.len().checked_sub(1) else {
            return 0;
        };
        let name = self.module_name().as_bytes();
        let len = name.len().min(room);
        buffer[..len].copy_from_slice(&name[..len]);
        buffer[len] = 0;
        len
    }
}

/// Known backend entry
struct KnownDevice {
    name: &'static str,
    create: fn(&DevicesConfig) -> Box<dyn DimmerDevice>,
}

/// Backends compiled into the engine, in registry id order
static KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice {
        name: daddymax::MODULE_NAME,
        create: |config| Box::new(daddymax::DaddyMaxDevice::new(&config.daddymax)),
    },
    KnownDevice {
        name: testdev::MODULE_NAME,
        create: |config| Box::new(testdev::TestDevice::new(&config.testdev)),
    },
];

/// Names of all built-in backends, in registry id order
pub fn known_module_names() -> impl Iterator<Item = &'static str> {
    KNOWN_DEVICES.iter().map(|d| d.name)
}

/// The closed set of backends a worker may drive
///
/// Registry ids are indices into this list and are stable for the lifetime
/// of the worker.
pub struct DeviceRegistry {
    devices: Vec<Box<dyn DimmerDevice>>,
}

impl DeviceRegistry {
    /// Build a registry with every built-in backend
    pub fn from_config(config: &DevicesConfig) -> Self {
        Self {
            devices: KNOWN_DEVICES.iter().map(|d| (d.create)(config)).collect(),
        }
    }

    /// Build a registry from an explicit backend list
    pub fn with_devices(devices: Vec<Box<dyn DimmerDevice>>) -> Self {
        Self { devices }
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry has no backends at all
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Borrow a backend by registry id
    pub fn get(&self, id: usize) -> Option<&dyn DimmerDevice> {
        self.devices.get(id).map(|d| d.as_ref())
    }

    /// Mutably borrow a backend by registry id
    pub fn get_mut(&mut self, id: usize) -> Option<&mut (dyn DimmerDevice + 'static)> {
        self.devices.get_mut(id).map(|d| d.as_mut())
    }

    /// Look up a registry id by module name
    pub fn find(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.module_name() == name)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::from_config(&DevicesConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording backend for worker and facade tests

    use super::*;
    use std::sync::{Arc, Mutex};

    /// What the mock backend has seen, shared with the test body
    #[derive(Debug, Default)]
    pub struct MockLog {
        pub initialized: bool,
        pub init_calls: usize,
        pub deinit_calls: usize,
        pub duplex_requests: Vec<bool>,
        pub last_frame: Vec<u8>,
        pub frames: usize,
    }

    pub struct MockDevice {
        pub name: String,
        pub present: bool,
        pub fail_init: bool,
        pub duplex_capable: bool,
        pub channels: u32,
        pub duplexed: bool,
        pub log: Arc<Mutex<MockLog>>,
    }

    impl MockDevice {
        pub fn new(name: &str, channels: u32) -> Self {
            Self {
                name: name.to_string(),
                present: true,
                fail_init: false,
                duplex_capable: true,
                channels,
                duplexed: false,
                log: Arc::new(Mutex::new(MockLog::default())),
            }
        }
    }

    impl DimmerDevice for MockDevice {
        fn module_name(&self) -> &str {
            &self.name
        }

        fn query_existence(&self) -> bool {
            self.present
        }

        fn query_device(&self) -> Result<DeviceDescriptor, DeviceError> {
            if !self.log.lock().unwrap().initialized {
                return Err(DeviceError::NotInitialized);
            }
            Ok(DeviceDescriptor {
                channel_count: if self.duplexed { self.channels * 2 } else { self.channels },
                output_count: if self.duplex_capable { 2 } else { 1 },
                duplexed: self.duplexed,
                duplex_capable: self.duplex_capable,
            })
        }

        fn initialize(&mut self) -> Result<(), DeviceError> {
            let mut log = self.log.lock().unwrap();
            log.init_calls += 1;
            if self.fail_init {
                return Err(DeviceError::Unavailable(self.name.clone()));
            }
            log.initialized = true;
            Ok(())
        }

        fn deinitialize(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.deinit_calls += 1;
            log.initialized = false;
            self.duplexed = false;
        }

        fn set_duplex_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
            self.log.lock().unwrap().duplex_requests.push(enabled);
            if !self.duplex_capable {
                return Err(DeviceError::Unsupported);
            }
            self.duplexed = enabled;
            Ok(())
        }

        fn update_device(&mut self, levels: &[u8]) {
            let mut log = self.log.lock().unwrap();
            log.last_frame.clear();
            log.last_frame.extend_from_slice(levels);
            log.frames += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;

    #[test]
    fn test_default_registry_order() {
        let registry = DeviceRegistry::default();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("daddymax_kernel"), Some(0));
        assert_eq!(registry.find("testdev"), Some(1));
        assert_eq!(registry.find("nope"), None);
    }

    #[test]
    fn test_known_module_names_match_registry() {
        let registry = DeviceRegistry::default();
        for (id, name) in known_module_names().enumerate() {
            assert_eq!(registry.get(id).unwrap().module_name(), name);
        }
    }

    #[test]
    fn test_copy_module_name_truncates_and_terminates() {
        let device = MockDevice::new("daddymax_kernel", 512);

        let mut short = [0xFFu8; 5];
        assert_eq!(device.copy_module_name(&mut short), 4);
        assert_eq!(&short, b"dadd\0");

        let mut roomy = [0xFFu8; 32];
        let n = device.copy_module_name(&mut roomy);
        assert_eq!(&roomy[..n], b"daddymax_kernel");
        assert_eq!(roomy[n], 0);

        let mut empty: [u8; 0] = [];
        assert_eq!(device.copy_module_name(&mut empty), 0);
    }
}
