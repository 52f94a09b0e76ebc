//! Error types for the dimmer control facade

use crate::protocol::ProtocolError;
use std::collections::TryReserveError;
use thiserror::Error;

/// Errors reported by [`Dimmer`](crate::Dimmer) operations
#[derive(Error, Debug)]
pub enum DimmerError {
    // State errors
    /// Operation requires `init` first
    #[error("Dimmer system is not initialized")]
    NotInitialized,

    /// `init` called on a running system
    #[error("Dimmer system is already initialized")]
    AlreadyInitialized,

    /// Auto-selection found no device that would initialize
    #[error("No usable dimmer device found")]
    NoDevice,

    /// No present device with this module name
    #[error("No such device: {0}")]
    NoSuchDevice(String),

    /// The worker could not initialize the requested device
    #[error("Failed to initialize device: {0}")]
    InitFailed(String),

    /// Operation requires a selected device
    #[error("No device selected")]
    NoDeviceSelected,

    // Capability errors
    /// The active device rejected the request (e.g. duplex mode)
    #[error("Operation not supported by the selected device")]
    Unsupported,

    // Argument errors
    #[error("Invalid channel: {0}")]
    InvalidChannel(usize),

    #[error("Fade duration must be a non-negative number of seconds, got {0}")]
    NegativeDuration(f64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Resource errors
    /// Buffer or fade allocation failed; the previous state is kept
    #[error("Out of memory")]
    OutOfMemory,

    // Protocol / bootstrap errors
    /// The worker could not be started or failed its liveness handshake
    #[error("Device worker bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TryReserveError> for DimmerError {
    fn from(_: TryReserveError) -> Self {
        DimmerError::OutOfMemory
    }
}

/// Result type for dimmer operations
pub type Result<T> = std::result::Result<T, DimmerError>;
