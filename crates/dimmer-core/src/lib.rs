//! Dimmer control engine for DMX lighting hardware
//!
//! This crate provides:
//! - A device worker that owns the hardware backends and refreshes the
//!   active device continuously
//! - A compact byte protocol between host and worker (no shared memory)
//! - The host channel pipeline: patch, grand master, blackout
//! - Timed per-channel fades driven by a scheduler thread
//! - Built-in backends: DaddyMax DMX512 dongle and a terminal test device
//!
//! # Architecture
//!
//! ```text
//! Dimmer ─ pipeline/fades ─ ControlLink ═ bytes ═ DeviceWorker ─ DimmerDevice
//!                ▲                                      │
//!         FadeScheduler                       update_device every poll
//! ```
//!
//! The worker runs on its own thread, or as a `dimmer-worker` process
//! talking over stdin/stdout. The host blocks on each request until the
//! worker replies; SET_CHANNEL is fire-and-forget.

pub mod config;
pub mod device;
mod dimmer;
mod error;
pub mod fade;
pub mod link;
pub mod pipeline;
pub mod protocol;
pub mod types;
pub mod worker;

pub use config::{
    default_config_path, load_config, save_config, DimmerConfig, FadeConfig, WorkerConfig,
    WorkerMode,
};
pub use device::{DeviceError, DeviceRegistry, DimmerDevice};
pub use dimmer::Dimmer;
pub use error::{DimmerError, Result};
pub use fade::FadeEntry;
pub use pipeline::ChannelPipeline;
pub use protocol::ProtocolError;
pub use types::{DeviceDescriptor, SystemState, MAX_INTENSITY};
pub use worker::{serve_stdio, WorkerHandle};
