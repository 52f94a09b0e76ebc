//! Dimmer control facade
//!
//! [`Dimmer`] is the host-side entry point. `init` starts a device worker,
//! discovers the backends it offers and (optionally) selects the first one
//! that initializes. Channel operations run through the host pipeline and
//! reach the worker as SET_CHANNEL messages; everything else is a blocking
//! request/response on the control link.
//!
//! Lock order is levels, then link. Calls that only talk to the worker
//! take the link alone.

use crate::config::DimmerConfig;
use crate::device::DeviceRegistry;
use crate::error::{DimmerError, Result};
use crate::fade::{lock, FadeEntry, FadeScheduler, Levels};
use crate::link::ControlLink;
use crate::pipeline::ChannelPipeline;
use crate::protocol::{ProtocolError, Request, Response, Tag};
use crate::types::{DeviceDescriptor, SystemState, MAX_INTENSITY};
use crate::worker::WorkerHandle;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type RegistryFactory = Box<dyn Fn() -> DeviceRegistry + Send>;

/// A NON_COMPLIANCE where the request cannot legitimately be refused
fn refused(request: &Request) -> DimmerError {
    ProtocolError::UnexpectedReply {
        request: request.tag(),
        tag: Tag::NonCompliance as u8,
    }
    .into()
}

/// Everything that lives between `init` and `deinit`
struct Session {
    worker: Option<WorkerHandle>,
    link: Arc<Mutex<ControlLink>>,
    levels: Arc<Mutex<Levels>>,
    scheduler: Option<FadeScheduler>,
    modules: Vec<String>,
    system: SystemState,
    device: Option<DeviceDescriptor>,
}

impl Session {
    fn new(worker: WorkerHandle, link: ControlLink) -> Self {
        Self {
            worker: Some(worker),
            link: Arc::new(Mutex::new(link)),
            levels: Arc::new(Mutex::new(Levels::default())),
            scheduler: None,
            modules: Vec::new(),
            system: SystemState::default(),
            device: None,
        }
    }

    fn call(&self, request: &Request) -> Result<Response> {
        Ok(lock(&self.link).call(request)?)
    }

    /// Read module names and check which backends have hardware present
    fn discover(&mut self) -> Result<()> {
        let request = Request::QueryDevMods;
        let count = match self.call(&request)? {
            Response::ModuleCount(count) => count,
            _ => return Err(refused(&request)),
        };

        let mut modules = Vec::with_capacity(count as usize);
        let mut present = Vec::new();
        for index in 0..count {
            let request = Request::QueryDevModName(index);
            match self.call(&request)? {
                Response::ModuleName(name) => modules.push(name),
                _ => return Err(refused(&request)),
            }
            if self.call(&Request::DeviceExists(index))?.is_compliance() {
                present.push(index as usize);
            }
        }

        log::info!(
            "[dimmer] Modules {:?}, present: {:?}",
            modules,
            present
                .iter()
                .map(|&id| modules[id].as_str())
                .collect::<Vec<_>>()
        );
        self.modules = modules;
        self.system = SystemState {
            device_count: present.len(),
            devices: present,
            current: None,
        };
        Ok(())
    }

    fn stop_scheduler(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }

    fn start_scheduler(&mut self, idle_interval: Duration) -> Result<()> {
        if self.scheduler.is_none() {
            self.scheduler = Some(FadeScheduler::start(
                self.levels.clone(),
                self.link.clone(),
                idle_interval,
            )?);
        }
        Ok(())
    }

    /// Fresh host tables for a new device shape; fades are dropped
    fn reshape(&self, desc: &DeviceDescriptor) -> Result<()> {
        let mut levels = lock(&self.levels);
        levels.pipeline.resize(desc.channels())?;
        levels.fades.clear();
        Ok(())
    }

    fn query_descriptor(&self) -> Result<DeviceDescriptor> {
        let request = Request::QueryDevice;
        match self.call(&request)? {
            Response::Device(desc) => Ok(desc),
            _ => Err(refused(&request)),
        }
    }

    fn select(&mut self, id: usize, idle_interval: Duration) -> Result<()> {
        let name = self.modules.get(id).cloned().unwrap_or_default();
        self.stop_scheduler();

        if self.system.current.take().is_some() {
            self.device = None;
            self.call(&Request::DeinitDevice)?;
        }

        if !self.call(&Request::InitDevice(id as u32))?.is_compliance() {
            log::warn!("[dimmer] {} refused to initialize", name);
            return Err(DimmerError::InitFailed(name));
        }

        let prepared = self
            .query_descriptor()
            .and_then(|desc| self.reshape(&desc).map(|_| desc));
        let desc = match prepared {
            Ok(desc) => desc,
            Err(e) => {
                log::warn!("[dimmer] Could not prepare {}: {}", name, e);
                let _ = self.call(&Request::DeinitDevice);
                return Err(match e {
                    DimmerError::OutOfMemory => e,
                    _ => DimmerError::InitFailed(name),
                });
            }
        };

        self.system.current = Some(id);
        self.device = Some(desc);
        self.start_scheduler(idle_interval)?;
        log::info!(
            "[dimmer] Selected {} ({} channels, {} outputs)",
            name,
            desc.channel_count,
            desc.output_count
        );
        Ok(())
    }

    fn set_duplex(&mut self, enabled: bool) -> Result<()> {
        if !self.call(&Request::SetDuplex(enabled))?.is_compliance() {
            return Err(DimmerError::Unsupported);
        }
        let desc = self.query_descriptor()?;
        self.reshape(&desc)?;
        self.device = Some(desc);
        log::info!(
            "[dimmer] Duplex {} ({} channels)",
            if enabled { "on" } else { "off" },
            desc.channel_count
        );
        Ok(())
    }

    /// Release the device and stop the worker; never fails
    fn teardown(&mut self) {
        self.stop_scheduler();
        if self.system.current.take().is_some() {
            if let Err(e) = self.call(&Request::DeinitDevice) {
                log::warn!("[dimmer] DEINIT_DEVICE failed: {}", e);
            }
        }
        self.device = None;
        if let Some(worker) = self.worker.take() {
            let mut link = lock(&self.link);
            worker.shutdown(&mut link);
        }
    }
}

/// Host-side dimmer controller
pub struct Dimmer {
    config: DimmerConfig,
    registry: RegistryFactory,
    session: Option<Session>,
}

impl Dimmer {
    /// Controller over the built-in backends
    pub fn new(config: DimmerConfig) -> Self {
        let devices = config.devices.clone();
        Self::with_registry(config, move || DeviceRegistry::from_config(&devices))
    }

    /// Controller whose in-process worker drives the backends built by `factory`
    ///
    /// `factory` runs once per `init`. A worker process builds its own
    /// registry and ignores it.
    pub fn with_registry<F>(config: DimmerConfig, factory: F) -> Self
    where
        F: Fn() -> DeviceRegistry + Send + 'static,
    {
        Self {
            config,
            registry: Box::new(factory),
            session: None,
        }
    }

    pub fn config(&self) -> &DimmerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(DimmerError::NotInitialized)
    }

    /// Session with a selected device
    fn active(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .filter(|s| s.device.is_some())
            .ok_or(DimmerError::NoDeviceSelected)
    }

    /// Start the worker and discover devices
    ///
    /// With `auto_select`, the present devices are tried in registry order
    /// and the first that initializes is selected; if none does, the
    /// system is torn down again and `NoDevice` is returned.
    pub fn init(&mut self, auto_select: bool) -> Result<()> {
        if self.session.is_some() {
            return Err(DimmerError::AlreadyInitialized);
        }

        let (worker, link) = WorkerHandle::start(&self.config, || (self.registry)())?;
        let mut session = Session::new(worker, link);
        if let Err(e) = session.discover() {
            log::error!("[dimmer] Device discovery failed: {}", e);
            session.teardown();
            return Err(e);
        }
        self.session = Some(session);

        if auto_select {
            if let Err(e) = self.auto_select() {
                self.deinit();
                return Err(e);
            }
        }
        Ok(())
    }

    fn auto_select(&mut self) -> Result<()> {
        let candidates = self.session()?.system.devices.clone();
        for id in candidates {
            match self.select_id(id) {
                Ok(()) => return Ok(()),
                Err(DimmerError::InitFailed(name)) => {
                    log::info!("[dimmer] Skipping {}", name);
                }
                Err(e) => return Err(e),
            }
        }
        log::warn!("[dimmer] No device could be initialized");
        Err(DimmerError::NoDevice)
    }

    /// Release the device and stop the worker. Safe to call repeatedly.
    pub fn deinit(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.teardown();
            log::info!("[dimmer] Shut down");
        }
    }

    /// Registry id of a present device by module name
    pub fn device_available(&self, name: &str) -> Option<usize> {
        let session = self.session.as_ref()?;
        session
            .modules
            .iter()
            .position(|m| m == name)
            .filter(|&id| session.system.is_available(id))
    }

    /// Switch to the named device
    ///
    /// Stops fades, releases the current device and resets all host
    /// tables to the new channel count.
    pub fn select_device(&mut self, name: &str) -> Result<()> {
        self.session()?;
        let id = self
            .device_available(name)
            .ok_or_else(|| DimmerError::NoSuchDevice(name.to_string()))?;
        self.select_id(id)
    }

    fn select_id(&mut self, id: usize) -> Result<()> {
        let idle = self.config.fade.idle_interval();
        let session = self.session.as_mut().ok_or(DimmerError::NotInitialized)?;
        session.select(id, idle)
    }

    /// Module names of every backend the worker offers, in registry order
    pub fn module_names(&self) -> &[String] {
        self.session
            .as_ref()
            .map(|s| s.modules.as_slice())
            .unwrap_or(&[])
    }

    pub fn query_system(&self) -> Result<SystemState> {
        Ok(self.session()?.system.clone())
    }

    /// Descriptor of the selected device
    pub fn query_device(&self) -> Result<DeviceDescriptor> {
        self.active()?.device.ok_or(DimmerError::NoDeviceSelected)
    }

    /// Request duplex mode `enabled`
    ///
    /// On success all host tables are reset to the new channel count.
    /// A device without duplex support yields `Unsupported` and keeps its
    /// current shape.
    pub fn set_duplex_mode(&mut self, enabled: bool) -> Result<()> {
        self.active()?;
        let idle = self.config.fade.idle_interval();
        let session = self.session.as_mut().ok_or(DimmerError::NotInitialized)?;

        session.stop_scheduler();
        let result = session.set_duplex(enabled);
        let restarted = session.start_scheduler(idle);
        result.and(restarted)
    }

    /// Set a logical channel's level
    pub fn channel_set(&self, channel: usize, level: u8) -> Result<()> {
        let session = self.active()?;
        let mut levels = lock(&session.levels);
        let mut link = lock(&session.link);
        levels.pipeline.write(channel, level, &mut *link)
    }

    /// Set a logical channel to full
    pub fn channel_bump(&self, channel: usize) -> Result<()> {
        self.channel_set(channel, MAX_INTENSITY)
    }

    /// Fade a logical channel to `level` over `seconds`
    ///
    /// Replaces any fade already running on the channel.
    pub fn channel_fade(&self, channel: usize, level: u8, seconds: f64) -> Result<()> {
        let session = self.active()?;
        {
            let mut levels = lock(&session.levels);
            let current = levels
                .pipeline
                .raw_level(channel)
                .ok_or(DimmerError::InvalidChannel(channel))?;
            levels
                .fades
                .start(channel, current, level, seconds, Instant::now())?;
        }
        if let Some(scheduler) = &session.scheduler {
            scheduler.wake();
        }
        Ok(())
    }

    /// Flip blackout; returns the new state
    pub fn toggle_blackout(&self) -> Result<bool> {
        let session = self.session()?;
        let mut levels = lock(&session.levels);
        let mut link = lock(&session.link);
        let on = !levels.pipeline.is_blackout();
        levels.pipeline.set_blackout(on, &mut *link)?;
        log::info!("[dimmer] Blackout {}", if on { "on" } else { "off" });
        Ok(on)
    }

    /// Scale every channel by `level / 255`
    pub fn set_grand_master(&self, level: u8) -> Result<()> {
        let session = self.session()?;
        let mut levels = lock(&session.levels);
        let mut link = lock(&session.link);
        levels.pipeline.set_grand_master(level, &mut *link)
    }

    /// Route logical channel `logical` to physical channel `physical`
    pub fn channel_patch(&self, logical: usize, physical: usize) -> Result<()> {
        let session = self.session()?;
        lock(&session.levels).pipeline.patch(logical, physical)
    }

    /// Copy of the host channel tables
    pub fn pipeline(&self) -> Result<ChannelPipeline> {
        Ok(lock(&self.session()?.levels).pipeline.clone())
    }

    /// Fade state of a logical channel, if a fade was ever started on it
    pub fn fade_state(&self, channel: usize) -> Option<FadeEntry> {
        let session = self.session.as_ref()?;
        let levels = lock(&session.levels);
        levels.fades.get(channel).copied()
    }

    pub fn worker_id(&self) -> Option<u32> {
        self.session
            .as_ref()
            .and_then(|s| s.worker.as_ref())
            .map(|w| w.worker_id())
    }
}

impl Drop for Dimmer {
    fn drop(&mut self) {
        self.deinit();
    }
}
