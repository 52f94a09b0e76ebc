//! Device worker
//!
//! The worker owns the backend registry and the active device. It loops:
//! wait up to the poll interval for one request, serve it, then push the
//! full level buffer to the active device. The only thing it shares with
//! the host is the byte stream of the control link.
//!
//! It runs either on a dedicated thread inside the host process or as a
//! separate `dimmer-worker` process talking over stdin/stdout.

use crate::config::{DimmerConfig, WorkerConfig, WorkerMode};
use crate::device::DeviceRegistry;
use crate::error::{DimmerError, Result};
use crate::link::{pipe, ControlLink, Inbound};
use crate::protocol::{ProtocolError, Request, Response, MAX_MODULE_NAME};
use std::io::{self, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Task ids for in-process workers
static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

/// What the loop does after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// The worker side of the control link
pub struct DeviceWorker<I: Inbound, W: Write> {
    registry: DeviceRegistry,
    active: Option<usize>,
    levels: Vec<u8>,
    inbound: I,
    outbound: W,
    worker_id: u32,
    poll_interval: Duration,
}

impl<I: Inbound, W: Write> DeviceWorker<I, W> {
    pub fn new(
        registry: DeviceRegistry,
        inbound: I,
        outbound: W,
        worker_id: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            active: None,
            levels: Vec::new(),
            inbound,
            outbound,
            worker_id,
            poll_interval,
        }
    }

    pub fn active_device(&self) -> Option<usize> {
        self.active
    }

    pub fn levels(&self) -> &[u8] {
        &self.levels
    }

    /// Serve the host until PLEASE_DIE or until the link closes
    ///
    /// The first request must be ARE_YOU_ALIVE.
    pub fn run(mut self) -> std::result::Result<(), ProtocolError> {
        let result = self.serve();
        self.release_active();
        match result {
            Err(ProtocolError::Disconnected) => {
                log::info!("[worker] Host closed the control link");
                Ok(())
            }
            other => other,
        }
    }

    fn serve(&mut self) -> std::result::Result<(), ProtocolError> {
        match Request::read_from(&mut self.inbound)? {
            Request::AreYouAlive => {
                self.handle(Request::AreYouAlive)?;
            }
            other => {
                return Err(ProtocolError::Handshake(format!(
                    "first request was {:?}",
                    other.tag()
                )));
            }
        }
        log::info!("[worker] Worker {} ready", self.worker_id);

        loop {
            if self.step()? == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// One loop iteration: serve at most one request, then refresh the device
    pub fn step(&mut self) -> std::result::Result<Flow, ProtocolError> {
        if self.inbound.poll(self.poll_interval)? {
            match Request::read_from(&mut self.inbound) {
                Ok(request) => {
                    if self.handle(request)? == Flow::Exit {
                        return Ok(Flow::Exit);
                    }
                }
                // Reply tags carry no payload, so the stream stays framed.
                // An unknown tag leaves an unknown payload behind and is fatal.
                Err(e @ ProtocolError::NotARequest(_)) => {
                    log::warn!("[worker] Ignoring message: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(id) = self.active {
            if let Some(device) = self.registry.get_mut(id) {
                device.update_device(&self.levels);
            }
        }
        Ok(Flow::Continue)
    }

    fn reply(&mut self, response: Response) -> std::result::Result<(), ProtocolError> {
        response.write_to(&mut self.outbound)
    }

    fn compliance(&mut self, ok: bool) -> std::result::Result<(), ProtocolError> {
        self.reply(if ok {
            Response::Compliance
        } else {
            Response::NonCompliance
        })
    }

    /// Serve a single request
    pub fn handle(&mut self, request: Request) -> std::result::Result<Flow, ProtocolError> {
        log::trace!("[worker] {:?}", request);
        match request {
            Request::AreYouAlive => {
                let worker_id = self.worker_id;
                self.reply(Response::Alive { worker_id })?;
            }
            Request::PleaseDie => {
                self.reply(Response::Compliance)?;
                self.release_active();
                log::info!("[worker] Exiting on request");
                return Ok(Flow::Exit);
            }
            Request::QueryDevMods => {
                let count = self.registry.len() as u32;
                self.reply(Response::ModuleCount(count))?;
            }
            Request::QueryDevModName(index) => {
                let response = match self.registry.get(index as usize) {
                    Some(device) => {
                        let mut buffer = [0u8; MAX_MODULE_NAME + 1];
                        let len = device.copy_module_name(&mut buffer);
                        Response::ModuleName(String::from_utf8_lossy(&buffer[..len]).into_owned())
                    }
                    None => Response::NonCompliance,
                };
                self.reply(response)?;
            }
            Request::DeviceExists(index) => {
                let exists = self
                    .registry
                    .get(index as usize)
                    .is_some_and(|d| d.query_existence());
                self.compliance(exists)?;
            }
            Request::InitDevice(index) => {
                let ok = self.init_device(index as usize);
                self.compliance(ok)?;
            }
            Request::DeinitDevice => {
                self.release_active();
                self.reply(Response::Compliance)?;
            }
            Request::QueryDevice => {
                let response = self
                    .active
                    .and_then(|id| self.registry.get(id))
                    .and_then(|d| d.query_device().ok())
                    .map_or(Response::NonCompliance, Response::Device);
                self.reply(response)?;
            }
            Request::SetDuplex(enabled) => {
                let ok = self.set_duplex(enabled);
                self.compliance(ok)?;
            }
            Request::SetChannel { channel, level } => {
                match self.levels.get_mut(channel as usize) {
                    Some(slot) => *slot = level,
                    None => log::trace!("[worker] SET_CHANNEL {} out of range", channel),
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Switch the active device; an invalid index changes nothing
    fn init_device(&mut self, id: usize) -> bool {
        if id >= self.registry.len() {
            log::warn!("[worker] INIT_DEVICE with invalid id {}", id);
            return false;
        }
        self.release_active();

        let Some(device) = self.registry.get_mut(id) else {
            return false;
        };
        if let Err(e) = device.initialize() {
            log::warn!("[worker] {} failed to initialize: {}", device.module_name(), e);
            return false;
        }
        match device.query_device() {
            Ok(desc) => {
                log::info!(
                    "[worker] Active device {} ({} channels)",
                    device.module_name(),
                    desc.channel_count
                );
                self.levels = vec![0; desc.channels()];
                self.active = Some(id);
                true
            }
            Err(e) => {
                log::warn!("[worker] {} has no descriptor: {}", device.module_name(), e);
                device.deinitialize();
                false
            }
        }
    }

    /// Duplex switch; the level buffer follows the new channel count
    fn set_duplex(&mut self, enabled: bool) -> bool {
        let Some(device) = self.active.and_then(|id| self.registry.get_mut(id)) else {
            return false;
        };
        if let Err(e) = device.set_duplex_mode(enabled) {
            log::info!("[worker] Duplex {} rejected: {}", enabled, e);
            return false;
        }
        match device.query_device() {
            Ok(desc) => {
                self.levels = vec![0; desc.channels()];
                true
            }
            Err(_) => false,
        }
    }

    fn release_active(&mut self) {
        if let Some(id) = self.active.take() {
            if let Some(device) = self.registry.get_mut(id) {
                log::info!("[worker] Releasing {}", device.module_name());
                device.deinitialize();
            }
        }
        self.levels.clear();
    }
}

/// Run a worker over this process's stdin/stdout
///
/// A reader thread moves stdin into a pipe so the loop can wait with a
/// timeout. Returns when the host says PLEASE_DIE or closes stdin.
pub fn serve_stdio(registry: DeviceRegistry, poll_interval: Duration) -> io::Result<()> {
    let (mut tx, rx) = pipe();
    thread::Builder::new()
        .name("dimmer-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; 512];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("[worker] stdin read failed: {}", e);
                        break;
                    }
                }
            }
        })?;

    let worker = DeviceWorker::new(registry, rx, io::stdout(), std::process::id(), poll_interval);
    worker
        .run()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

enum WorkerKind {
    Thread(Option<JoinHandle<()>>),
    Process(Child),
}

/// Host-side handle on a running worker
pub struct WorkerHandle {
    kind: WorkerKind,
    worker_id: u32,
}

impl WorkerHandle {
    /// Start a worker as configured and complete the liveness handshake
    ///
    /// `registry` is only used in thread mode; a worker process builds
    /// its own.
    pub fn start(
        config: &DimmerConfig,
        registry: impl FnOnce() -> DeviceRegistry,
    ) -> Result<(WorkerHandle, ControlLink)> {
        let (kind, mut link) = match config.worker.mode {
            WorkerMode::Thread => spawn_thread(registry(), config.worker.poll_interval())?,
            WorkerMode::Process => spawn_process(&config.worker)?,
        };

        let worker_id = match link.handshake() {
            Ok(id) => id,
            Err(e) => {
                log::error!("[worker] Handshake failed: {}", e);
                let mut handle = WorkerHandle { kind, worker_id: 0 };
                drop(link);
                handle.reap(false);
                return Err(DimmerError::Bootstrap(e.to_string()));
            }
        };

        if let WorkerKind::Process(child) = &kind {
            if child.id() != worker_id {
                log::warn!(
                    "[worker] Worker reports pid {} but child is {}",
                    worker_id,
                    child.id()
                );
            }
        }
        log::info!("[worker] Worker {} is alive", worker_id);

        Ok((WorkerHandle { kind, worker_id }, link))
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Process id of a worker process
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            WorkerKind::Process(child) => Some(child.id()),
            WorkerKind::Thread(_) => None,
        }
    }

    /// Ask the worker to exit; kill it if it does not comply
    ///
    /// Returns whether the worker complied.
    pub fn shutdown(mut self, link: &mut ControlLink) -> bool {
        let graceful = match link.call(&Request::PleaseDie) {
            Ok(Response::Compliance) => true,
            Ok(other) => {
                log::warn!("[worker] PLEASE_DIE answered with {:?}", other);
                false
            }
            Err(e) => {
                log::warn!("[worker] PLEASE_DIE failed: {}", e);
                false
            }
        };
        self.reap(graceful);
        graceful
    }

    fn reap(&mut self, graceful: bool) {
        match &mut self.kind {
            WorkerKind::Thread(handle) => {
                let Some(handle) = handle.take() else {
                    return;
                };
                if graceful {
                    if handle.join().is_err() {
                        log::error!("[worker] Worker thread panicked");
                    }
                } else {
                    // A thread cannot be killed; it exits once its link closes
                    log::warn!("[worker] Detaching unresponsive worker thread");
                }
            }
            WorkerKind::Process(child) => {
                if !graceful {
                    log::warn!("[worker] Killing worker process {}", child.id());
                    if let Err(e) = child.kill() {
                        log::warn!("[worker] Kill failed: {}", e);
                    }
                }
                if let Err(e) = child.wait() {
                    log::warn!("[worker] Wait failed: {}", e);
                }
            }
        }
    }
}

fn spawn_thread(
    registry: DeviceRegistry,
    poll_interval: Duration,
) -> Result<(WorkerKind, ControlLink)> {
    let (host_tx, worker_rx) = pipe();
    let (worker_tx, host_rx) = pipe();
    let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);

    let handle = thread::Builder::new()
        .name("dimmer-worker".to_string())
        .spawn(move || {
            let worker = DeviceWorker::new(registry, worker_rx, worker_tx, task_id, poll_interval);
            if let Err(e) = worker.run() {
                log::error!("[worker] Worker {} stopped: {}", task_id, e);
            }
        })
        .map_err(|e| DimmerError::Bootstrap(format!("spawn worker thread: {}", e)))?;

    Ok((
        WorkerKind::Thread(Some(handle)),
        ControlLink::new(Box::new(host_tx), Box::new(host_rx)),
    ))
}

fn spawn_process(config: &WorkerConfig) -> Result<(WorkerKind, ControlLink)> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            DimmerError::Bootstrap(format!("spawn {}: {}", config.program.display(), e))
        })?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(DimmerError::Bootstrap("worker stdio not captured".to_string()));
    };
    log::info!("[worker] Spawned worker process {}", child.id());

    Ok((
        WorkerKind::Process(child),
        ControlLink::new(Box::new(stdin), Box::new(BufReader::new(stdout))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockLog};
    use crate::device::DimmerDevice;
    use crate::link::{PipeReader, PipeWriter};
    use crate::protocol::Tag;
    use crate::types::DeviceDescriptor;
    use std::sync::{Arc, Mutex};

    struct Harness {
        worker: DeviceWorker<PipeReader, PipeWriter>,
        host_tx: PipeWriter,
        host_rx: PipeReader,
        logs: Vec<Arc<Mutex<MockLog>>>,
    }

    impl Harness {
        fn new(devices: Vec<MockDevice>) -> Self {
            let logs = devices.iter().map(|d| d.log.clone()).collect();
            let boxed: Vec<Box<dyn DimmerDevice>> = devices
                .into_iter()
                .map(|d| Box::new(d) as Box<dyn DimmerDevice>)
                .collect();
            let (host_tx, worker_rx) = pipe();
            let (worker_tx, host_rx) = pipe();
            let worker = DeviceWorker::new(
                DeviceRegistry::with_devices(boxed),
                worker_rx,
                worker_tx,
                42,
                Duration::from_millis(1),
            );
            Self {
                worker,
                host_tx,
                host_rx,
                logs,
            }
        }

        /// Send one request, run one loop step, read the reply
        fn exchange(&mut self, request: Request) -> Response {
            request.write_to(&mut self.host_tx).unwrap();
            assert_eq!(self.worker.step().unwrap(), Flow::Continue);
            Response::read_from(&mut self.host_rx, request.tag()).unwrap()
        }

        fn post(&mut self, request: Request) {
            request.write_to(&mut self.host_tx).unwrap();
            self.worker.step().unwrap();
        }
    }

    fn two_devices() -> Vec<MockDevice> {
        let mut absent = MockDevice::new("dongle", 8);
        absent.present = false;
        absent.duplex_capable = false;
        vec![absent, MockDevice::new("bench", 4)]
    }

    #[test]
    fn test_alive_and_module_queries() {
        let mut h = Harness::new(two_devices());
        assert_eq!(h.exchange(Request::AreYouAlive), Response::Alive { worker_id: 42 });
        assert_eq!(h.exchange(Request::QueryDevMods), Response::ModuleCount(2));
        assert_eq!(
            h.exchange(Request::QueryDevModName(1)),
            Response::ModuleName("bench".to_string())
        );
        assert_eq!(h.exchange(Request::QueryDevModName(2)), Response::NonCompliance);
        assert_eq!(h.exchange(Request::DeviceExists(0)), Response::NonCompliance);
        assert_eq!(h.exchange(Request::DeviceExists(1)), Response::Compliance);
        assert_eq!(h.exchange(Request::DeviceExists(9)), Response::NonCompliance);
    }

    #[test]
    fn test_init_and_query_device() {
        let mut h = Harness::new(two_devices());
        assert_eq!(h.exchange(Request::QueryDevice), Response::NonCompliance);
        assert_eq!(h.exchange(Request::InitDevice(1)), Response::Compliance);
        assert_eq!(
            h.exchange(Request::QueryDevice),
            Response::Device(DeviceDescriptor {
                channel_count: 4,
                output_count: 2,
                duplexed: false,
                duplex_capable: true,
            })
        );
        assert_eq!(h.worker.active_device(), Some(1));
        assert_eq!(h.worker.levels(), &[0; 4]);
    }

    #[test]
    fn test_invalid_init_index_has_no_side_effects() {
        let mut h = Harness::new(two_devices());
        assert_eq!(h.exchange(Request::InitDevice(1)), Response::Compliance);

        assert_eq!(h.exchange(Request::InitDevice(7)), Response::NonCompliance);
        assert_eq!(h.worker.active_device(), Some(1));
        let log = h.logs[1].lock().unwrap();
        assert!(log.initialized);
        assert_eq!(log.deinit_calls, 0);
    }

    #[test]
    fn test_switching_devices_deinitializes_previous() {
        let mut devices = two_devices();
        devices[0].present = true;
        let mut h = Harness::new(devices);

        assert_eq!(h.exchange(Request::InitDevice(0)), Response::Compliance);
        assert_eq!(h.exchange(Request::InitDevice(1)), Response::Compliance);
        assert_eq!(h.logs[0].lock().unwrap().deinit_calls, 1);
        assert!(!h.logs[0].lock().unwrap().initialized);
        assert_eq!(h.worker.levels().len(), 4);
    }

    #[test]
    fn test_failed_init_reports_non_compliance() {
        let mut devices = two_devices();
        devices[1].fail_init = true;
        let mut h = Harness::new(devices);

        assert_eq!(h.exchange(Request::InitDevice(1)), Response::NonCompliance);
        assert_eq!(h.worker.active_device(), None);
        assert_eq!(h.logs[1].lock().unwrap().init_calls, 1);
    }

    #[test]
    fn test_set_channel_reaches_device_frame() {
        let mut h = Harness::new(two_devices());
        h.exchange(Request::InitDevice(1));

        h.post(Request::SetChannel { channel: 2, level: 99 });
        // Out of range is ignored
        h.post(Request::SetChannel { channel: 40, level: 1 });

        let log = h.logs[1].lock().unwrap();
        assert_eq!(log.last_frame, vec![0, 0, 99, 0]);
        assert!(log.frames >= 2);
    }

    #[test]
    fn test_duplex_resizes_levels() {
        let mut h = Harness::new(two_devices());
        h.exchange(Request::InitDevice(1));
        h.post(Request::SetChannel { channel: 0, level: 7 });

        assert_eq!(h.exchange(Request::SetDuplex(true)), Response::Compliance);
        assert_eq!(h.worker.levels(), &[0; 8]);
        assert_eq!(h.logs[1].lock().unwrap().duplex_requests, vec![true]);

        assert_eq!(h.exchange(Request::SetDuplex(false)), Response::Compliance);
        assert_eq!(h.worker.levels().len(), 4);
    }

    #[test]
    fn test_duplex_rejected_without_capable_device() {
        let mut devices = two_devices();
        devices[0].present = true;
        let mut h = Harness::new(devices);

        assert_eq!(h.exchange(Request::SetDuplex(true)), Response::NonCompliance);
        h.exchange(Request::InitDevice(0));
        assert_eq!(h.exchange(Request::SetDuplex(true)), Response::NonCompliance);
        assert_eq!(h.worker.levels().len(), 8);
    }

    #[test]
    fn test_deinit_device_releases() {
        let mut h = Harness::new(two_devices());
        h.exchange(Request::InitDevice(1));
        assert_eq!(h.exchange(Request::DeinitDevice), Response::Compliance);
        assert_eq!(h.worker.active_device(), None);
        assert!(h.worker.levels().is_empty());
        assert_eq!(h.logs[1].lock().unwrap().deinit_calls, 1);
    }

    #[test]
    fn test_please_die_complies_and_exits() {
        let mut h = Harness::new(two_devices());
        h.exchange(Request::InitDevice(1));

        Request::PleaseDie.write_to(&mut h.host_tx).unwrap();
        assert_eq!(h.worker.step().unwrap(), Flow::Exit);
        assert_eq!(
            Response::read_from(&mut h.host_rx, Request::PleaseDie.tag()).unwrap(),
            Response::Compliance
        );
        assert!(!h.logs[1].lock().unwrap().initialized);
    }

    #[test]
    fn test_unknown_tag_stops_worker() {
        let mut h = Harness::new(two_devices());
        h.host_tx.write_all(&[0xEE, 1, 2, 3]).unwrap();
        assert!(matches!(h.worker.step(), Err(ProtocolError::UnknownTag(0xEE))));
    }

    #[test]
    fn test_reply_tag_from_host_is_skipped() {
        let mut h = Harness::new(two_devices());
        h.host_tx.write_all(&[Tag::Compliance as u8]).unwrap();
        assert_eq!(h.worker.step().unwrap(), Flow::Continue);
        assert_eq!(h.exchange(Request::QueryDevMods), Response::ModuleCount(2));
    }

    #[test]
    fn test_run_requires_alive_first() {
        let mut h = Harness::new(two_devices());
        Request::QueryDevMods.write_to(&mut h.host_tx).unwrap();
        assert!(matches!(h.worker.run(), Err(ProtocolError::Handshake(_))));
    }

    #[test]
    fn test_run_exits_when_host_goes_away() {
        let mut h = Harness::new(two_devices());
        Request::AreYouAlive.write_to(&mut h.host_tx).unwrap();
        Request::InitDevice(1).write_to(&mut h.host_tx).unwrap();
        let log = h.logs[1].clone();
        drop(h.host_tx);

        assert!(h.worker.run().is_ok());
        assert!(!log.lock().unwrap().initialized);
    }

    #[test]
    fn test_thread_worker_start_and_shutdown() {
        let device = MockDevice::new("bench", 3);
        let log = device.log.clone();
        let config = DimmerConfig::default();

        let devices: Vec<Box<dyn DimmerDevice>> = vec![Box::new(device)];
        let (handle, mut link) =
            WorkerHandle::start(&config, move || DeviceRegistry::with_devices(devices)).unwrap();
        assert!(handle.worker_id() > 0);

        assert_eq!(link.call(&Request::InitDevice(0)).unwrap(), Response::Compliance);
        assert_eq!(handle.pid(), None);
        assert!(handle.shutdown(&mut link));
        assert!(!log.lock().unwrap().initialized);
    }

    #[test]
    fn test_missing_worker_program_is_bootstrap_error() {
        let mut config = DimmerConfig::default();
        config.worker.mode = WorkerMode::Process;
        config.worker.program = "/nonexistent/dimmer-worker".into();

        let result = WorkerHandle::start(&config, DeviceRegistry::default);
        assert!(matches!(result, Err(DimmerError::Bootstrap(_))));
    }
}
