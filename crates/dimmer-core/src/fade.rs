//! Timed fades
//!
//! A fade walks one logical channel from its current raw level to a
//! destination, one step per tick, at a fixed interval of
//! `duration / |destination - start|`. The scheduler thread wakes for the
//! earliest due fade and applies steps through the same pipeline write as
//! a manual channel set.

use crate::error::{DimmerError, Result};
use crate::pipeline::{ChannelPipeline, LevelSink};
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One channel's fade state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeEntry {
    /// Logical channel
    pub channel: usize,
    /// Idle entries stay in the table but are never ticked
    pub active: bool,
    pub destination: u8,
    pub next_fire: Instant,
    pub interval: Duration,
    /// +1 or -1 (0 for an idle entry)
    pub step: i8,
    /// Last step could not be sent
    pub stalled: bool,
}

/// Wait before retrying a step whose send failed
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Fade entries, sorted by channel, at most one per channel
#[derive(Debug, Clone)]
pub struct FadeTable {
    entries: Vec<FadeEntry>,
    retry_interval: Duration,
}

impl Default for FadeTable {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl FadeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum delay before a failed step is attempted again
    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    pub fn get(&self, channel: usize) -> Option<&FadeEntry> {
        self.entries
            .binary_search_by_key(&channel, |e| e.channel)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Start (or replace) the fade of `channel` from `current` to `destination`
    ///
    /// `current == destination` records an idle entry.
    pub fn start(
        &mut self,
        channel: usize,
        current: u8,
        destination: u8,
        seconds: f64,
        now: Instant,
    ) -> Result<()> {
        if seconds.is_nan() || seconds < 0.0 {
            return Err(DimmerError::NegativeDuration(seconds));
        }

        let delta = i16::from(destination) - i16::from(current);
        let interval = if delta == 0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(seconds / f64::from(delta.unsigned_abs())).map_err(
                |e| DimmerError::InvalidArgument(format!("fade duration {}: {}", seconds, e)),
            )?
        };
        let next_fire = now
            .checked_add(interval)
            .ok_or_else(|| DimmerError::InvalidArgument(format!("fade duration {}", seconds)))?;

        let entry = FadeEntry {
            channel,
            active: delta != 0,
            destination,
            next_fire,
            interval,
            step: delta.signum() as i8,
            stalled: false,
        };

        match self.entries.binary_search_by_key(&channel, |e| e.channel) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => {
                self.entries.try_reserve(1)?;
                self.entries.insert(i, entry);
            }
        }
        log::debug!(
            "[fade] ch {} {} -> {} every {:?}",
            channel,
            current,
            destination,
            interval
        );
        Ok(())
    }

    /// Earliest `next_fire` among active entries
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.next_fire)
            .min()
    }

    /// Apply one step to every due entry; returns the number of steps applied
    ///
    /// An entry whose write fails keeps its level and is retried after
    /// `max(interval, retry_interval)`.
    pub fn tick(
        &mut self,
        now: Instant,
        pipeline: &mut ChannelPipeline,
        sink: &mut dyn LevelSink,
    ) -> usize {
        let retry = self.retry_interval;
        let mut applied = 0;
        for entry in self.entries.iter_mut().filter(|e| e.active) {
            if now < entry.next_fire {
                continue;
            }
            let Some(current) = pipeline.raw_level(entry.channel) else {
                entry.active = false;
                continue;
            };

            let next = i16::from(current) + i16::from(entry.step);
            let dest = i16::from(entry.destination);
            let done = if entry.step > 0 { next >= dest } else { next <= dest };
            let level = if done { entry.destination } else { next as u8 };

            match pipeline.write(entry.channel, level, sink) {
                Ok(()) => {
                    applied += 1;
                    if entry.stalled {
                        log::info!("[fade] ch {} resumed", entry.channel);
                        entry.stalled = false;
                    }
                    if done {
                        entry.active = false;
                    } else {
                        entry.next_fire += entry.interval;
                    }
                }
                Err(e) => {
                    if !entry.stalled {
                        log::warn!("[fade] ch {} step failed, retrying: {}", entry.channel, e);
                        entry.stalled = true;
                    }
                    entry.next_fire = now + entry.interval.max(retry);
                }
            }
        }
        applied
    }
}

/// Host-side level state shared by the facade and the fade scheduler
#[derive(Debug, Default)]
pub struct Levels {
    pub pipeline: ChannelPipeline,
    pub fades: FadeTable,
}

enum Signal {
    Wake,
    Stop,
}

/// Background thread that ticks the fade table
///
/// Lock order is levels, then sink. Stopped and joined on drop.
pub struct FadeScheduler {
    signal_tx: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl FadeScheduler {
    pub fn start<S>(
        levels: Arc<Mutex<Levels>>,
        sink: Arc<Mutex<S>>,
        idle_interval: Duration,
    ) -> std::io::Result<Self>
    where
        S: LevelSink + Send + 'static,
    {
        lock(&levels).fades.set_retry_interval(idle_interval);
        let (signal_tx, signal_rx) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("dimmer-fade".to_string())
            .spawn(move || scheduler_loop(levels, sink, signal_rx, idle_interval))?;

        Ok(Self {
            signal_tx,
            handle: Some(handle),
        })
    }

    /// Re-evaluate the next deadline (after a fade was started)
    pub fn wake(&self) {
        let _ = self.signal_tx.send(Signal::Wake);
    }

    pub fn stop(&mut self) {
        let _ = self.signal_tx.send(Signal::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[fade] Scheduler thread panicked");
            }
        }
    }
}

impl Drop for FadeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scheduler_loop<S: LevelSink>(
    levels: Arc<Mutex<Levels>>,
    sink: Arc<Mutex<S>>,
    signal_rx: Receiver<Signal>,
    idle_interval: Duration,
) {
    log::debug!("[fade] Scheduler started");
    loop {
        let wait = {
            let mut guard = lock(&levels);
            let Levels { pipeline, fades } = &mut *guard;
            let now = Instant::now();
            if fades.next_due().is_some_and(|due| due <= now) {
                let mut sink = lock(&sink);
                fades.tick(now, pipeline, &mut *sink);
            }
            fades
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()).min(idle_interval))
                .unwrap_or(idle_interval)
        };

        if wait.is_zero() {
            match signal_rx.try_recv() {
                Ok(Signal::Stop) | Err(TryRecvError::Disconnected) => break,
                Ok(Signal::Wake) | Err(TryRecvError::Empty) => {
                    thread::yield_now();
                    continue;
                }
            }
        }

        match signal_rx.recv_timeout(wait) {
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("[fade] Scheduler stopped");
}
