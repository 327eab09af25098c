//! Ingestion engine
//!
//! Pulls frames from every active channel and merges them into the
//! aggregation table, either on a fixed polling interval or in response to
//! the driver's receive callbacks.
//!
//! # Draining
//!
//! Reading a channel always drains it: frames are requested one after the
//! other until the driver stops returning usable frames, and each frame is
//! merged before the next one is requested. Per-channel arrival order is
//! therefore preserved in the table.
//!
//! # Locking
//!
//! The registry lock is only held to copy the list of channels for a tick.
//! The table lock is only held for one merge. No lock is held while the
//! driver is called.
//!
//! # Faults
//!
//! A driver error during a read is fatal for the ingestion. The first one
//! raised by a background context (polling worker, receive callbacks) is
//! published as an `IngestFault` on the channel returned by
//! `IngestionEngine::faults`. The polling worker then exits, receive
//! callbacks are ignored from then on, and `IngestionHandle::stop` returns
//! the error in both modes.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::aggregation::AggregationTable;
use crate::config::{IngestConfig, ReadMode};
use crate::driver::{DriverError, FrameSource, ReceiveCallback};
use crate::registry::{ChannelDescriptor, ChannelRegistry};
use crate::status::Status;
use crate::types::{ChannelHandle, IngestError, Result};

/// A fatal ingestion fault reported to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFault {
    /// Channel being read when the fault occurred
    pub channel: ChannelHandle,
    /// Delivery mode the fault occurred in
    pub mode: ReadMode,
    /// The driver error
    pub error: DriverError,
}

impl IngestFault {
    fn to_error(&self) -> IngestError {
        IngestError::Fatal {
            channel: self.channel,
            source: self.error.clone(),
        }
    }
}

impl fmt::Display for IngestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} mode): {}", self.channel, self.mode, self.error)
    }
}

/// Result of draining one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub channel: ChannelHandle,
    /// Frames merged
    pub frames: usize,
    /// Status of the read that ended the drain
    pub final_status: Status,
}

/// Result of one polling tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Channels drained
    pub channels: usize,
    /// Frames merged across all channels
    pub frames: usize,
}

/// Ingestion counters
///
/// Bus-error and overrun bits never stop ingestion; they are only counted
/// here. A read carrying several conditions increments several counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    frames: AtomicU64,
    empty_reads: AtomicU64,
    bus_error_reads: AtomicU64,
    overrun_reads: AtomicU64,
    queue_overrun_reads: AtomicU64,
    ticks: AtomicU64,
    events: AtomicU64,
}

/// Point-in-time copy of `IngestStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames merged into the table
    pub frames: u64,
    /// Reads that ended a drain without a frame
    pub empty_reads: u64,
    /// Reads flagged with any bus error bit
    pub bus_error_reads: u64,
    /// Reads flagged with OVERRUN
    pub overrun_reads: u64,
    /// Reads flagged with QOVERRUN
    pub queue_overrun_reads: u64,
    /// Polling ticks executed
    pub ticks: u64,
    /// Receive callbacks handled
    pub events: u64,
}

impl IngestStats {
    fn observe(&self, status: Status) {
        if status.has_bus_error() {
            self.bus_error_reads.fetch_add(1, Ordering::Relaxed);
        }
        if status.has_overrun() {
            self.overrun_reads.fetch_add(1, Ordering::Relaxed);
        }
        if status.has_queue_overrun() {
            self.queue_overrun_reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            bus_error_reads: self.bus_error_reads.load(Ordering::Relaxed),
            overrun_reads: self.overrun_reads.load(Ordering::Relaxed),
            queue_overrun_reads: self.queue_overrun_reads.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the engine, its polling worker and its callbacks
struct EngineShared {
    source: Arc<dyn FrameSource>,
    registry: Arc<ChannelRegistry>,
    table: Arc<AggregationTable>,
    timestamps: AtomicBool,
    running: AtomicBool,
    stats: IngestStats,
    fault_tx: Sender<IngestFault>,
    /// First fatal fault of the current run
    fault: Mutex<Option<IngestFault>>,
}

impl EngineShared {
    fn drain(&self, channel: &ChannelDescriptor) -> Result<DrainReport> {
        let want_timestamp = self.timestamps.load(Ordering::Relaxed);
        let mut frames = 0;

        loop {
            let fetched = if channel.is_fd {
                self.source.read_fd(channel.handle, want_timestamp)
            } else {
                self.source.read(channel.handle, want_timestamp)
            }
            .map_err(|source| IngestError::Fatal {
                channel: channel.handle,
                source,
            })?;

            let conditions = fetched.status.conditions();
            if conditions != Status::OK {
                self.stats.observe(conditions);
                log::debug!("Channel {} reported {}", channel.handle, conditions);
            }

            let frame = match fetched.frame {
                Some(frame) if fetched.status.is_read_ok() => frame,
                _ => {
                    self.stats.empty_reads.fetch_add(1, Ordering::Relaxed);
                    return Ok(DrainReport {
                        channel: channel.handle,
                        frames,
                        final_status: fetched.status,
                    });
                }
            };

            let timestamp = if want_timestamp { fetched.timestamp } else { None };
            self.table.merge(frame.identity(), frame, timestamp);
            self.stats.frames.fetch_add(1, Ordering::Relaxed);
            frames += 1;
        }
    }

    fn poll_once(&self) -> Result<TickReport> {
        // Copy taken under the registry lock, released before any read
        let channels = self.registry.active_channels();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let mut report = TickReport {
            channels: channels.len(),
            frames: 0,
        };
        for channel in &channels {
            report.frames += self.drain(channel)?.frames;
        }

        log::trace!(
            "Polling tick: {} channel(s), {} frame(s)",
            report.channels,
            report.frames
        );
        Ok(report)
    }

    fn on_receive_event(&self, handle: ChannelHandle) -> Result<Option<DrainReport>> {
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        match self.registry.find(handle) {
            Some(channel) => self.drain(&channel).map(Some),
            None => {
                log::debug!("Receive event for unregistered channel {} ignored", handle);
                Ok(None)
            }
        }
    }

    fn lock_fault(&self) -> MutexGuard<'_, Option<IngestFault>> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_faulted(&self) -> bool {
        self.lock_fault().is_some()
    }

    /// Record and publish the first fatal fault of the run; later ones are dropped
    fn publish_fault(&self, mode: ReadMode, err: &IngestError) {
        let IngestError::Fatal { channel, source } = err else {
            log::error!("Ingestion error in {} mode: {}", mode, err);
            return;
        };

        let fault = IngestFault {
            channel: *channel,
            mode,
            error: source.clone(),
        };
        {
            let mut stored = self.lock_fault();
            if stored.is_some() {
                log::debug!("Further fault after ingestion stopped: {}", fault);
                return;
            }
            *stored = Some(fault.clone());
        }

        log::error!("Ingestion fault in {} mode: {}", mode, err);
        if self.fault_tx.send(fault).is_err() {
            log::debug!("No fault receiver left");
        }
    }
}

/// Drives frame retrieval from the registered channels into the table
pub struct IngestionEngine {
    shared: Arc<EngineShared>,
    faults: Receiver<IngestFault>,
    config: IngestConfig,
}

impl IngestionEngine {
    /// Create an engine over a frame source, a registry and a table
    ///
    /// # Arguments
    /// * `source` - Driver access used for every read
    /// * `registry` - Connected channels, shared with the user interface
    /// * `table` - Aggregation table, shared with the display layer
    /// * `config` - Read mode, polling interval and timestamp setting
    pub fn new(
        source: Arc<dyn FrameSource>,
        registry: Arc<ChannelRegistry>,
        table: Arc<AggregationTable>,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (fault_tx, faults) = unbounded();

        Ok(Self {
            shared: Arc::new(EngineShared {
                source,
                registry,
                table,
                timestamps: AtomicBool::new(config.timestamps),
                running: AtomicBool::new(false),
                stats: IngestStats::default(),
                fault_tx,
                fault: Mutex::new(None),
            }),
            faults,
            config,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.shared.registry
    }

    pub fn table(&self) -> &Arc<AggregationTable> {
        &self.shared.table
    }

    /// Enable or disable hardware timestamps; applies from the next drain
    pub fn set_timestamps(&self, enabled: bool) {
        self.shared.timestamps.store(enabled, Ordering::Relaxed);
        log::info!("Hardware timestamps {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn timestamps(&self) -> bool {
        self.shared.timestamps.load(Ordering::Relaxed)
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Receiver of fatal faults raised by background ingestion
    pub fn faults(&self) -> Receiver<IngestFault> {
        self.faults.clone()
    }

    /// True while an `IngestionHandle` is live and no fatal fault occurred
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && !self.shared.is_faulted()
    }

    /// True once a fatal fault ended the current run (until the next start)
    pub fn is_faulted(&self) -> bool {
        self.shared.is_faulted()
    }

    /// Drain one channel on the calling thread
    pub fn drain_channel(&self, channel: &ChannelDescriptor) -> Result<DrainReport> {
        self.shared.drain(channel)
    }

    /// Run one polling tick on the calling thread
    pub fn poll_once(&self) -> Result<TickReport> {
        self.shared.poll_once()
    }

    /// Handle a receive notification for `handle` on the calling thread
    ///
    /// # Returns
    /// * `Ok(None)` if the handle is not a registered channel
    pub fn on_receive_event(&self, handle: ChannelHandle) -> Result<Option<DrainReport>> {
        self.shared.on_receive_event(handle)
    }

    /// Start ingestion in the configured mode
    pub fn start(&self) -> Result<IngestionHandle> {
        match self.config.mode {
            ReadMode::Polling => self.start_polling(),
            ReadMode::Event => self.start_events(),
        }
    }

    fn acquire_run(&self) -> Result<()> {
        self.shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IngestError::AlreadyRunning)?;

        *self.shared.lock_fault() = None;
        Ok(())
    }

    /// Spawn the polling worker
    pub fn start_polling(&self) -> Result<IngestionHandle> {
        self.acquire_run()?;

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.config.poll_interval();

        let spawned = thread::Builder::new()
            .name("can-ingest-poll".to_string())
            .spawn(move || polling_worker(shared, interval, shutdown_rx));

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(IngestError::WorkerSpawn(e));
            }
        };

        log::info!(
            "Ingestion started in polling mode ({} ms interval)",
            self.config.poll_interval_ms
        );

        Ok(IngestionHandle {
            shared: Arc::clone(&self.shared),
            mode: ReadMode::Polling,
            worker: Some(worker),
            shutdown: Some(shutdown_tx),
            callback: None,
            watched: Vec::new(),
            stopped: false,
        })
    }

    /// Register a receive callback for every registered channel
    pub fn start_events(&self) -> Result<IngestionHandle> {
        self.acquire_run()?;

        let mut handle = IngestionHandle {
            shared: Arc::clone(&self.shared),
            mode: ReadMode::Event,
            worker: None,
            shutdown: None,
            callback: Some(self.receive_callback()),
            watched: Vec::new(),
            stopped: false,
        };

        // On error `handle` is dropped, which unregisters what was registered
        for channel in self.shared.registry.channels() {
            handle.watch(channel.handle)?;
        }

        log::info!(
            "Ingestion started in event mode ({} channel(s))",
            handle.watched.len()
        );
        Ok(handle)
    }

    fn receive_callback(&self) -> ReceiveCallback {
        // Weak: the driver's callback table must not keep the engine alive
        let shared: Weak<EngineShared> = Arc::downgrade(&self.shared);

        Arc::new(move |channel: ChannelHandle| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.is_faulted() {
                return;
            }
            if let Err(err) = shared.on_receive_event(channel) {
                shared.publish_fault(ReadMode::Event, &err);
            }
        })
    }
}

fn polling_worker(
    shared: Arc<EngineShared>,
    interval: Duration,
    shutdown: Receiver<()>,
) -> Result<()> {
    loop {
        match shutdown.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }

        if let Err(err) = shared.poll_once() {
            shared.publish_fault(ReadMode::Polling, &err);
            return Err(err);
        }

        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("Polling worker exiting");
    Ok(())
}

/// A running ingestion; stops it when dropped
pub struct IngestionHandle {
    shared: Arc<EngineShared>,
    mode: ReadMode,
    worker: Option<JoinHandle<Result<()>>>,
    shutdown: Option<Sender<()>>,
    callback: Option<ReceiveCallback>,
    watched: Vec<ChannelHandle>,
    stopped: bool,
}

impl IngestionHandle {
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Channels with a registered receive callback (event mode)
    pub fn watched_channels(&self) -> &[ChannelHandle] {
        &self.watched
    }

    /// Register the receive callback for a channel connected after start
    ///
    /// Does nothing in polling mode, where the registry is read every tick.
    pub fn watch(&mut self, channel: ChannelHandle) -> Result<()> {
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        if self.watched.contains(&channel) {
            return Ok(());
        }

        self.shared
            .source
            .register_receive_callback(channel, Arc::clone(callback))?;
        self.watched.push(channel);
        log::debug!("Receive callback registered for channel {}", channel);
        Ok(())
    }

    /// Unregister the receive callback of a disconnected channel
    pub fn unwatch(&mut self, channel: ChannelHandle) -> Result<()> {
        let Some(position) = self.watched.iter().position(|c| *c == channel) else {
            return Ok(());
        };

        self.watched.remove(position);
        self.shared.source.unregister_receive_callback(channel)?;
        log::debug!("Receive callback unregistered for channel {}", channel);
        Ok(())
    }

    /// True once the polling worker has exited (always false in event mode)
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(false)
    }

    /// Stop ingestion and wait for the worker
    ///
    /// # Returns
    /// * The first fatal error of the run, in either mode, if any
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Disconnecting the channel wakes the worker out of its wait
        drop(self.shutdown.take());

        let mut result = Ok(());
        if let Some(worker) = self.worker.take() {
            result = worker.join().unwrap_or(Err(IngestError::WorkerPanicked));
        }
        if result.is_ok() {
            if let Some(fault) = self.shared.lock_fault().as_ref() {
                result = Err(fault.to_error());
            }
        }

        for channel in self.watched.drain(..) {
            if let Err(e) = self.shared.source.unregister_receive_callback(channel) {
                log::warn!("Failed to unregister receive callback for {}: {}", channel, e);
            }
        }
        self.callback = None;

        self.shared.running.store(false, Ordering::Release);
        log::info!("Ingestion stopped ({} mode)", self.mode);
        result
    }
}

impl Drop for IngestionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Ingestion ended with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedBus;
    use crate::types::{ClassicFrame, FdFrame, Frame, HwTimestamp, MessageType};

    const USB1: ChannelHandle = ChannelHandle(0x51);
    const USB2: ChannelHandle = ChannelHandle(0x52);

    fn classic(id: u32, payload: &[u8]) -> Frame {
        Frame::from(ClassicFrame::new(id, MessageType::STANDARD, payload))
    }

    fn setup(config: IngestConfig) -> (Arc<SimulatedBus>, IngestionEngine) {
        let bus = Arc::new(SimulatedBus::new());
        let registry = Arc::new(ChannelRegistry::new());
        let table = Arc::new(AggregationTable::new());
        let engine = IngestionEngine::new(bus.clone(), registry, table, config).unwrap();
        (bus, engine)
    }

    #[test]
    fn test_drain_reads_until_empty() {
        let (bus, engine) = setup(IngestConfig::default());
        for i in 0..5u8 {
            bus.push_frame(USB1, classic(0x100, &[i]), None);
        }

        let report = engine.drain_channel(&ChannelDescriptor::classic(USB1)).unwrap();
        assert_eq!(report.frames, 5);
        assert_eq!(report.final_status, Status::QRCVEMPTY);
        assert_eq!(bus.pending(USB1), 0);

        let row = engine.table().get(classic(0x100, &[]).identity()).unwrap();
        assert_eq!(row.count, 5);
        assert_eq!(row.frame, classic(0x100, &[4]));
    }

    #[test]
    fn test_fd_channel_uses_fd_reads() {
        let (bus, engine) = setup(IngestConfig::default());
        let fd = Frame::from(FdFrame::new(0x200, MessageType::FD, 15, &[9; 64]));
        bus.push_frame(USB2, fd, None);

        let report = engine.drain_channel(&ChannelDescriptor::fd(USB2)).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(engine.table().snapshot()[0].length, 64);
    }

    #[test]
    fn test_bus_conditions_do_not_stop_reads() {
        let (bus, engine) = setup(IngestConfig::default());
        bus.push_frame_with_status(USB1, classic(1, &[1]), None, Status::BUSLIGHT);
        bus.push_frame_with_status(USB1, classic(2, &[2]), None, Status::QOVERRUN | Status::OVERRUN);
        bus.push_frame(USB1, classic(3, &[3]), None);

        let report = engine.drain_channel(&ChannelDescriptor::classic(USB1)).unwrap();
        assert_eq!(report.frames, 3);

        let stats = engine.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.bus_error_reads, 1);
        assert_eq!(stats.overrun_reads, 1);
        assert_eq!(stats.queue_overrun_reads, 1);
        assert_eq!(stats.empty_reads, 1);
    }

    #[test]
    fn test_unusable_status_ends_drain() {
        let (bus, engine) = setup(IngestConfig::default());
        bus.push_frame(USB1, classic(1, &[1]), None);
        bus.push_status(USB1, Status::ILLOPERATION);
        bus.push_frame(USB1, classic(2, &[2]), None);

        let report = engine.drain_channel(&ChannelDescriptor::classic(USB1)).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(report.final_status, Status::ILLOPERATION);
        assert_eq!(bus.pending(USB1), 1);
    }

    #[test]
    fn test_timestamps_toggle() {
        let (bus, engine) = setup(IngestConfig::new().with_timestamps(true));
        let frame = classic(0x10, &[1]);
        let ts = HwTimestamp::Classic {
            millis: 5,
            millis_overflow: 0,
            micros: 7,
        };

        bus.push_frame(USB1, frame, Some(ts));
        engine.drain_channel(&ChannelDescriptor::classic(USB1)).unwrap();
        assert_eq!(engine.table().get(frame.identity()).unwrap().timestamp, Some(ts));

        engine.set_timestamps(false);
        bus.push_frame(USB1, frame, Some(ts));
        engine.drain_channel(&ChannelDescriptor::classic(USB1)).unwrap();
        let row = engine.table().get(frame.identity()).unwrap();
        assert_eq!(row.timestamp, None);
        assert_eq!(row.count, 2);
    }

    #[test]
    fn test_poll_once_skips_marker_and_inactive() {
        let (bus, engine) = setup(IngestConfig::default());
        engine.registry().add_all_channels_marker();
        engine.registry().add(ChannelDescriptor::classic(USB1));
        engine.registry().add(ChannelDescriptor::classic(USB2).with_active(false));
        bus.push_frame(USB1, classic(1, &[]), None);
        bus.push_frame(USB2, classic(2, &[]), None);

        let report = engine.poll_once().unwrap();
        assert_eq!(report, TickReport { channels: 1, frames: 1 });
        assert_eq!(bus.reads(ChannelHandle::NONE), 0);
        assert_eq!(bus.pending(USB2), 1);
    }

    #[test]
    fn test_fault_is_returned_not_fatal_to_process() {
        let (bus, engine) = setup(IngestConfig::default());
        engine.registry().add(ChannelDescriptor::classic(USB1));
        bus.push_fault(USB1, "device removed");

        match engine.poll_once() {
            Err(IngestError::Fatal { channel, source }) => {
                assert_eq!(channel, USB1);
                assert!(matches!(source, DriverError::Fault { .. }));
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[test]
    fn test_receive_event_for_unknown_channel() {
        let (_bus, engine) = setup(IngestConfig::default());
        assert_eq!(engine.on_receive_event(USB1).unwrap(), None);
        assert_eq!(engine.stats().events, 1);
    }

    #[test]
    fn test_start_is_exclusive() {
        let (_bus, engine) = setup(IngestConfig::default());
        let handle = engine.start_polling().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start_events(), Err(IngestError::AlreadyRunning)));

        handle.stop().unwrap();
        assert!(!engine.is_running());
        let handle = engine.start_events().unwrap();
        assert_eq!(handle.mode(), ReadMode::Event);
    }
}
