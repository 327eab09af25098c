//! In-memory frame source
//!
//! A `SimulatedBus` keeps one FIFO of scripted reads per channel. Frames are
//! pushed by tests or by a traffic generator and returned by `read` /
//! `read_fd` in push order, like the driver's receive queue. Pushing a frame
//! fires the channel's receive callback, as the driver's receive event would.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DriverError, DriverResult, Fetched, FrameSource, ReceiveCallback};
use crate::status::Status;
use crate::types::{ChannelHandle, Frame, HwTimestamp};

/// One scripted read result
#[derive(Debug, Clone)]
enum ScriptedRead {
    /// A frame, read with the given status
    Frame {
        frame: Frame,
        timestamp: Option<HwTimestamp>,
        status: Status,
    },
    /// A read that returns only a status
    Status(Status),
    /// A read that fails at the driver level
    Fault(String),
}

#[derive(Default)]
struct SimChannel {
    queue: VecDeque<ScriptedRead>,
    callback: Option<ReceiveCallback>,
    reads: u64,
}

/// Scriptable in-memory bus
#[derive(Default)]
pub struct SimulatedBus {
    channels: Mutex<HashMap<ChannelHandle, SimChannel>>,
}

impl SimulatedBus {
    /// Create a bus with no pending frames
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelHandle, SimChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame read with status OK and fire the receive callback
    pub fn push_frame(&self, channel: ChannelHandle, frame: Frame, timestamp: Option<HwTimestamp>) {
        self.push_frame_with_status(channel, frame, timestamp, Status::OK);
    }

    /// Queue a frame read with a specific status (e.g. OK | BUSLIGHT)
    pub fn push_frame_with_status(
        &self,
        channel: ChannelHandle,
        frame: Frame,
        timestamp: Option<HwTimestamp>,
        status: Status,
    ) {
        let callback = self.enqueue(
            channel,
            ScriptedRead::Frame {
                frame,
                timestamp,
                status,
            },
        );

        // Fired outside the lock: the callback reads this bus
        if let Some(callback) = callback {
            callback(channel);
        }
    }

    /// Queue a read that returns `status` without a frame
    pub fn push_status(&self, channel: ChannelHandle, status: Status) {
        self.enqueue(channel, ScriptedRead::Status(status));
    }

    /// Queue a read that fails with a driver fault
    pub fn push_fault(&self, channel: ChannelHandle, message: impl Into<String>) {
        self.enqueue(channel, ScriptedRead::Fault(message.into()));
    }

    fn enqueue(&self, channel: ChannelHandle, read: ScriptedRead) -> Option<ReceiveCallback> {
        let mut channels = self.lock();
        let sim = channels.entry(channel).or_default();
        sim.queue.push_back(read);
        sim.callback.clone()
    }

    /// Number of scripted reads still queued on `channel`
    pub fn pending(&self, channel: ChannelHandle) -> usize {
        self.lock().get(&channel).map(|sim| sim.queue.len()).unwrap_or(0)
    }

    /// Number of read calls made on `channel`
    pub fn reads(&self, channel: ChannelHandle) -> u64 {
        self.lock().get(&channel).map(|sim| sim.reads).unwrap_or(0)
    }

    /// True if a receive callback is registered for `channel`
    pub fn has_callback(&self, channel: ChannelHandle) -> bool {
        self.lock()
            .get(&channel)
            .map(|sim| sim.callback.is_some())
            .unwrap_or(false)
    }

    /// Pop the next scripted read if it matches the requested frame kind
    fn next_read(&self, channel: ChannelHandle, want_timestamp: bool, fd: bool) -> DriverResult<Fetched> {
        let mut channels = self.lock();
        let sim = channels.entry(channel).or_default();
        sim.reads += 1;

        let kind_matches = match sim.queue.front() {
            None => return Ok(Fetched::empty(Status::QRCVEMPTY)),
            Some(ScriptedRead::Frame { frame, .. }) => frame.is_fd() == fd,
            Some(_) => true,
        };
        if !kind_matches {
            // Classic read on an FD frame (or the reverse) leaves the queue untouched
            return Ok(Fetched::empty(Status::ILLOPERATION));
        }

        match sim.queue.pop_front() {
            Some(ScriptedRead::Frame {
                frame,
                timestamp,
                status,
            }) => Ok(Fetched::frame(status, frame, timestamp.filter(|_| want_timestamp))),
            Some(ScriptedRead::Status(status)) => Ok(Fetched::empty(status)),
            Some(ScriptedRead::Fault(message)) => Err(DriverError::Fault { channel, message }),
            None => Ok(Fetched::empty(Status::QRCVEMPTY)),
        }
    }
}

impl FrameSource for SimulatedBus {
    fn read(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched> {
        self.next_read(channel, want_timestamp, false)
    }

    fn read_fd(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched> {
        self.next_read(channel, want_timestamp, true)
    }

    fn register_receive_callback(
        &self,
        channel: ChannelHandle,
        callback: ReceiveCallback,
    ) -> DriverResult<()> {
        self.lock().entry(channel).or_default().callback = Some(callback);
        Ok(())
    }

    fn unregister_receive_callback(&self, channel: ChannelHandle) -> DriverResult<()> {
        if let Some(sim) = self.lock().get_mut(&channel) {
            sim.callback = None;
        }
        Ok(())
    }
}
