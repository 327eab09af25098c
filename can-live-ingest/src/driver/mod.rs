//! Frame sources (vendor driver, simulated bus)
//!
//! The ingestion engine only talks to the driver through the `FrameSource`
//! trait: fetch the next pending frame of a channel, and register a closure
//! the driver calls when a channel has frames pending.

use std::sync::Arc;

use crate::status::Status;
use crate::types::{ChannelHandle, Frame, HwTimestamp};

pub mod pcan_basic;
mod pcan_ffi; // Raw PCANBasic declarations (private module)
pub mod simulated;

// Re-export source types
pub use pcan_basic::PcanBasic;
pub use simulated::SimulatedBus;

/// Closure invoked by a frame source when a channel has frames pending
pub type ReceiveCallback = Arc<dyn Fn(ChannelHandle) + Send + Sync>;

/// Result type for driver calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Outcome of one read call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    /// Status bitmask returned by the driver
    pub status: Status,
    /// The frame, when the status reports a successful read
    pub frame: Option<Frame>,
    /// Hardware timestamp, when one was requested and a frame was read
    pub timestamp: Option<HwTimestamp>,
}

impl Fetched {
    /// A read that returned a frame
    pub fn frame(status: Status, frame: Frame, timestamp: Option<HwTimestamp>) -> Self {
        Self {
            status,
            frame: Some(frame),
            timestamp,
        }
    }

    /// A read that returned no frame
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            frame: None,
            timestamp: None,
        }
    }
}

/// Failures talking to the driver itself (not bus conditions)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to load driver library {library}: {message}")]
    LibraryLoad { library: String, message: String },

    #[error("Driver library is missing symbol {0}")]
    MissingSymbol(String),

    #[error("Not supported by this driver: {0}")]
    Unsupported(String),

    #[error("Driver fault on channel {channel}: {message}")]
    Fault {
        channel: ChannelHandle,
        message: String,
    },
}

/// Per-channel access to inbound frames
///
/// Implementations must be callable from several threads at once: the
/// polling worker and driver callbacks may read different channels
/// concurrently.
pub trait FrameSource: Send + Sync {
    /// Fetch the next pending classic frame of `channel`
    ///
    /// When `want_timestamp` is false no timestamp receptacle is passed to the
    /// driver and `Fetched::timestamp` is None.
    fn read(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched>;

    /// Fetch the next pending FD frame of `channel`
    fn read_fd(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched>;

    /// Have `callback` invoked with `channel` whenever frames become pending
    ///
    /// Registering again for the same channel replaces the previous callback.
    fn register_receive_callback(
        &self,
        channel: ChannelHandle,
        callback: ReceiveCallback,
    ) -> DriverResult<()>;

    /// Stop invoking the callback registered for `channel`
    fn unregister_receive_callback(&self, channel: ChannelHandle) -> DriverResult<()>;
}
