//! PCANBasic frame source
//!
//! Loads the PEAK PCANBasic library at runtime with `libloading` and exposes
//! its read calls through `FrameSource`.
//!
//! Receive notifications use the driver's receive event. On Unix the driver
//! hands out a file descriptor that becomes readable while frames are
//! pending; one watcher thread per registered channel waits on it and invokes
//! the callback. Other platforms report receive callbacks as unsupported.

use libloading::Library;
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::pcan_ffi::*;
use super::{DriverError, DriverResult, Fetched, FrameSource, ReceiveCallback};
use crate::status::Status;
use crate::types::{ChannelHandle, ClassicFrame, FdFrame, Frame, HwTimestamp, MessageType};

/// Resolved entry points of the library
struct Api {
    read: CanReadFn,
    read_fd: CanReadFdFn,
    get_value: CanGetValueFn,
    initialize: CanInitializeFn,
    initialize_fd: CanInitializeFdFn,
    uninitialize: CanUninitializeFn,
}

impl Api {
    /// Resolve every entry point used by this crate
    ///
    /// # Safety
    /// The returned function pointers are only valid while `library` is loaded.
    unsafe fn resolve(library: &Library) -> DriverResult<Self> {
        Ok(Self {
            read: symbol(library, b"CAN_Read\0")?,
            read_fd: symbol(library, b"CAN_ReadFD\0")?,
            get_value: symbol(library, b"CAN_GetValue\0")?,
            initialize: symbol(library, b"CAN_Initialize\0")?,
            initialize_fd: symbol(library, b"CAN_InitializeFD\0")?,
            uninitialize: symbol(library, b"CAN_Uninitialize\0")?,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> DriverResult<T> {
    library.get::<T>(name).map(|sym| *sym).map_err(|_| {
        let printable = name.strip_suffix(b"\0").unwrap_or(name);
        DriverError::MissingSymbol(String::from_utf8_lossy(printable).into_owned())
    })
}

/// PCANBasic library handle
pub struct PcanBasic {
    library_name: String,
    api: Api,
    watchers: Mutex<HashMap<ChannelHandle, ReceiveWatcher>>,
    // Declared last: dropped after the watchers are stopped
    _library: Library,
}

impl PcanBasic {
    /// Load the library under its platform default name
    pub fn load() -> DriverResult<Self> {
        Self::load_from(DEFAULT_LIBRARY)
    }

    /// Load the library from an explicit file name or path
    pub fn load_from(path: impl AsRef<OsStr>) -> DriverResult<Self> {
        let path = path.as_ref();
        let library_name = path.to_string_lossy().into_owned();
        log::info!("Loading PCANBasic library: {}", library_name);

        let library = unsafe { Library::new(path) }.map_err(|e| DriverError::LibraryLoad {
            library: library_name.clone(),
            message: e.to_string(),
        })?;

        // The pointers stay valid because `_library` lives as long as `api`
        let api = unsafe { Api::resolve(&library)? };

        log::info!("PCANBasic library loaded: {}", library_name);
        Ok(Self {
            library_name,
            api,
            watchers: Mutex::new(HashMap::new()),
            _library: library,
        })
    }

    /// Name or path the library was loaded from
    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    /// Open a classic channel with a BTR0/BTR1 bit timing value
    pub fn initialize(&self, channel: ChannelHandle, btr0btr1: u16) -> DriverResult<()> {
        let status = Status(unsafe { (self.api.initialize)(channel.value(), btr0btr1, 0, 0, 0) });
        check(channel, "CAN_Initialize", status)?;
        log::info!("Channel {} initialized (BTR0BTR1 {:04X}h)", channel, btr0btr1);
        Ok(())
    }

    /// Open an FD channel with a bitrate string
    /// (e.g. `f_clock_mhz=20, nom_brp=5, nom_tseg1=2, ...`)
    pub fn initialize_fd(&self, channel: ChannelHandle, bitrate: &str) -> DriverResult<()> {
        let bitrate = CString::new(bitrate).map_err(|e| DriverError::Fault {
            channel,
            message: format!("invalid FD bitrate string: {}", e),
        })?;
        let status = Status(unsafe { (self.api.initialize_fd)(channel.value(), bitrate.as_ptr()) });
        check(channel, "CAN_InitializeFD", status)?;
        log::info!("Channel {} initialized in FD mode", channel);
        Ok(())
    }

    /// Close a channel
    pub fn uninitialize(&self, channel: ChannelHandle) -> DriverResult<()> {
        let watcher = self.lock_watchers().remove(&channel);
        drop(watcher);
        let status = Status(unsafe { (self.api.uninitialize)(channel.value()) });
        check(channel, "CAN_Uninitialize", status)?;
        log::info!("Channel {} uninitialized", channel);
        Ok(())
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<ChannelHandle, ReceiveWatcher>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(unix)]
    fn receive_event_descriptor(&self, channel: ChannelHandle) -> DriverResult<libc::c_int> {
        let mut descriptor: libc::c_int = -1;
        let status = Status(unsafe {
            (self.api.get_value)(
                channel.value(),
                PCAN_RECEIVE_EVENT,
                &mut descriptor as *mut libc::c_int as *mut std::os::raw::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            )
        });
        check(channel, "CAN_GetValue(PCAN_RECEIVE_EVENT)", status)?;
        if descriptor < 0 {
            return Err(DriverError::Fault {
                channel,
                message: "driver returned no receive event descriptor".to_string(),
            });
        }
        Ok(descriptor)
    }
}

fn check(channel: ChannelHandle, call: &str, status: Status) -> DriverResult<()> {
    if status == Status::OK {
        Ok(())
    } else {
        Err(DriverError::Fault {
            channel,
            message: format!("{} failed: {}", call, status),
        })
    }
}

impl FrameSource for PcanBasic {
    fn read(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched> {
        let mut message = TPCANMsg::default();
        let mut raw_timestamp = TPCANTimestamp::default();
        let timestamp_ptr = if want_timestamp {
            &mut raw_timestamp as *mut TPCANTimestamp
        } else {
            ptr::null_mut()
        };

        let status = Status(unsafe { (self.api.read)(channel.value(), &mut message, timestamp_ptr) });
        if !status.is_read_ok() {
            return Ok(Fetched::empty(status));
        }

        let frame = Frame::Classic(ClassicFrame {
            id: message.id,
            msg_type: MessageType(message.msg_type),
            len: message.len,
            data: message.data,
        });
        let timestamp = want_timestamp.then(|| HwTimestamp::Classic {
            millis: raw_timestamp.millis,
            millis_overflow: raw_timestamp.millis_overflow,
            micros: raw_timestamp.micros,
        });

        Ok(Fetched::frame(status, frame, timestamp))
    }

    fn read_fd(&self, channel: ChannelHandle, want_timestamp: bool) -> DriverResult<Fetched> {
        let mut message = TPCANMsgFD::default();
        let mut raw_timestamp: TPCANTimestampFD = 0;
        let timestamp_ptr = if want_timestamp {
            &mut raw_timestamp as *mut TPCANTimestampFD
        } else {
            ptr::null_mut()
        };

        let status = Status(unsafe { (self.api.read_fd)(channel.value(), &mut message, timestamp_ptr) });
        if !status.is_read_ok() {
            return Ok(Fetched::empty(status));
        }

        let frame = Frame::Fd(FdFrame {
            id: message.id,
            msg_type: MessageType(message.msg_type),
            dlc: message.dlc & 0x0F,
            data: message.data,
        });
        let timestamp = want_timestamp.then_some(HwTimestamp::Fd(raw_timestamp));

        Ok(Fetched::frame(status, frame, timestamp))
    }

    #[cfg(unix)]
    fn register_receive_callback(
        &self,
        channel: ChannelHandle,
        callback: ReceiveCallback,
    ) -> DriverResult<()> {
        let descriptor = self.receive_event_descriptor(channel)?;
        let watcher = ReceiveWatcher::spawn(channel, descriptor, callback)?;

        // A replaced watcher is stopped once the lock is released
        let previous = self.lock_watchers().insert(channel, watcher);
        drop(previous);

        log::debug!("Receive event watcher started for channel {}", channel);
        Ok(())
    }

    #[cfg(not(unix))]
    fn register_receive_callback(
        &self,
        channel: ChannelHandle,
        _callback: ReceiveCallback,
    ) -> DriverResult<()> {
        Err(DriverError::Unsupported(format!(
            "receive events for channel {} on this platform",
            channel
        )))
    }

    fn unregister_receive_callback(&self, channel: ChannelHandle) -> DriverResult<()> {
        let removed = self.lock_watchers().remove(&channel);
        if removed.is_some() {
            log::debug!("Receive event watcher stopped for channel {}", channel);
        }
        drop(removed);
        Ok(())
    }
}

impl Drop for PcanBasic {
    fn drop(&mut self) {
        let watchers: Vec<_> = self.lock_watchers().drain().collect();
        drop(watchers);
        log::debug!("PCANBasic library released: {}", self.library_name);
    }
}

/// Poll timeout of the receive event watcher, bounds how long a stop waits
#[cfg(unix)]
const WATCH_TIMEOUT_MS: libc::c_int = 100;

/// Thread waiting on one channel's receive event
struct ReceiveWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReceiveWatcher {
    #[cfg(unix)]
    fn spawn(
        channel: ChannelHandle,
        descriptor: libc::c_int,
        callback: ReceiveCallback,
    ) -> DriverResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name(format!("pcan-rx-{:x}", channel.value()))
            .spawn(move || watch_descriptor(channel, descriptor, &flag, &callback))
            .map_err(|e| DriverError::Fault {
                channel,
                message: format!("cannot spawn receive watcher: {}", e),
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for ReceiveWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Receive event watcher panicked");
            }
        }
    }
}

#[cfg(unix)]
fn watch_descriptor(
    channel: ChannelHandle,
    descriptor: libc::c_int,
    stop: &AtomicBool,
    callback: &ReceiveCallback,
) {
    while !stop.load(Ordering::Acquire) {
        let mut pollfd = libc::pollfd {
            fd: descriptor,
            events: libc::POLLIN,
            revents: 0,
        };

        let ready = unsafe { libc::poll(&mut pollfd, 1, WATCH_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Waiting for receive event on channel {} failed: {}", channel, err);
            break;
        }

        if ready == 0 {
            continue;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            // The next read reports the failure to the engine
            log::error!(
                "Receive event descriptor of channel {} failed (revents {:#x})",
                channel,
                pollfd.revents
            );
            callback(channel);
            break;
        }
        if pollfd.revents & libc::POLLIN != 0 {
            callback(channel);
        }
    }
}
