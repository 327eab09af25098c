//! Raw declarations of the PCANBasic C API
//!
//! The library is loaded at runtime, so the entry points are declared as
//! function pointer types resolved by name instead of an `extern` block.

use std::os::raw::{c_char, c_void};

pub type TPCANHandle = u16;
pub type TPCANStatus = u32;
pub type TPCANParameter = u8;
pub type TPCANBaudrate = u16;
pub type TPCANType = u8;
pub type TPCANTimestampFD = u64;

/// Classic CAN message buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TPCANMsg {
    pub id: u32,
    pub msg_type: u8,
    pub len: u8,
    pub data: [u8; 8],
}

/// CAN-FD message buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TPCANMsgFD {
    pub id: u32,
    pub msg_type: u8,
    pub dlc: u8,
    pub data: [u8; 64],
}

impl Default for TPCANMsgFD {
    fn default() -> Self {
        Self {
            id: 0,
            msg_type: 0,
            dlc: 0,
            data: [0; 64],
        }
    }
}

/// Receive timestamp of a classic read
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TPCANTimestamp {
    pub millis: u32,
    pub millis_overflow: u16,
    pub micros: u16,
}

/// Parameter id of the receive-event handle/descriptor
pub const PCAN_RECEIVE_EVENT: TPCANParameter = 0x03;

/// Default library file name per platform
#[cfg(target_os = "windows")]
pub const DEFAULT_LIBRARY: &str = "PCANBasic.dll";
#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY: &str = "libPCBUSB.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DEFAULT_LIBRARY: &str = "libpcanbasic.so";

pub type CanReadFn = unsafe extern "system" fn(
    channel: TPCANHandle,
    message: *mut TPCANMsg,
    timestamp: *mut TPCANTimestamp,
) -> TPCANStatus;

pub type CanReadFdFn = unsafe extern "system" fn(
    channel: TPCANHandle,
    message: *mut TPCANMsgFD,
    timestamp: *mut TPCANTimestampFD,
) -> TPCANStatus;

pub type CanGetValueFn = unsafe extern "system" fn(
    channel: TPCANHandle,
    parameter: TPCANParameter,
    buffer: *mut c_void,
    buffer_length: u32,
) -> TPCANStatus;

pub type CanInitializeFn = unsafe extern "system" fn(
    channel: TPCANHandle,
    btr0btr1: TPCANBaudrate,
    hw_type: TPCANType,
    io_port: u32,
    interrupt: u16,
) -> TPCANStatus;

pub type CanInitializeFdFn =
    unsafe extern "system" fn(channel: TPCANHandle, bitrate_fd: *const c_char) -> TPCANStatus;

pub type CanUninitializeFn = unsafe extern "system" fn(channel: TPCANHandle) -> TPCANStatus;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<TPCANMsg>(), 16);
        assert_eq!(size_of::<TPCANMsgFD>(), 72);
        assert_eq!(size_of::<TPCANTimestamp>(), 8);
    }
}
