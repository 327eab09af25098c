//! Core types for the live CAN ingestion library
//!
//! This module defines the frame model read from the vendor driver, the
//! message identity used by the aggregation table, the hardware timestamp
//! shapes, and the library error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::driver::DriverError;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Maximum payload of a classic CAN frame
pub const CLASSIC_MAX_LEN: usize = 8;

/// Maximum payload of a CAN-FD frame
pub const FD_MAX_LEN: usize = 64;

/// Map a CAN-FD data length code to the number of payload bytes.
///
/// DLC values 0-8 map to themselves, 9-15 follow the non-linear FD table.
/// Only the low nibble is considered.
pub fn length_from_dlc(dlc: u8) -> usize {
    match dlc & 0x0F {
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        15 => 64,
        n => n as usize,
    }
}

/// Handle of a driver channel (the vendor's 16-bit channel identifier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelHandle(pub u16);

/// Vendor bus families and the handle of their channels 1..=8 and 9..=16
const BUS_FAMILIES: &[(&str, u16, Option<u16>, u16)] = &[
    // (prefix, base for 1..=8, base for 9..=16, channel count)
    ("usb", 0x50, Some(0x500), 16),
    ("pci", 0x40, Some(0x400), 16),
    ("lan", 0x800, Some(0x800), 16),
    ("isa", 0x20, None, 8),
    ("dng", 0x30, None, 1),
    ("pcc", 0x60, None, 2),
];

impl ChannelHandle {
    /// The "no bus" handle
    pub const NONE: ChannelHandle = ChannelHandle(0);

    /// Raw handle value as passed to the driver
    pub fn value(self) -> u16 {
        self.0
    }

    /// Vendor name of this handle (e.g. `usb1`), if it is a known channel
    pub fn name(self) -> Option<String> {
        for &(prefix, low_base, high_base, count) in BUS_FAMILIES {
            for index in 1..=count {
                if Self::from_family(low_base, high_base, index) == Some(self) {
                    return Some(format!("{}{}", prefix, index));
                }
            }
        }
        None
    }

    fn from_family(low_base: u16, high_base: Option<u16>, index: u16) -> Option<ChannelHandle> {
        if index == 0 {
            return None;
        }
        if index <= 8 {
            Some(ChannelHandle(low_base + index))
        } else {
            high_base.map(|base| ChannelHandle(base + index))
        }
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:X}h)", name, self.0),
            None => write!(f, "{:X}h", self.0),
        }
    }
}

impl FromStr for ChannelHandle {
    type Err = IngestError;

    /// Parse `usb1`, `pci12`, `lan3`, `0x51` or a decimal handle value
    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim().to_ascii_lowercase();
        let invalid = || IngestError::InvalidChannel(s.to_string());

        if let Some(hex) = text.strip_prefix("0x") {
            return u16::from_str_radix(hex, 16).map(ChannelHandle).map_err(|_| invalid());
        }
        if let Ok(value) = text.parse::<u16>() {
            return Ok(ChannelHandle(value));
        }

        for &(prefix, low_base, high_base, count) in BUS_FAMILIES {
            if let Some(rest) = text.strip_prefix(prefix) {
                let index: u16 = rest.parse().map_err(|_| invalid())?;
                if index > count {
                    return Err(invalid());
                }
                return Self::from_family(low_base, high_base, index).ok_or_else(invalid);
            }
        }

        Err(invalid())
    }
}

/// Raw message type flags as reported by the driver
///
/// The value is kept as the raw byte: message identity is computed from it
/// verbatim, including bits this library does not name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const STANDARD: MessageType = MessageType(0x00);
    pub const RTR: MessageType = MessageType(0x01);
    pub const EXTENDED: MessageType = MessageType(0x02);
    pub const FD: MessageType = MessageType(0x04);
    pub const BRS: MessageType = MessageType(0x08);
    pub const ESI: MessageType = MessageType(0x10);
    pub const ECHO: MessageType = MessageType(0x20);
    pub const ERRFRAME: MessageType = MessageType(0x40);
    pub const STATUS: MessageType = MessageType(0x80);

    /// Raw flag byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `flag` is set (never true for `STANDARD`)
    pub fn contains(self, flag: MessageType) -> bool {
        flag.0 != 0 && self.0 & flag.0 == flag.0
    }

    pub fn is_extended(self) -> bool {
        self.contains(Self::EXTENDED)
    }

    pub fn is_rtr(self) -> bool {
        self.contains(Self::RTR)
    }
}

impl std::ops::BitOr for MessageType {
    type Output = MessageType;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageType(self.0 | rhs.0)
    }
}

/// A classic CAN frame (up to 8 data bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Raw type flags
    pub msg_type: MessageType,
    /// Data length as reported by the driver
    pub len: u8,
    /// Data buffer; only the first `length()` bytes are meaningful
    pub data: [u8; CLASSIC_MAX_LEN],
}

impl ClassicFrame {
    /// Build a frame from a payload slice (truncated to 8 bytes)
    pub fn new(id: u32, msg_type: MessageType, payload: &[u8]) -> Self {
        let len = payload.len().min(CLASSIC_MAX_LEN);
        let mut data = [0u8; CLASSIC_MAX_LEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            msg_type,
            len: len as u8,
            data,
        }
    }

    /// Number of payload bytes (lengths above 8 are clamped)
    pub fn length(&self) -> usize {
        (self.len as usize).min(CLASSIC_MAX_LEN)
    }
}

/// A CAN-FD frame (up to 64 data bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Raw type flags
    pub msg_type: MessageType,
    /// Data length code (0-15)
    pub dlc: u8,
    /// Data buffer; only the first `length()` bytes are meaningful
    pub data: [u8; FD_MAX_LEN],
}

impl FdFrame {
    /// Build a frame from a DLC and a payload slice
    ///
    /// Copies at most `length_from_dlc(dlc)` bytes; missing bytes stay zero.
    pub fn new(id: u32, msg_type: MessageType, dlc: u8, payload: &[u8]) -> Self {
        let mut data = [0u8; FD_MAX_LEN];
        let len = payload.len().min(length_from_dlc(dlc));
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            msg_type,
            dlc: dlc & 0x0F,
            data,
        }
    }

    /// Number of payload bytes according to the DLC table
    pub fn length(&self) -> usize {
        length_from_dlc(self.dlc)
    }
}

/// One frame as read from the driver, classic or FD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Classic(ClassicFrame),
    Fd(FdFrame),
}

impl Frame {
    pub fn id(&self) -> u32 {
        match self {
            Frame::Classic(frame) => frame.id,
            Frame::Fd(frame) => frame.id,
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Frame::Classic(frame) => frame.msg_type,
            Frame::Fd(frame) => frame.msg_type,
        }
    }

    /// Payload length in bytes
    pub fn length(&self) -> usize {
        match self {
            Frame::Classic(frame) => frame.length(),
            Frame::Fd(frame) => frame.length(),
        }
    }

    /// Meaningful payload bytes
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Classic(frame) => &frame.data[..frame.length()],
            Frame::Fd(frame) => &frame.data[..frame.length()],
        }
    }

    pub fn is_fd(&self) -> bool {
        matches!(self, Frame::Fd(_))
    }

    /// Aggregation key of this frame
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::new(self.id(), self.msg_type())
    }

    /// Human readable type label (`STD`, `EXT/RTR`, `STD [ FD BRS ]`, ...)
    ///
    /// FD sub-flags are only decoded for FD frames. Flags the label does not
    /// account for are appended as the raw byte, e.g. `STD (20h)`.
    pub fn type_label(&self) -> String {
        let raw = self.msg_type().bits();
        let mut handled: u8 = 0;

        let mut label = if raw & MessageType::EXTENDED.0 != 0 {
            handled |= MessageType::EXTENDED.0;
            String::from("EXT")
        } else if raw & MessageType::STATUS.0 != 0 {
            handled |= MessageType::STATUS.0;
            String::from("STATUS")
        } else if raw & MessageType::ERRFRAME.0 != 0 {
            handled |= MessageType::ERRFRAME.0;
            String::from("ERROR")
        } else {
            String::from("STD")
        };

        if raw & MessageType::RTR.0 != 0 {
            label.push_str("/RTR");
            handled |= MessageType::RTR.0;
        }

        if self.is_fd() && raw & MessageType::FD.0 != 0 {
            label.push_str(" [ FD");
            handled |= MessageType::FD.0;
            if raw & MessageType::BRS.0 != 0 {
                label.push_str(" BRS");
                handled |= MessageType::BRS.0;
            }
            if raw & MessageType::ESI.0 != 0 {
                label.push_str(" ESI");
                handled |= MessageType::ESI.0;
            }
            label.push_str(" ]");
        }

        if handled != raw {
            label.push_str(&format!(" ({:02X}h)", raw));
        }

        label
    }
}

impl From<ClassicFrame> for Frame {
    fn from(frame: ClassicFrame) -> Self {
        Frame::Classic(frame)
    }
}

impl From<FdFrame> for Frame {
    fn from(frame: FdFrame) -> Self {
        Frame::Fd(frame)
    }
}

/// Aggregation key: `(type_flags << 32) | id`
///
/// Classic and FD frames sharing both ID and raw type byte map to the same
/// key. This is the source behaviour and is kept as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageIdentity(pub u64);

impl MessageIdentity {
    pub fn new(id: u32, msg_type: MessageType) -> Self {
        MessageIdentity(((msg_type.bits() as u64) << 32) | id as u64)
    }

    pub fn id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn msg_type(self) -> MessageType {
        MessageType((self.0 >> 32) as u8)
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010X}", self.0)
    }
}

/// Hardware receive timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwTimestamp {
    /// Timestamp attached to a classic read
    Classic {
        millis: u32,
        millis_overflow: u16,
        micros: u16,
    },
    /// Raw microsecond tick attached to an FD read
    Fd(u64),
}

impl HwTimestamp {
    /// Timestamp in microseconds
    pub fn total_micros(&self) -> u64 {
        match *self {
            HwTimestamp::Classic {
                millis,
                millis_overflow,
                micros,
            } => {
                micros as u64
                    + 1000 * millis as u64
                    + 0x1_0000_0000u64 * 1000 * millis_overflow as u64
            }
            HwTimestamp::Fd(value) => value,
        }
    }
}

impl fmt::Display for HwTimestamp {
    /// `millis.micros` for classic timestamps (no padding), raw tick for FD
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwTimestamp::Classic { millis, micros, .. } => write!(f, "{}.{}", millis, micros),
            HwTimestamp::Fd(value) => write!(f, "{}", value),
        }
    }
}

/// Errors raised by the ingestion library
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Fatal ingestion fault on channel {channel}: {source}")]
    Fatal {
        channel: ChannelHandle,
        #[source]
        source: DriverError,
    },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Ingestion is already running")]
    AlreadyRunning,

    #[error("Ingestion worker panicked")]
    WorkerPanicked,

    #[error("Failed to spawn ingestion worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_from_dlc_table() {
        let expected = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];
        for (dlc, len) in expected.iter().enumerate() {
            assert_eq!(length_from_dlc(dlc as u8), *len, "dlc {}", dlc);
        }
        assert_eq!(length_from_dlc(9), 12);
        assert_eq!(length_from_dlc(15), 64);
        assert_eq!(length_from_dlc(5), 5);
    }

    #[test]
    fn test_identity_layout() {
        let identity = MessageIdentity::new(0x100, MessageType::EXTENDED);
        assert_eq!(identity.0, 0x0000_0002_0000_0100);
        assert_eq!(identity.id(), 0x100);
        assert_eq!(identity.msg_type(), MessageType::EXTENDED);

        // Classic and FD frames sharing id and flags collide
        let classic = Frame::from(ClassicFrame::new(0x7FF, MessageType::STANDARD, &[1]));
        let fd = Frame::from(FdFrame::new(0x7FF, MessageType::STANDARD, 9, &[2; 12]));
        assert_eq!(classic.identity(), fd.identity());
    }

    #[test]
    fn test_classic_frame_payload() {
        let frame = ClassicFrame::new(0x123, MessageType::STANDARD, &[1, 2, 3]);
        assert_eq!(frame.length(), 3);
        assert_eq!(Frame::from(frame).payload(), &[1, 2, 3]);

        let mut oversize = frame;
        oversize.len = 12;
        assert_eq!(oversize.length(), 8);
    }

    #[test]
    fn test_fd_frame_payload() {
        let payload: Vec<u8> = (0..20).collect();
        let frame = Frame::from(FdFrame::new(0x10, MessageType::FD, 11, &payload));
        assert_eq!(frame.length(), 20);
        assert_eq!(frame.payload(), payload.as_slice());
    }

    #[test]
    fn test_type_labels() {
        let std = Frame::from(ClassicFrame::new(1, MessageType::STANDARD, &[]));
        assert_eq!(std.type_label(), "STD");

        let ext_rtr = Frame::from(ClassicFrame::new(1, MessageType::EXTENDED | MessageType::RTR, &[]));
        assert_eq!(ext_rtr.type_label(), "EXT/RTR");

        let status = Frame::from(ClassicFrame::new(1, MessageType::STATUS, &[]));
        assert_eq!(status.type_label(), "STATUS");

        let error = Frame::from(ClassicFrame::new(1, MessageType::ERRFRAME, &[]));
        assert_eq!(error.type_label(), "ERROR");

        let fd = Frame::from(FdFrame::new(
            1,
            MessageType::EXTENDED | MessageType::FD | MessageType::BRS,
            8,
            &[],
        ));
        assert_eq!(fd.type_label(), "EXT [ FD BRS ]");

        // FD flags are not decoded on classic frames
        let odd = Frame::from(ClassicFrame::new(1, MessageType::FD, &[]));
        assert_eq!(odd.type_label(), "STD (04h)");

        let echo = Frame::from(ClassicFrame::new(1, MessageType::ECHO, &[]));
        assert_eq!(echo.type_label(), "STD (20h)");
    }

    #[test]
    fn test_timestamp_formatting() {
        let classic = HwTimestamp::Classic {
            millis: 1234,
            millis_overflow: 0,
            micros: 5,
        };
        assert_eq!(classic.to_string(), "1234.5");
        assert_eq!(classic.total_micros(), 1_234_005);

        let wrapped = HwTimestamp::Classic {
            millis: 0,
            millis_overflow: 1,
            micros: 0,
        };
        assert_eq!(wrapped.total_micros(), 0x1_0000_0000 * 1000);

        assert_eq!(HwTimestamp::Fd(987_654).to_string(), "987654");
    }

    #[test]
    fn test_channel_handle_parsing() {
        assert_eq!("usb1".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x51));
        assert_eq!("USB8".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x58));
        assert_eq!("usb9".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x509));
        assert_eq!("pci2".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x42));
        assert_eq!("lan1".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x801));
        assert_eq!("lan16".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x810));
        assert_eq!("0x51".parse::<ChannelHandle>().unwrap(), ChannelHandle(0x51));
        assert_eq!("81".parse::<ChannelHandle>().unwrap(), ChannelHandle(81));

        assert!("usb0".parse::<ChannelHandle>().is_err());
        assert!("isa9".parse::<ChannelHandle>().is_err());
        assert!("can1".parse::<ChannelHandle>().is_err());
    }

    #[test]
    fn test_channel_handle_display() {
        assert_eq!(ChannelHandle(0x51).to_string(), "usb1 (51h)");
        assert_eq!(ChannelHandle(0x510).to_string(), "usb16 (510h)");
        assert_eq!(ChannelHandle(0x1234).to_string(), "1234h");
    }
}
