//! Driver status codes
//!
//! Every read call returns a status bitmask. Bus-error and overrun bits may
//! accompany a successfully read frame, so whether a read produced a frame is
//! decided on the status with those bits masked out.

use std::fmt;

/// Status bitmask returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0x0000_0000);
    pub const XMTFULL: Status = Status(0x0000_0001);
    pub const OVERRUN: Status = Status(0x0000_0002);
    pub const BUSLIGHT: Status = Status(0x0000_0004);
    pub const BUSHEAVY: Status = Status(0x0000_0008);
    pub const BUSWARNING: Status = Status::BUSHEAVY;
    pub const BUSPASSIVE: Status = Status(0x0004_0000);
    pub const BUSOFF: Status = Status(0x0000_0010);
    pub const ANYBUSERR: Status = Status(
        Status::BUSWARNING.0 | Status::BUSLIGHT.0 | Status::BUSHEAVY.0 | Status::BUSOFF.0 | Status::BUSPASSIVE.0,
    );
    pub const QRCVEMPTY: Status = Status(0x0000_0020);
    pub const QOVERRUN: Status = Status(0x0000_0040);
    pub const QXMTFULL: Status = Status(0x0000_0080);
    pub const REGTEST: Status = Status(0x0000_0100);
    pub const NODRIVER: Status = Status(0x0000_0200);
    pub const HWINUSE: Status = Status(0x0000_0400);
    pub const NETINUSE: Status = Status(0x0000_0800);
    pub const ILLHW: Status = Status(0x0000_1400);
    pub const ILLNET: Status = Status(0x0000_1800);
    pub const ILLCLIENT: Status = Status(0x0000_1C00);
    pub const RESOURCE: Status = Status(0x0000_2000);
    pub const ILLPARAMTYPE: Status = Status(0x0000_4000);
    pub const ILLPARAMVAL: Status = Status(0x0000_8000);
    pub const UNKNOWN: Status = Status(0x0001_0000);
    pub const ILLDATA: Status = Status(0x0002_0000);
    pub const ILLMODE: Status = Status(0x0008_0000);
    pub const CAUTION: Status = Status(0x0200_0000);
    pub const INITIALIZE: Status = Status(0x0400_0000);
    pub const ILLOPERATION: Status = Status(0x0800_0000);

    /// Bits that may accompany a successful read
    pub const READ_CONDITIONS: Status =
        Status(Status::ANYBUSERR.0 | Status::OVERRUN.0 | Status::QOVERRUN.0);

    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if any bit of `other` is set in `self`
    pub fn intersects(self, other: Status) -> bool {
        self.0 & other.0 != 0
    }

    /// True if the read that returned this status produced a frame
    pub fn is_read_ok(self) -> bool {
        self.0 & !Self::READ_CONDITIONS.0 == Self::OK.0
    }

    /// The bus-error/overrun bits carried by this status
    pub fn conditions(self) -> Status {
        Status(self.0 & Self::READ_CONDITIONS.0)
    }

    pub fn has_bus_error(self) -> bool {
        self.intersects(Self::ANYBUSERR)
    }

    pub fn has_overrun(self) -> bool {
        self.intersects(Self::OVERRUN)
    }

    pub fn has_queue_overrun(self) -> bool {
        self.intersects(Self::QOVERRUN)
    }
}

impl std::ops::BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Self) -> Self::Output {
        Status(self.0 | rhs.0)
    }
}

/// Names of the single-bit flags, in display order
const FLAG_NAMES: &[(Status, &str)] = &[
    (Status::XMTFULL, "XMTFULL"),
    (Status::OVERRUN, "OVERRUN"),
    (Status::BUSLIGHT, "BUSLIGHT"),
    (Status::BUSHEAVY, "BUSHEAVY"),
    (Status::BUSOFF, "BUSOFF"),
    (Status::QRCVEMPTY, "QRCVEMPTY"),
    (Status::QOVERRUN, "QOVERRUN"),
    (Status::QXMTFULL, "QXMTFULL"),
    (Status::REGTEST, "REGTEST"),
    (Status::NODRIVER, "NODRIVER"),
    (Status::RESOURCE, "RESOURCE"),
    (Status::ILLPARAMTYPE, "ILLPARAMTYPE"),
    (Status::ILLPARAMVAL, "ILLPARAMVAL"),
    (Status::UNKNOWN, "UNKNOWN"),
    (Status::ILLDATA, "ILLDATA"),
    (Status::BUSPASSIVE, "BUSPASSIVE"),
    (Status::ILLMODE, "ILLMODE"),
    (Status::CAUTION, "CAUTION"),
    (Status::INITIALIZE, "INITIALIZE"),
    (Status::ILLOPERATION, "ILLOPERATION"),
];

/// Handle-range codes share bits (0x1400, 0x1800, 0x1C00 overlap HWINUSE/NETINUSE)
const HANDLE_CODES: &[(Status, &str)] = &[
    (Status::ILLCLIENT, "ILLCLIENT"),
    (Status::ILLNET, "ILLNET"),
    (Status::ILLHW, "ILLHW"),
    (Status::NETINUSE, "NETINUSE"),
    (Status::HWINUSE, "HWINUSE"),
];

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "OK");
        }

        let mut names: Vec<String> = Vec::new();
        let mut remaining = self.0;

        let handle_bits = self.0 & Status::ILLCLIENT.0;
        if let Some((code, name)) = HANDLE_CODES.iter().find(|(code, _)| code.0 == handle_bits) {
            names.push(name.to_string());
            remaining &= !code.0;
        }

        for (flag, name) in FLAG_NAMES {
            if remaining & flag.0 != 0 {
                names.push(name.to_string());
                remaining &= !flag.0;
            }
        }

        if remaining != 0 {
            names.push(format!("{:#X}", remaining));
        }

        write!(f, "{}", names.join("|"))
    }
}
