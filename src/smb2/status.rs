//! NT_STATUS codes carried in SMB2 response headers.
//! Reference: [MS-ERREF] Section 2.3

use crate::codec::WireEnum;

/// NT Status codes used by the server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtStatus {
    Success,
    Pending,
    MoreProcessingRequired,
    Unsuccessful,
    NotImplemented,
    InvalidParameter,
    NoSuchFile,
    EndOfFile,
    AccessDenied,
    ObjectNameNotFound,
    ObjectNameCollision,
    LogonFailure,
    NotSupported,
    NetworkNameDeleted,
    DirectoryNotEmpty,
    FileClosed,
    UserSessionDeleted,
    NetworkSessionExpired,
    NoMoreFiles,
    Other(u32),
}

impl NtStatus {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Success => 0x0000_0000,
            Self::Pending => 0x0000_0103,
            Self::MoreProcessingRequired => 0xC000_0016,
            Self::Unsuccessful => 0xC000_0001,
            Self::NotImplemented => 0xC000_0002,
            Self::InvalidParameter => 0xC000_000D,
            Self::NoSuchFile => 0xC000_000F,
            Self::EndOfFile => 0xC000_0011,
            Self::AccessDenied => 0xC000_0022,
            Self::ObjectNameNotFound => 0xC000_0034,
            Self::ObjectNameCollision => 0xC000_0035,
            Self::LogonFailure => 0xC000_006D,
            Self::NotSupported => 0xC000_00BB,
            Self::NetworkNameDeleted => 0xC000_00C9,
            Self::DirectoryNotEmpty => 0xC000_0101,
            Self::FileClosed => 0xC000_0128,
            Self::UserSessionDeleted => 0xC000_0203,
            Self::NetworkSessionExpired => 0xC000_035C,
            Self::NoMoreFiles => 0x8000_0006,
            Self::Other(v) => *v,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0000_0000 => Self::Success,
            0x0000_0103 => Self::Pending,
            0xC000_0016 => Self::MoreProcessingRequired,
            0xC000_0001 => Self::Unsuccessful,
            0xC000_0002 => Self::NotImplemented,
            0xC000_000D => Self::InvalidParameter,
            0xC000_000F => Self::NoSuchFile,
            0xC000_0011 => Self::EndOfFile,
            0xC000_0022 => Self::AccessDenied,
            0xC000_0034 => Self::ObjectNameNotFound,
            0xC000_0035 => Self::ObjectNameCollision,
            0xC000_006D => Self::LogonFailure,
            0xC000_00BB => Self::NotSupported,
            0xC000_00C9 => Self::NetworkNameDeleted,
            0xC000_0101 => Self::DirectoryNotEmpty,
            0xC000_0128 => Self::FileClosed,
            0xC000_0203 => Self::UserSessionDeleted,
            0xC000_035C => Self::NetworkSessionExpired,
            0x8000_0006 => Self::NoMoreFiles,
            v => Self::Other(v),
        }
    }

    pub fn is_error(&self) -> bool {
        (self.as_u32() >> 30) == 3
    }
}

impl WireEnum for NtStatus {
    const WIDTH: usize = 4;

    fn to_wire(self) -> u64 {
        self.as_u32() as u64
    }

    fn from_wire(raw: u64) -> Option<Self> {
        u32::try_from(raw).ok().map(Self::from_u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let codes = [
            NtStatus::Success,
            NtStatus::Pending,
            NtStatus::MoreProcessingRequired,
            NtStatus::NotImplemented,
            NtStatus::FileClosed,
            NtStatus::NetworkSessionExpired,
            NtStatus::NoMoreFiles,
        ];
        for code in &codes {
            assert_eq!(NtStatus::from_u32(code.as_u32()), *code);
        }
        assert_eq!(NtStatus::from_u32(0xC000_0099), NtStatus::Other(0xC000_0099));
    }

    #[test]
    fn test_is_error() {
        assert!(!NtStatus::Success.is_error());
        assert!(!NtStatus::Pending.is_error());
        assert!(NtStatus::LogonFailure.is_error());
        assert!(!NtStatus::NoMoreFiles.is_error());
    }
}
