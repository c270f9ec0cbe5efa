//! SMB2 wire records: header, per-command bodies, and status codes.
//!
//! Every body is declared as a codec schema relative to the end of the
//! 64-byte header, so offsets written on the wire are header-relative.
//! Reference: [MS-SMB2] Server Message Block Protocol Versions 2 and 3

pub mod header;
pub mod status;
pub mod negotiate;
pub mod session;
pub mod tree;
pub mod create;
pub mod close;
pub mod read;
pub mod write;
pub mod query;
pub mod info;
pub mod ack;

use crate::codec::CodecError;

crate::wire_enum! {
    /// SMB2 command codes.
    /// MS-SMB2 Section 2.2.1
    pub enum Smb2Command: u16 {
        Negotiate = 0,
        SessionSetup = 1,
        Logoff = 2,
        TreeConnect = 3,
        TreeDisconnect = 4,
        Create = 5,
        Close = 6,
        Flush = 7,
        Read = 8,
        Write = 9,
        Lock = 10,
        Ioctl = 11,
        Cancel = 12,
        Echo = 13,
        QueryDirectory = 14,
        ChangeNotify = 15,
        QueryInfo = 16,
        SetInfo = 17,
        OplockBreak = 18,
    }
}

impl Smb2Command {
    pub fn from_u16(v: u16) -> Option<Self> {
        <Self as crate::codec::WireEnum>::from_wire(v as u64)
    }

    pub fn code(self) -> u16 {
        <Self as crate::codec::WireEnum>::to_wire(self) as u16
    }
}

crate::wire_enum! {
    /// Dialect revisions.
    /// MS-SMB2 Section 2.2.3
    pub enum Dialect: u16 {
        Smb202 = 0x0202,
        Smb210 = 0x0210,
        Smb300 = 0x0300,
        Smb302 = 0x0302,
        Smb311 = 0x0311,
        /// Multi-protocol wildcard sent in reply to an SMB1 negotiate.
        Wildcard = 0x02FF,
    }
}

/// SMB2 body structures declare their fixed size plus one when a variable
/// buffer follows.
pub fn check_structure_size(actual: u16, expected: u16) -> Result<(), CodecError> {
    if actual != expected {
        return Err(CodecError::Invalid(format!(
            "structure size {} (expected {})",
            actual, expected
        )));
    }
    Ok(())
}

/// Decode a UTF-16LE byte slice into a Rust String.
pub fn utf16le_to_string(data: &[u8]) -> String {
    let u16s: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&u16s).trim_end_matches('\0').to_string()
}

/// Strict UTF-16LE decode; fails on odd lengths and unpaired surrogates.
pub fn utf16le_to_string_strict(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let u16s: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&u16s).ok()
}

/// Encode a Rust string as UTF-16LE bytes.
pub fn string_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Smb2Command::from_u16(5), Some(Smb2Command::Create));
        assert_eq!(Smb2Command::from_u16(18), Some(Smb2Command::OplockBreak));
        assert_eq!(Smb2Command::from_u16(19), None);
        assert_eq!(Smb2Command::SetInfo.code(), 17);
    }

    #[test]
    fn test_utf16_roundtrip() {
        let bytes = string_to_utf16le("IPC$");
        assert_eq!(bytes, b"I\0P\0C\0$\0");
        assert_eq!(utf16le_to_string(&bytes), "IPC$");
        assert_eq!(utf16le_to_string_strict(&bytes[..3]), None);
        assert_eq!(utf16le_to_string_strict(&[0x00, 0xd8]), None);
    }
}
