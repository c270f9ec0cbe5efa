//! SMB2 Packet Header.
//! MS-SMB2 Section 2.2.1

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::status::NtStatus;

/// Size of the SMB2 header in bytes.
pub const SMB2_HEADER_SIZE: usize = 64;

/// SMB2 protocol magic: 0xFE 'S' 'M' 'B'
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// Legacy SMB1 magic: 0xFF 'S' 'M' 'B'
pub const SMB1_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// Flags: response (server to client)
pub const FLAGS_SERVER_TO_REDIR: u32 = 0x0000_0001;

/// Offset of NextCommand within the header.
pub const NEXT_COMMAND_OFFSET: usize = 20;

/// Sync-header reserved value most clients send.
pub const DEFAULT_PROCESS_ID: u32 = 0x0000_feff;

/// Parsed SMB2 header (sync form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: NtStatus,
    pub command: u16,
    pub credits: u16,
    pub flags: u32,
    /// Byte offset to the next compounded command; 0 if none.
    pub next_command: u32,
    pub message_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub session_id: u64,
    /// Present on the wire; never computed or verified.
    pub signature: [u8; 16],
}

const HEADER: &[Field] = &[
    codec::fixed("ProtocolId", 4),
    codec::scalar("StructureSize", 2),
    codec::scalar("CreditCharge", 2),
    codec::scalar("Status", 4),
    codec::scalar("Command", 2),
    codec::scalar("Credits", 2),
    codec::scalar("Flags", 4),
    codec::scalar("NextCommand", 4),
    codec::scalar("MessageId", 8),
    codec::scalar("Reserved", 4),
    codec::scalar("TreeId", 4),
    codec::scalar("SessionId", 8),
    codec::fixed("Signature", 16),
];

impl WireRecord for Smb2Header {
    const SCHEMA: &'static [Field] = HEADER;

    fn store(&self) -> Values {
        Values::new()
            .with("ProtocolId", SMB2_MAGIC)
            .with("StructureSize", SMB2_HEADER_SIZE as u16)
            .with("CreditCharge", self.credit_charge)
            .with("Status", self.status.as_u32())
            .with("Command", self.command)
            .with("Credits", self.credits)
            .with("Flags", self.flags)
            .with("NextCommand", self.next_command)
            .with("MessageId", self.message_id)
            .with("Reserved", self.process_id)
            .with("TreeId", self.tree_id)
            .with("SessionId", self.session_id)
            .with("Signature", self.signature)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        if v.bytes("ProtocolId")? != SMB2_MAGIC {
            return Err(CodecError::Invalid("not an SMB2 header".into()));
        }
        if v.u16("StructureSize")? as usize != SMB2_HEADER_SIZE {
            return Err(CodecError::Invalid("header structure size is not 64".into()));
        }
        Ok(Smb2Header {
            credit_charge: v.u16("CreditCharge")?,
            status: v.enumeration("Status")?,
            command: v.u16("Command")?,
            credits: v.u16("Credits")?,
            flags: v.u32("Flags")?,
            next_command: v.u32("NextCommand")?,
            message_id: v.u64("MessageId")?,
            process_id: v.u32("Reserved")?,
            tree_id: v.u32("TreeId")?,
            session_id: v.u64("SessionId")?,
            signature: v.array("Signature")?,
        })
    }
}

impl Smb2Header {
    /// Header for a client request.
    pub fn request(command: u16, message_id: u64, session_id: u64, tree_id: u32) -> Self {
        Smb2Header {
            credit_charge: 1,
            status: NtStatus::Success,
            command,
            credits: 1,
            flags: 0,
            next_command: 0,
            message_id,
            process_id: DEFAULT_PROCESS_ID,
            tree_id,
            session_id,
            signature: [0; 16],
        }
    }

    /// Create a response header corresponding to a request header.
    pub fn new_response(req: &Smb2Header, status: NtStatus) -> Self {
        Smb2Header {
            status,
            credits: req.credits.max(1),
            flags: FLAGS_SERVER_TO_REDIR,
            next_command: 0,
            signature: [0; 16],
            ..req.clone()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAGS_SERVER_TO_REDIR != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let original = Smb2Header {
            credit_charge: 1,
            status: NtStatus::Success,
            command: 5,
            credits: 128,
            flags: FLAGS_SERVER_TO_REDIR,
            next_command: 0,
            message_id: 42,
            process_id: DEFAULT_PROCESS_ID,
            tree_id: 3,
            session_id: 7,
            signature: [0xAA; 16],
        };

        let buf = original.encode().unwrap();
        assert_eq!(buf.len(), SMB2_HEADER_SIZE);
        assert_eq!(&buf[0..4], &SMB2_MAGIC);

        let (parsed, used) = Smb2Header::decode(&buf).expect("should parse");
        assert_eq!(used, SMB2_HEADER_SIZE);
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_header_too_short() {
        assert!(Smb2Header::decode(&[0; 63]).is_err());
    }

    #[test]
    fn test_header_bad_magic() {
        let mut data = [0u8; 64];
        data[0..4].copy_from_slice(&SMB1_MAGIC);
        data[4] = 64;
        assert!(matches!(Smb2Header::decode(&data), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_new_response_mirrors_request() {
        let req = Smb2Header::request(8, 11, 0x1234, 9);
        let resp = Smb2Header::new_response(&req, NtStatus::EndOfFile);
        assert!(resp.is_response());
        assert_eq!(resp.message_id, 11);
        assert_eq!(resp.session_id, 0x1234);
        assert_eq!(resp.tree_id, 9);
        assert_eq!(resp.status, NtStatus::EndOfFile);
        assert_eq!(resp.process_id, DEFAULT_PROCESS_ID);
    }
}
