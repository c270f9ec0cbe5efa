//! SMB2 SESSION_SETUP command.
//! MS-SMB2 Section 2.2.5 (Request) and 2.2.6 (Response)

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::check_structure_size;
use crate::smb2::header::SMB2_HEADER_SIZE;

/// Parsed SESSION_SETUP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupRequest {
    pub flags: u8,
    pub security_mode: u8,
    pub capabilities: u32,
    pub previous_session_id: u64,
    pub security_buffer: Vec<u8>,
}

const SESSION_SETUP_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Flags", 1),
    codec::scalar("SecurityMode", 1),
    codec::scalar("Capabilities", 4),
    codec::scalar("Channel", 4),
    codec::offset_of("SecurityBufferOffset", "Buffer", 2),
    codec::length_of("SecurityBufferLength", "Buffer", 2),
    codec::scalar("PreviousSessionId", 8),
    codec::bytes("Buffer"),
];

impl WireRecord for SessionSetupRequest {
    const SCHEMA: &'static [Field] = SESSION_SETUP_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 25u16)
            .with("Flags", self.flags)
            .with("SecurityMode", self.security_mode)
            .with("Capabilities", self.capabilities)
            .with("PreviousSessionId", self.previous_session_id)
            .with("Buffer", self.security_buffer.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 25)?;
        Ok(SessionSetupRequest {
            flags: v.u8("Flags")?,
            security_mode: v.u8("SecurityMode")?,
            capabilities: v.u32("Capabilities")?,
            previous_session_id: v.u64("PreviousSessionId")?,
            security_buffer: v.bytes("Buffer")?.to_vec(),
        })
    }
}

/// SESSION_SETUP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupResponse {
    pub session_flags: u16,
    pub security_buffer: Vec<u8>,
}

const SESSION_SETUP_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("SessionFlags", 2),
    codec::offset_of("SecurityBufferOffset", "Buffer", 2),
    codec::length_of("SecurityBufferLength", "Buffer", 2),
    codec::bytes("Buffer"),
];

impl WireRecord for SessionSetupResponse {
    const SCHEMA: &'static [Field] = SESSION_SETUP_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 9u16)
            .with("SessionFlags", self.session_flags)
            .with("Buffer", self.security_buffer.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 9)?;
        Ok(SessionSetupResponse {
            session_flags: v.u16("SessionFlags")?,
            security_buffer: v.bytes("Buffer")?.to_vec(),
        })
    }
}
