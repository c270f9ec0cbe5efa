//! SMB2 NEGOTIATE command.
//! MS-SMB2 Section 2.2.3 (Request) and 2.2.4 (Response)

use crate::codec::{self, CodecError, Field, Values, WireEnum, WireRecord};
use crate::smb2::header::SMB2_HEADER_SIZE;
use crate::smb2::{check_structure_size, Dialect};

/// Security mode: signing enabled.
pub const NEGOTIATE_SIGNING_ENABLED: u16 = 0x0001;
/// Security mode: signing required.
pub const NEGOTIATE_SIGNING_REQUIRED: u16 = 0x0002;

/// Capabilities advertised by the server: DFS | LEASING | LARGE_MTU.
pub const SERVER_CAPABILITIES: u32 = 0x0000_0007;

/// Max transact/read/write size advertised by the server.
pub const MAX_IO_SIZE: u32 = 1_048_576;

/// Parsed NEGOTIATE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    pub security_mode: u16,
    pub capabilities: u32,
    pub client_guid: [u8; 16],
    /// Raw dialect codes; unknown revisions are kept so the server can
    /// simply ignore them.
    pub dialects: Vec<u16>,
}

const DIALECT: &[Field] = &[codec::scalar("Dialect", 2)];

const NEGOTIATE_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::count_of("DialectCount", "Dialects", 2),
    codec::scalar("SecurityMode", 2),
    codec::scalar("Reserved", 2),
    codec::scalar("Capabilities", 4),
    codec::fixed("ClientGuid", 16),
    codec::scalar("ClientStartTime", 8),
    codec::list("Dialects", DIALECT),
];

impl WireRecord for NegotiateRequest {
    const SCHEMA: &'static [Field] = NEGOTIATE_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        let dialects = self
            .dialects
            .iter()
            .map(|d| Values::new().with("Dialect", *d))
            .collect::<Vec<_>>();
        Values::new()
            .with("StructureSize", 36u16)
            .with("SecurityMode", self.security_mode)
            .with("Capabilities", self.capabilities)
            .with("ClientGuid", self.client_guid)
            .with("Dialects", dialects)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 36)?;
        let dialects = v
            .list("Dialects")?
            .iter()
            .map(|d| d.u16("Dialect"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NegotiateRequest {
            security_mode: v.u16("SecurityMode")?,
            capabilities: v.u32("Capabilities")?,
            client_guid: v.array("ClientGuid")?,
            dialects,
        })
    }
}

impl NegotiateRequest {
    pub fn offers(&self, dialect: Dialect) -> bool {
        self.dialects.contains(&(dialect.to_wire() as u16))
    }
}

/// NEGOTIATE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    pub security_mode: u16,
    pub dialect: Dialect,
    /// NegotiateContextCount on 3.1.1; set to 1 by the SMB1 bridge reply.
    pub reserved: u16,
    pub server_guid: [u8; 16],
    pub capabilities: u32,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub server_start_time: u64,
    pub security_buffer: Vec<u8>,
}

const NEGOTIATE_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("SecurityMode", 2),
    codec::scalar("DialectRevision", 2),
    codec::scalar("Reserved", 2),
    codec::fixed("ServerGuid", 16),
    codec::scalar("Capabilities", 4),
    codec::scalar("MaxTransactSize", 4),
    codec::scalar("MaxReadSize", 4),
    codec::scalar("MaxWriteSize", 4),
    codec::scalar("SystemTime", 8),
    codec::scalar("ServerStartTime", 8),
    codec::offset_of("SecurityBufferOffset", "Buffer", 2),
    codec::length_of("SecurityBufferLength", "Buffer", 2),
    codec::scalar("Reserved2", 4),
    codec::bytes("Buffer"),
];

impl WireRecord for NegotiateResponse {
    const SCHEMA: &'static [Field] = NEGOTIATE_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 65u16)
            .with("SecurityMode", self.security_mode)
            .with("DialectRevision", self.dialect.value())
            .with("Reserved", self.reserved)
            .with("ServerGuid", self.server_guid)
            .with("Capabilities", self.capabilities)
            .with("MaxTransactSize", self.max_transact_size)
            .with("MaxReadSize", self.max_read_size)
            .with("MaxWriteSize", self.max_write_size)
            .with("SystemTime", self.system_time)
            .with("ServerStartTime", self.server_start_time)
            .with("Buffer", self.security_buffer.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 65)?;
        Ok(NegotiateResponse {
            security_mode: v.u16("SecurityMode")?,
            dialect: v.enumeration("DialectRevision")?,
            reserved: v.u16("Reserved")?,
            server_guid: v.array("ServerGuid")?,
            capabilities: v.u32("Capabilities")?,
            max_transact_size: v.u32("MaxTransactSize")?,
            max_read_size: v.u32("MaxReadSize")?,
            max_write_size: v.u32("MaxWriteSize")?,
            system_time: v.u64("SystemTime")?,
            server_start_time: v.u64("ServerStartTime")?,
            security_buffer: v.bytes("Buffer")?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_negotiate_request() {
        let mut body = vec![0u8; 36];
        body[0] = 36; // StructureSize
        body[2] = 2; // DialectCount
        body[4] = 1; // SecurityMode
        body[12..28].copy_from_slice(&[0x11; 16]);
        body.extend_from_slice(&0x0202u16.to_le_bytes());
        body.extend_from_slice(&0x0210u16.to_le_bytes());

        let (req, used) = NegotiateRequest::decode(&body).unwrap();
        assert_eq!(used, 40);
        assert_eq!(req.dialects, vec![0x0202, 0x0210]);
        assert_eq!(req.client_guid, [0x11; 16]);
        assert!(req.offers(Dialect::Smb210));
        assert!(!req.offers(Dialect::Smb300));
    }

    #[test]
    fn test_negotiate_request_wrong_size() {
        let mut body = vec![0u8; 36];
        body[0] = 24;
        assert!(NegotiateRequest::decode(&body).is_err());
    }

    #[test]
    fn test_negotiate_response_layout() {
        let resp = NegotiateResponse {
            security_mode: NEGOTIATE_SIGNING_ENABLED,
            dialect: Dialect::Smb210,
            reserved: 0,
            server_guid: [0xAB; 16],
            capabilities: SERVER_CAPABILITIES,
            max_transact_size: MAX_IO_SIZE,
            max_read_size: MAX_IO_SIZE,
            max_write_size: MAX_IO_SIZE,
            system_time: 1,
            server_start_time: 0,
            security_buffer: vec![0x60, 0x00],
        };
        let buf = resp.encode().unwrap();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 65);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 0x0210);
        // SecurityBufferOffset = 64 (header) + 64 (fixed body)
        assert_eq!(u16::from_le_bytes([buf[56], buf[57]]), 0x80);
        assert_eq!(u16::from_le_bytes([buf[58], buf[59]]), 2);
        assert_eq!(buf.len(), 66);

        let (decoded, _) = NegotiateResponse::decode(&buf).unwrap();
        assert_eq!(decoded, resp);
    }
}
