//! SMB2 WRITE command.
//! MS-SMB2 Section 2.2.21 (Request) and 2.2.22 (Response)

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::check_structure_size;
use crate::smb2::header::SMB2_HEADER_SIZE;

/// Parsed WRITE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// DataLength as declared by the client.
    pub length: u32,
    pub offset: u64,
    pub file_id: [u8; 16],
    pub remaining_bytes: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

const WRITE_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::offset_of("DataOffset", "Data", 2),
    codec::length_of("Length", "Data", 4),
    codec::scalar("Offset", 8),
    codec::fixed("FileId", 16),
    codec::scalar("Channel", 4),
    codec::scalar("RemainingBytes", 4),
    codec::scalar("WriteChannelInfoOffset", 2),
    codec::scalar("WriteChannelInfoLength", 2),
    codec::scalar("Flags", 4),
    codec::bytes("Data"),
];

impl WireRecord for WriteRequest {
    const SCHEMA: &'static [Field] = WRITE_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 49u16)
            .with("Offset", self.offset)
            .with("FileId", self.file_id)
            .with("RemainingBytes", self.remaining_bytes)
            .with("Flags", self.flags)
            .with("Data", self.data.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 49)?;
        Ok(WriteRequest {
            length: v.u32("Length")?,
            offset: v.u64("Offset")?,
            file_id: v.array("FileId")?,
            remaining_bytes: v.u32("RemainingBytes")?,
            flags: v.u32("Flags")?,
            data: v.bytes("Data")?.to_vec(),
        })
    }
}

/// WRITE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub count: u32,
}

const WRITE_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Reserved", 2),
    codec::scalar("Count", 4),
    codec::scalar("Remaining", 4),
    codec::scalar("WriteChannelInfoOffset", 2),
    codec::scalar("WriteChannelInfoLength", 2),
];

impl WireRecord for WriteResponse {
    const SCHEMA: &'static [Field] = WRITE_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 17u16)
            .with("Count", self.count)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 17)?;
        Ok(WriteResponse { count: v.u32("Count")? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_data_offset() {
        let req = WriteRequest {
            length: 5,
            offset: 0,
            file_id: [9; 16],
            remaining_bytes: 0,
            flags: 0,
            data: b"hello".to_vec(),
        };
        let buf = req.encode().unwrap();
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x70);
        let (parsed, _) = WriteRequest::decode(&buf).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_write_length_past_buffer_fails() {
        let req = WriteRequest {
            length: 5,
            offset: 0,
            file_id: [9; 16],
            remaining_bytes: 0,
            flags: 0,
            data: b"hello".to_vec(),
        };
        let mut buf = req.encode().unwrap();
        buf[4] = 50;
        assert!(WriteRequest::decode(&buf).is_err());
    }

    #[test]
    fn test_write_response_size() {
        let buf = WriteResponse { count: 5 }.encode().unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 5);
    }
}
