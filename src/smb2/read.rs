//! SMB2 READ command.
//! MS-SMB2 Section 2.2.19 (Request) and 2.2.20 (Response)

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::check_structure_size;
use crate::smb2::header::SMB2_HEADER_SIZE;

/// Parsed READ request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub flags: u8,
    pub length: u32,
    pub offset: u64,
    pub file_id: [u8; 16],
    pub minimum_count: u32,
    pub remaining_bytes: u32,
}

const READ_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Padding", 1),
    codec::scalar("Flags", 1),
    codec::scalar("Length", 4),
    codec::scalar("Offset", 8),
    codec::fixed("FileId", 16),
    codec::scalar("MinimumCount", 4),
    codec::scalar("Channel", 4),
    codec::scalar("RemainingBytes", 4),
    codec::scalar("ReadChannelInfoOffset", 2),
    codec::scalar("ReadChannelInfoLength", 2),
    codec::bytes("Buffer"),
];

impl WireRecord for ReadRequest {
    const SCHEMA: &'static [Field] = READ_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 49u16)
            .with("Flags", self.flags)
            .with("Length", self.length)
            .with("Offset", self.offset)
            .with("FileId", self.file_id)
            .with("MinimumCount", self.minimum_count)
            .with("RemainingBytes", self.remaining_bytes)
            .with("Buffer", vec![0u8])
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 49)?;
        Ok(ReadRequest {
            flags: v.u8("Flags")?,
            length: v.u32("Length")?,
            offset: v.u64("Offset")?,
            file_id: v.array("FileId")?,
            minimum_count: v.u32("MinimumCount")?,
            remaining_bytes: v.u32("RemainingBytes")?,
        })
    }
}

/// READ response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub data: Vec<u8>,
    pub data_remaining: u32,
}

const READ_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::offset_of("DataOffset", "Data", 1),
    codec::scalar("Reserved", 1),
    codec::length_of("DataLength", "Data", 4),
    codec::scalar("DataRemaining", 4),
    codec::scalar("Reserved2", 4),
    codec::bytes("Data"),
];

impl WireRecord for ReadResponse {
    const SCHEMA: &'static [Field] = READ_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 17u16)
            .with("DataRemaining", self.data_remaining)
            .with("Data", self.data.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 17)?;
        Ok(ReadResponse {
            data: v.bytes("Data")?.to_vec(),
            data_remaining: v.u32("DataRemaining")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_parse() {
        let req = ReadRequest {
            flags: 0,
            length: 4096,
            offset: 512,
            file_id: [3; 16],
            minimum_count: 1,
            remaining_bytes: 0,
        };
        let buf = req.encode().unwrap();
        assert_eq!(buf.len(), 49);
        let (parsed, _) = ReadRequest::decode(&buf).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_read_response_data_offset() {
        let resp = ReadResponse { data: b"hello".to_vec(), data_remaining: 0 };
        let buf = resp.encode().unwrap();
        assert_eq!(buf[2], 0x50);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 5);
        assert_eq!(&buf[16..], b"hello");
    }
}
