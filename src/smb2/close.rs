//! SMB2 CLOSE command.
//! MS-SMB2 Section 2.2.15 (Request) and 2.2.16 (Response)

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::check_structure_size;
use crate::smb2::header::SMB2_HEADER_SIZE;

/// Flag: request post-close attribute query.
pub const CLOSE_FLAG_POSTQUERY_ATTRIB: u16 = 0x0001;

/// Parsed CLOSE request.
///
/// The structure size is kept rather than checked here: a wrong size is
/// answered with STATUS_INVALID_PARAMETER by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub structure_size: u16,
    pub flags: u16,
    pub file_id: [u8; 16],
}

const CLOSE_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Flags", 2),
    codec::scalar("Reserved", 4),
    codec::fixed("FileId", 16),
];

impl WireRecord for CloseRequest {
    const SCHEMA: &'static [Field] = CLOSE_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", self.structure_size)
            .with("Flags", self.flags)
            .with("FileId", self.file_id)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(CloseRequest {
            structure_size: v.u16("StructureSize")?,
            flags: v.u16("Flags")?,
            file_id: v.array("FileId")?,
        })
    }
}

impl CloseRequest {
    pub fn new(flags: u16, file_id: [u8; 16]) -> Self {
        CloseRequest { structure_size: 24, flags, file_id }
    }

    /// Whether the client wants file attributes back in the response.
    pub fn wants_post_query(&self) -> bool {
        (self.flags & CLOSE_FLAG_POSTQUERY_ATTRIB) != 0
    }
}

/// CLOSE response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseResponse {
    pub flags: u16,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: u32,
}

const CLOSE_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Flags", 2),
    codec::scalar("Reserved", 4),
    codec::scalar("CreationTime", 8),
    codec::scalar("LastAccessTime", 8),
    codec::scalar("LastWriteTime", 8),
    codec::scalar("ChangeTime", 8),
    codec::scalar("AllocationSize", 8),
    codec::scalar("EndofFile", 8),
    codec::scalar("FileAttributes", 4),
];

impl WireRecord for CloseResponse {
    const SCHEMA: &'static [Field] = CLOSE_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 60u16)
            .with("Flags", self.flags)
            .with("CreationTime", self.creation_time)
            .with("LastAccessTime", self.last_access_time)
            .with("LastWriteTime", self.last_write_time)
            .with("ChangeTime", self.change_time)
            .with("AllocationSize", self.allocation_size)
            .with("EndofFile", self.end_of_file)
            .with("FileAttributes", self.file_attributes)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 60)?;
        Ok(CloseResponse {
            flags: v.u16("Flags")?,
            creation_time: v.u64("CreationTime")?,
            last_access_time: v.u64("LastAccessTime")?,
            last_write_time: v.u64("LastWriteTime")?,
            change_time: v.u64("ChangeTime")?,
            allocation_size: v.u64("AllocationSize")?,
            end_of_file: v.u64("EndofFile")?,
            file_attributes: v.u32("FileAttributes")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_request_parse() {
        let mut data = vec![0u8; 24];
        data[0] = 24;
        data[2] = 0x01; // POSTQUERY
        data[8..24].copy_from_slice(&[0xFF; 16]);
        let (req, _) = CloseRequest::decode(&data).unwrap();
        assert!(req.wants_post_query());
        assert_eq!(req.file_id, [0xFF; 16]);
    }

    #[test]
    fn test_close_response_size() {
        let buf = CloseResponse::default().encode().unwrap();
        assert_eq!(buf.len(), 60);
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 60);
    }
}
