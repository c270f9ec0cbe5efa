//! Commands acknowledged without touching storage: ECHO, LOGOFF,
//! TREE_DISCONNECT, CANCEL, FLUSH, LOCK and CHANGE_NOTIFY, plus the
//! generic error response.
//! MS-SMB2 Sections 2.2.2, 2.2.7, 2.2.11, 2.2.17, 2.2.26, 2.2.28, 2.2.30, 2.2.35

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::check_structure_size;
use crate::smb2::header::SMB2_HEADER_SIZE;

/// Request whose body is only StructureSize(2) + Reserved(2):
/// ECHO, LOGOFF, TREE_DISCONNECT and CANCEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainRequest;

const PLAIN: &[Field] = &[codec::scalar("StructureSize", 2), codec::scalar("Reserved", 2)];

impl WireRecord for PlainRequest {
    const SCHEMA: &'static [Field] = PLAIN;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new().with("StructureSize", 4u16)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 4)?;
        Ok(PlainRequest)
    }
}

/// Four-byte acknowledgement body shared by the stub commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckResponse;

impl WireRecord for AckResponse {
    const SCHEMA: &'static [Field] = PLAIN;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new().with("StructureSize", 4u16)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 4)?;
        Ok(AckResponse)
    }
}

/// Parsed FLUSH request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub file_id: [u8; 16],
}

const FLUSH_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Reserved1", 2),
    codec::scalar("Reserved2", 4),
    codec::fixed("FileId", 16),
];

impl WireRecord for FlushRequest {
    const SCHEMA: &'static [Field] = FLUSH_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 24u16)
            .with("FileId", self.file_id)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 24)?;
        Ok(FlushRequest { file_id: v.array("FileId")? })
    }
}

/// One SMB2_LOCK_ELEMENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockElement {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

const LOCK_ELEMENT: &[Field] = &[
    codec::scalar("Offset", 8),
    codec::scalar("Length", 8),
    codec::scalar("Flags", 4),
    codec::scalar("Reserved", 4),
];

impl WireRecord for LockElement {
    const SCHEMA: &'static [Field] = LOCK_ELEMENT;

    fn store(&self) -> Values {
        Values::new()
            .with("Offset", self.offset)
            .with("Length", self.length)
            .with("Flags", self.flags)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(LockElement {
            offset: v.u64("Offset")?,
            length: v.u64("Length")?,
            flags: v.u32("Flags")?,
        })
    }
}

/// Parsed LOCK request. Locks are granted without bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub lock_sequence: u32,
    pub file_id: [u8; 16],
    pub locks: Vec<LockElement>,
}

const LOCK_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::count_of("LockCount", "Locks", 2),
    codec::scalar("LockSequence", 4),
    codec::fixed("FileId", 16),
    codec::list("Locks", LOCK_ELEMENT),
];

impl WireRecord for LockRequest {
    const SCHEMA: &'static [Field] = LOCK_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 48u16)
            .with("LockSequence", self.lock_sequence)
            .with("FileId", self.file_id)
            .with("Locks", codec::store_all(&self.locks))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 48)?;
        Ok(LockRequest {
            lock_sequence: v.u32("LockSequence")?,
            file_id: v.array("FileId")?,
            locks: v.records("Locks")?,
        })
    }
}

/// Parsed CHANGE_NOTIFY request. Always answered with STATUS_PENDING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotifyRequest {
    pub flags: u16,
    pub output_buffer_length: u32,
    pub file_id: [u8; 16],
    pub completion_filter: u32,
}

const CHANGE_NOTIFY_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Flags", 2),
    codec::scalar("OutputBufferLength", 4),
    codec::fixed("FileId", 16),
    codec::scalar("CompletionFilter", 4),
    codec::scalar("Reserved", 4),
];

impl WireRecord for ChangeNotifyRequest {
    const SCHEMA: &'static [Field] = CHANGE_NOTIFY_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 32u16)
            .with("Flags", self.flags)
            .with("OutputBufferLength", self.output_buffer_length)
            .with("FileId", self.file_id)
            .with("CompletionFilter", self.completion_filter)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 32)?;
        Ok(ChangeNotifyRequest {
            flags: v.u16("Flags")?,
            output_buffer_length: v.u32("OutputBufferLength")?,
            file_id: v.array("FileId")?,
            completion_filter: v.u32("CompletionFilter")?,
        })
    }
}

/// Build the 9-byte SMB2 error response body (no error data).
/// MS-SMB2 2.2.2
pub fn build_error_response_body() -> Vec<u8> {
    let mut buf = vec![0u8; 9];
    buf[0] = 9; // StructureSize low byte
    // [2] ErrorContextCount = 0
    // [3] Reserved = 0
    // [4..8] ByteCount = 0
    // [8] ErrorData = 0 (1 byte minimum)
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_request_and_ack() {
        let (_, used) = PlainRequest::decode(&[4, 0, 0, 0]).unwrap();
        assert_eq!(used, 4);
        assert!(PlainRequest::decode(&[5, 0, 0, 0]).is_err());

        let buf = AckResponse.encode().unwrap();
        assert_eq!(buf, vec![4, 0, 0, 0]);
    }

    #[test]
    fn test_lock_request_elements() {
        let req = LockRequest {
            lock_sequence: 0,
            file_id: [7; 16],
            locks: vec![
                LockElement { offset: 0, length: 10, flags: 2 },
                LockElement { offset: 10, length: 5, flags: 4 },
            ],
        };
        let buf = req.encode().unwrap();
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 2);
        assert_eq!(buf.len(), 24 + 48);
        let (parsed, _) = LockRequest::decode(&buf).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_error_response_body_size() {
        let body = build_error_response_body();
        assert_eq!(body.len(), 9);
        assert_eq!(u16::from_le_bytes([body[0], body[1]]), 9);
    }
}
