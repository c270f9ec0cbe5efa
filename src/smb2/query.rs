//! SMB2 QUERY_DIRECTORY, QUERY_INFO, and SET_INFO commands.
//! MS-SMB2 Sections 2.2.33-2.2.40

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::header::SMB2_HEADER_SIZE;
use crate::smb2::{check_structure_size, string_to_utf16le, utf16le_to_string};

// QueryInfo info type (SMB2_0_INFO_*)
pub const SMB2_0_INFO_FILE: u8 = 1;
pub const SMB2_0_INFO_FILESYSTEM: u8 = 2;
pub const SMB2_0_INFO_SECURITY: u8 = 3;

// QueryDirectory flags
pub const SL_RESTART_SCAN: u8 = 0x01;
pub const SL_RETURN_SINGLE_ENTRY: u8 = 0x02;
pub const SL_INDEX_SPECIFIED: u8 = 0x04;
pub const SL_REOPEN: u8 = 0x10;

// ---- QUERY_DIRECTORY ----

/// Parsed QUERY_DIRECTORY request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDirectoryRequest {
    pub file_information_class: u8,
    pub flags: u8,
    pub file_index: u32,
    pub file_id: [u8; 16],
    pub file_name_pattern: String,
    pub output_buffer_length: u32,
}

const QUERY_DIRECTORY_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("FileInformationClass", 1),
    codec::scalar("Flags", 1),
    codec::scalar("FileIndex", 4),
    codec::fixed("FileId", 16),
    codec::offset_of("FileNameOffset", "FileName", 2),
    codec::length_of("FileNameLength", "FileName", 2),
    codec::scalar("OutputBufferLength", 4),
    codec::bytes("FileName"),
];

impl WireRecord for QueryDirectoryRequest {
    const SCHEMA: &'static [Field] = QUERY_DIRECTORY_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 33u16)
            .with("FileInformationClass", self.file_information_class)
            .with("Flags", self.flags)
            .with("FileIndex", self.file_index)
            .with("FileId", self.file_id)
            .with("OutputBufferLength", self.output_buffer_length)
            .with("FileName", string_to_utf16le(&self.file_name_pattern))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 33)?;
        let name = v.bytes("FileName")?;
        let file_name_pattern = if name.is_empty() {
            "*".to_string()
        } else {
            utf16le_to_string(name)
        };
        Ok(QueryDirectoryRequest {
            file_information_class: v.u8("FileInformationClass")?,
            flags: v.u8("Flags")?,
            file_index: v.u32("FileIndex")?,
            file_id: v.array("FileId")?,
            file_name_pattern,
            output_buffer_length: v.u32("OutputBufferLength")?,
        })
    }
}

impl QueryDirectoryRequest {
    pub fn restart_scan(&self) -> bool {
        (self.flags & SL_RESTART_SCAN) != 0
    }

    /// No flags at all: the client is continuing an enumeration it has
    /// already been given in full.
    pub fn is_continuation(&self) -> bool {
        self.flags == 0
    }
}

/// QUERY_DIRECTORY and QUERY_INFO responses share one layout: a single
/// output buffer located by offset and length.
/// MS-SMB2 2.2.34, 2.2.38
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResponse {
    pub buffer: Vec<u8>,
}

const QUERY_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::offset_of("OutputBufferOffset", "OutputBuffer", 2),
    codec::length_of("OutputBufferLength", "OutputBuffer", 4),
    codec::bytes("OutputBuffer"),
];

impl WireRecord for QueryResponse {
    const SCHEMA: &'static [Field] = QUERY_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 9u16)
            .with("OutputBuffer", self.buffer.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 9)?;
        Ok(QueryResponse { buffer: v.bytes("OutputBuffer")?.to_vec() })
    }
}

// ---- QUERY_INFO ----

/// Parsed QUERY_INFO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfoRequest {
    pub info_type: u8,
    pub file_info_class: u8,
    pub output_buffer_length: u32,
    pub additional_information: u32,
    pub flags: u32,
    pub file_id: [u8; 16],
    pub input: Vec<u8>,
}

const QUERY_INFO_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("InfoType", 1),
    codec::scalar("FileInfoClass", 1),
    codec::scalar("OutputBufferLength", 4),
    codec::offset_of("InputBufferOffset", "InputBuffer", 2),
    codec::scalar("Reserved", 2),
    codec::length_of("InputBufferLength", "InputBuffer", 4),
    codec::scalar("AdditionalInformation", 4),
    codec::scalar("Flags", 4),
    codec::fixed("FileId", 16),
    codec::bytes("InputBuffer"),
];

impl WireRecord for QueryInfoRequest {
    const SCHEMA: &'static [Field] = QUERY_INFO_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 41u16)
            .with("InfoType", self.info_type)
            .with("FileInfoClass", self.file_info_class)
            .with("OutputBufferLength", self.output_buffer_length)
            .with("AdditionalInformation", self.additional_information)
            .with("Flags", self.flags)
            .with("FileId", self.file_id)
            .with("InputBuffer", self.input.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 41)?;
        Ok(QueryInfoRequest {
            info_type: v.u8("InfoType")?,
            file_info_class: v.u8("FileInfoClass")?,
            output_buffer_length: v.u32("OutputBufferLength")?,
            additional_information: v.u32("AdditionalInformation")?,
            flags: v.u32("Flags")?,
            file_id: v.array("FileId")?,
            input: v.bytes("InputBuffer")?.to_vec(),
        })
    }
}

// ---- SET_INFO ----

/// Parsed SET_INFO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfoRequest {
    pub info_type: u8,
    pub file_info_class: u8,
    pub additional_information: u32,
    pub file_id: [u8; 16],
    pub buffer: Vec<u8>,
}

const SET_INFO_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("InfoType", 1),
    codec::scalar("FileInfoClass", 1),
    codec::length_of("BufferLength", "Buffer", 4),
    codec::offset_of("BufferOffset", "Buffer", 2),
    codec::scalar("Reserved", 2),
    codec::scalar("AdditionalInformation", 4),
    codec::fixed("FileId", 16),
    codec::bytes("Buffer"),
];

impl WireRecord for SetInfoRequest {
    const SCHEMA: &'static [Field] = SET_INFO_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 33u16)
            .with("InfoType", self.info_type)
            .with("FileInfoClass", self.file_info_class)
            .with("AdditionalInformation", self.additional_information)
            .with("FileId", self.file_id)
            .with("Buffer", self.buffer.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 33)?;
        Ok(SetInfoRequest {
            info_type: v.u8("InfoType")?,
            file_info_class: v.u8("FileInfoClass")?,
            additional_information: v.u32("AdditionalInformation")?,
            file_id: v.array("FileId")?,
            buffer: v.bytes("Buffer")?.to_vec(),
        })
    }
}

/// SET_INFO response (StructureSize only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetInfoResponse;

const SET_INFO_RESPONSE: &[Field] = &[codec::scalar("StructureSize", 2)];

impl WireRecord for SetInfoResponse {
    const SCHEMA: &'static [Field] = SET_INFO_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new().with("StructureSize", 2u16)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 2)?;
        Ok(SetInfoResponse)
    }
}
