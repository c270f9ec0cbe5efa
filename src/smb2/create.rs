//! SMB2 CREATE command (open or create a file/directory).
//! MS-SMB2 Section 2.2.13 (Request) and 2.2.14 (Response)

use crate::codec::{self, CodecError, Field, Values, WireEnum, WireRecord};
use crate::smb2::header::SMB2_HEADER_SIZE;
use crate::smb2::{check_structure_size, string_to_utf16le, utf16le_to_string};

crate::wire_enum! {
    /// Create disposition (MS-SMB2 2.2.13)
    pub enum CreateDisposition: u32 {
        Supersede = 0,
        Open = 1,
        Create = 2,
        OpenIf = 3,
        Overwrite = 4,
        OverwriteIf = 5,
    }
}

crate::wire_enum! {
    /// Create action reported in the response (MS-SMB2 2.2.14)
    pub enum CreateAction: u32 {
        Superseded = 0,
        Opened = 1,
        Created = 2,
        Overwritten = 3,
    }
}

impl CreateDisposition {
    /// Action reported back to the client for this disposition.
    pub fn action(self) -> CreateAction {
        match self {
            Self::Supersede => CreateAction::Superseded,
            Self::Open => CreateAction::Opened,
            Self::Create | Self::OpenIf => CreateAction::Created,
            Self::Overwrite | Self::OverwriteIf => CreateAction::Overwritten,
        }
    }
}

// Create options flags
pub const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;

// Desired access flags
pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
pub const FILE_READ_ATTRIBUTES: u32 = 0x0000_0080;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_ALL: u32 = 0x1000_0000;
pub const GENERIC_READ: u32 = 0x8000_0000;

// File attributes
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;

/// Create context tag asking for the maximal access of the caller.
pub const CONTEXT_QUERY_MAXIMAL_ACCESS: &[u8; 4] = b"MxAc";

/// Parsed CREATE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub requested_oplock_level: u8,
    pub impersonation_level: u32,
    pub desired_access: u32,
    pub file_attributes: u32,
    pub share_access: u32,
    /// Raw disposition; validated by the handler.
    pub create_disposition: u32,
    pub create_options: u32,
    pub name: String,
    pub contexts: Vec<CreateContext>,
}

const CREATE_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("SecurityFlags", 1),
    codec::scalar("RequestedOplockLevel", 1),
    codec::scalar("ImpersonationLevel", 4),
    codec::scalar("SmbCreateFlags", 8),
    codec::scalar("Reserved", 8),
    codec::scalar("DesiredAccess", 4),
    codec::scalar("FileAttributes", 4),
    codec::scalar("ShareAccess", 4),
    codec::scalar("CreateDisposition", 4),
    codec::scalar("CreateOptions", 4),
    codec::offset_of("NameOffset", "Name", 2),
    codec::length_of("NameLength", "Name", 2),
    codec::offset_of("CreateContextsOffset", "CreateContexts", 4),
    codec::length_of("CreateContextsLength", "CreateContexts", 4),
    codec::bytes("Name"),
    codec::aligned_bytes("CreateContexts", 8),
];

impl WireRecord for CreateRequest {
    const SCHEMA: &'static [Field] = CREATE_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 57u16)
            .with("RequestedOplockLevel", self.requested_oplock_level)
            .with("ImpersonationLevel", self.impersonation_level)
            .with("DesiredAccess", self.desired_access)
            .with("FileAttributes", self.file_attributes)
            .with("ShareAccess", self.share_access)
            .with("CreateDisposition", self.create_disposition)
            .with("CreateOptions", self.create_options)
            .with("Name", string_to_utf16le(&self.name))
            .with("CreateContexts", encode_create_contexts(&self.contexts))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 57)?;
        Ok(CreateRequest {
            requested_oplock_level: v.u8("RequestedOplockLevel")?,
            impersonation_level: v.u32("ImpersonationLevel")?,
            desired_access: v.u32("DesiredAccess")?,
            file_attributes: v.u32("FileAttributes")?,
            share_access: v.u32("ShareAccess")?,
            create_disposition: v.u32("CreateDisposition")?,
            create_options: v.u32("CreateOptions")?,
            name: utf16le_to_string(v.bytes("Name")?),
            contexts: parse_create_contexts(v.bytes("CreateContexts")?)?,
        })
    }
}

impl CreateRequest {
    pub fn wants_directory(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn wants_write(&self) -> bool {
        self.desired_access & (FILE_WRITE_DATA | GENERIC_ALL | GENERIC_WRITE) != 0
    }

    pub fn context(&self, tag: &[u8]) -> Option<&CreateContext> {
        self.contexts.iter().find(|c| c.name == tag)
    }
}

/// One SMB2_CREATE_CONTEXT (MS-SMB2 2.2.13.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContext {
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

const CREATE_CONTEXT: &[Field] = &[
    codec::scalar("Next", 4),
    codec::offset_of("NameOffset", "Name", 2),
    codec::length_of("NameLength", "Name", 2),
    codec::scalar("Reserved", 2),
    codec::offset_of("DataOffset", "Data", 2),
    codec::length_of("DataLength", "Data", 4),
    codec::bytes("Name"),
    codec::aligned_bytes("Data", 8),
];

impl WireRecord for CreateContext {
    const SCHEMA: &'static [Field] = CREATE_CONTEXT;

    fn store(&self) -> Values {
        Values::new()
            .with("Name", self.name.clone())
            .with("Data", self.data.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(CreateContext {
            name: v.bytes("Name")?.to_vec(),
            data: v.bytes("Data")?.to_vec(),
        })
    }
}

/// Walk a chain of create contexts linked by their `Next` offsets.
pub fn parse_create_contexts(buf: &[u8]) -> Result<Vec<CreateContext>, CodecError> {
    let mut contexts = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (context, _) = CreateContext::decode(&buf[pos..])?;
        contexts.push(context);
        let next = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        if next == 0 {
            break;
        }
        pos += next;
    }
    Ok(contexts)
}

/// Encode contexts on 8-byte boundaries with their `Next` offsets chained.
pub fn encode_create_contexts(contexts: &[CreateContext]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_start = None;
    for context in contexts {
        let Ok(encoded) = context.encode() else { continue };
        let start = out.len().div_ceil(8) * 8;
        out.resize(start, 0);
        if let Some(prev) = last_start {
            let next = (start - prev) as u32;
            out[prev..prev + 4].copy_from_slice(&next.to_le_bytes());
        }
        out.extend_from_slice(&encoded);
        last_start = Some(start);
    }
    out
}

/// Data of the maximal-access create context response (MS-SMB2 2.2.14.2.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaximalAccessResponse {
    pub query_status: u32,
    pub maximal_access: u32,
}

const MAXIMAL_ACCESS_RESPONSE: &[Field] = &[
    codec::scalar("QueryStatus", 4),
    codec::scalar("MaximalAccess", 4),
];

impl WireRecord for MaximalAccessResponse {
    const SCHEMA: &'static [Field] = MAXIMAL_ACCESS_RESPONSE;

    fn store(&self) -> Values {
        Values::new()
            .with("QueryStatus", self.query_status)
            .with("MaximalAccess", self.maximal_access)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(MaximalAccessResponse {
            query_status: v.u32("QueryStatus")?,
            maximal_access: v.u32("MaximalAccess")?,
        })
    }
}

/// CREATE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub oplock_level: u8,
    pub create_action: CreateAction,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: u32,
    pub file_id: [u8; 16],
    pub contexts: Vec<CreateContext>,
}

const CREATE_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("OplockLevel", 1),
    codec::scalar("Flags", 1),
    codec::scalar("CreateAction", 4),
    codec::scalar("CreationTime", 8),
    codec::scalar("LastAccessTime", 8),
    codec::scalar("LastWriteTime", 8),
    codec::scalar("ChangeTime", 8),
    codec::scalar("AllocationSize", 8),
    codec::scalar("EndofFile", 8),
    codec::scalar("FileAttributes", 4),
    codec::scalar("Reserved2", 4),
    codec::fixed("FileId", 16),
    codec::offset_of("CreateContextsOffset", "CreateContexts", 4),
    codec::length_of("CreateContextsLength", "CreateContexts", 4),
    codec::aligned_bytes("CreateContexts", 8),
];

impl WireRecord for CreateResponse {
    const SCHEMA: &'static [Field] = CREATE_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 89u16)
            .with("OplockLevel", self.oplock_level)
            .with("CreateAction", self.create_action.value())
            .with("CreationTime", self.creation_time)
            .with("LastAccessTime", self.last_access_time)
            .with("LastWriteTime", self.last_write_time)
            .with("ChangeTime", self.change_time)
            .with("AllocationSize", self.allocation_size)
            .with("EndofFile", self.end_of_file)
            .with("FileAttributes", self.file_attributes)
            .with("FileId", self.file_id)
            .with("CreateContexts", encode_create_contexts(&self.contexts))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 89)?;
        Ok(CreateResponse {
            oplock_level: v.u8("OplockLevel")?,
            create_action: v.enumeration("CreateAction")?,
            creation_time: v.u64("CreationTime")?,
            last_access_time: v.u64("LastAccessTime")?,
            last_write_time: v.u64("LastWriteTime")?,
            change_time: v.u64("ChangeTime")?,
            allocation_size: v.u64("AllocationSize")?,
            end_of_file: v.u64("EndofFile")?,
            file_attributes: v.u32("FileAttributes")?,
            file_id: v.array("FileId")?,
            contexts: parse_create_contexts(v.bytes("CreateContexts")?)?,
        })
    }
}
