//! SMB2 TREE_CONNECT command.
//! MS-SMB2 Section 2.2.9 (Request) and 2.2.10 (Response)

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::header::SMB2_HEADER_SIZE;
use crate::smb2::{check_structure_size, string_to_utf16le, utf16le_to_string};

pub const SHARE_TYPE_DISK: u8 = 0x01;
pub const SHARE_TYPE_PIPE: u8 = 0x02;

/// SMB2_SHAREFLAG_NO_CACHING
pub const SHARE_FLAG_NO_CACHING: u32 = 0x0000_0030;
/// SMB2_SHAREFLAG_ACCESS_BASED_DIRECTORY_ENUM
pub const SHARE_FLAG_ACCESS_BASED_DIRECTORY_ENUM: u32 = 0x0000_0800;

/// FILE_ALL_ACCESS plus ACCESS_SYSTEM_SECURITY.
pub const ALL_ACCESS_MASK: u32 = 0x011F_01FF;

/// Parsed TREE_CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConnectRequest {
    pub flags: u16,
    /// UNC path, e.g. `\\server\share`.
    pub path: String,
}

const TREE_CONNECT_REQUEST: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("Flags", 2),
    codec::offset_of("PathOffset", "Path", 2),
    codec::length_of("PathLength", "Path", 2),
    codec::bytes("Path"),
];

impl WireRecord for TreeConnectRequest {
    const SCHEMA: &'static [Field] = TREE_CONNECT_REQUEST;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 9u16)
            .with("Flags", self.flags)
            .with("Path", string_to_utf16le(&self.path))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 9)?;
        Ok(TreeConnectRequest {
            flags: v.u16("Flags")?,
            path: utf16le_to_string(v.bytes("Path")?),
        })
    }
}

impl TreeConnectRequest {
    /// Share component of the UNC path.
    pub fn share_name(&self) -> &str {
        self.path.rsplit('\\').next().unwrap_or(&self.path)
    }
}

/// TREE_CONNECT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConnectResponse {
    pub share_type: u8,
    pub share_flags: u32,
    pub capabilities: u32,
    pub maximal_access: u32,
}

const TREE_CONNECT_RESPONSE: &[Field] = &[
    codec::scalar("StructureSize", 2),
    codec::scalar("ShareType", 1),
    codec::scalar("Reserved", 1),
    codec::scalar("ShareFlags", 4),
    codec::scalar("Capabilities", 4),
    codec::scalar("MaximalAccess", 4),
];

impl WireRecord for TreeConnectResponse {
    const SCHEMA: &'static [Field] = TREE_CONNECT_RESPONSE;
    const BASE: usize = SMB2_HEADER_SIZE;

    fn store(&self) -> Values {
        Values::new()
            .with("StructureSize", 16u16)
            .with("ShareType", self.share_type)
            .with("ShareFlags", self.share_flags)
            .with("Capabilities", self.capabilities)
            .with("MaximalAccess", self.maximal_access)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_structure_size(v.u16("StructureSize")?, 16)?;
        Ok(TreeConnectResponse {
            share_type: v.u8("ShareType")?,
            share_flags: v.u32("ShareFlags")?,
            capabilities: v.u32("Capabilities")?,
            maximal_access: v.u32("MaximalAccess")?,
        })
    }
}
