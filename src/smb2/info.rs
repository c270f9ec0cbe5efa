//! File and filesystem information structures carried in QUERY_DIRECTORY,
//! QUERY_INFO and SET_INFO buffers.
//! Reference: [MS-FSCC] File System Control Codes, Sections 2.4 and 2.5

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::{string_to_utf16le, utf16le_to_string};

// File information classes (MS-FSCC 2.4)
pub const FILE_BASIC_INFORMATION: u8 = 4;
pub const FILE_RENAME_INFORMATION: u8 = 10;
pub const FILE_DISPOSITION_INFORMATION: u8 = 13;
pub const FILE_ALL_INFORMATION: u8 = 18;
pub const FILE_STREAM_INFORMATION: u8 = 22;
pub const FILE_ID_BOTH_DIRECTORY_INFORMATION: u8 = 37;

// Filesystem information classes (MS-FSCC 2.5)
pub const FILE_FS_SIZE_INFORMATION: u8 = 3;
pub const FILE_FS_ATTRIBUTE_INFORMATION: u8 = 5;

/// EaSize reported for directories and empty files.
pub const PLACEHOLDER_EA_SIZE: u32 = 0x1111_1111;

/// Case-sensitive search, case-preserved names, unicode on disk,
/// persistent ACLs.
pub const FS_ATTRIBUTES: u32 = 0x0000_000F;

/// Chain variable-length entries: each entry but the last is padded to
/// `align` and its NextEntryOffset (first four bytes) set to the padded
/// length.
fn chain(entries: Vec<Vec<u8>>, align: usize) -> Vec<u8> {
    let count = entries.len();
    let mut out = Vec::new();
    for (i, mut entry) in entries.into_iter().enumerate() {
        if i + 1 < count {
            let padded = entry.len().div_ceil(align) * align;
            entry.resize(padded, 0);
            entry[..4].copy_from_slice(&(padded as u32).to_le_bytes());
        }
        out.extend_from_slice(&entry);
    }
    out
}

/// Walk a NextEntryOffset chain.
fn unchain<T: WireRecord>(buf: &[u8]) -> Result<Vec<T>, CodecError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (entry, _) = T::decode(&buf[pos..])?;
        out.push(entry);
        let next = u32::from_le_bytes(
            buf[pos..pos + 4]
                .try_into()
                .map_err(|_| CodecError::Invalid("entry shorter than its offset".into()))?,
        ) as usize;
        if next == 0 {
            break;
        }
        pos += next;
    }
    Ok(out)
}

// ---- FileIdBothDirectoryInformation ----

/// One directory entry. MS-FSCC 2.4.17
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIdBothDirInfo {
    pub file_index: u32,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub end_of_file: u64,
    pub allocation_size: u64,
    pub file_attributes: u32,
    pub ea_size: u32,
    pub file_id: u64,
    pub file_name: String,
}

const FILE_ID_BOTH_DIR_INFO: &[Field] = &[
    codec::scalar("NextEntryOffset", 4),
    codec::scalar("FileIndex", 4),
    codec::scalar("CreationTime", 8),
    codec::scalar("LastAccessTime", 8),
    codec::scalar("LastWriteTime", 8),
    codec::scalar("ChangeTime", 8),
    codec::scalar("EndOfFile", 8),
    codec::scalar("AllocationSize", 8),
    codec::scalar("FileAttributes", 4),
    codec::length_of("FileNameLength", "FileName", 4),
    codec::scalar("EaSize", 4),
    codec::scalar("ShortNameLength", 1),
    codec::scalar("Reserved1", 1),
    codec::fixed("ShortName", 24),
    codec::scalar("Reserved2", 2),
    codec::scalar("FileId", 8),
    codec::bytes("FileName"),
];

impl WireRecord for FileIdBothDirInfo {
    const SCHEMA: &'static [Field] = FILE_ID_BOTH_DIR_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("FileIndex", self.file_index)
            .with("CreationTime", self.creation_time)
            .with("LastAccessTime", self.last_access_time)
            .with("LastWriteTime", self.last_write_time)
            .with("ChangeTime", self.change_time)
            .with("EndOfFile", self.end_of_file)
            .with("AllocationSize", self.allocation_size)
            .with("FileAttributes", self.file_attributes)
            .with("EaSize", self.ea_size)
            .with("FileId", self.file_id)
            .with("FileName", string_to_utf16le(&self.file_name))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FileIdBothDirInfo {
            file_index: v.u32("FileIndex")?,
            creation_time: v.u64("CreationTime")?,
            last_access_time: v.u64("LastAccessTime")?,
            last_write_time: v.u64("LastWriteTime")?,
            change_time: v.u64("ChangeTime")?,
            end_of_file: v.u64("EndOfFile")?,
            allocation_size: v.u64("AllocationSize")?,
            file_attributes: v.u32("FileAttributes")?,
            ea_size: v.u32("EaSize")?,
            file_id: v.u64("FileId")?,
            file_name: utf16le_to_string(v.bytes("FileName")?),
        })
    }
}

/// Serialize directory entries into one chained buffer, 8-byte aligned.
pub fn encode_directory_entries(entries: &[FileIdBothDirInfo]) -> Result<Vec<u8>, CodecError> {
    let encoded = entries.iter().map(WireRecord::encode).collect::<Result<Vec<_>, _>>()?;
    Ok(chain(encoded, 8))
}

pub fn decode_directory_entries(buf: &[u8]) -> Result<Vec<FileIdBothDirInfo>, CodecError> {
    unchain(buf)
}

// ---- FileAllInformation ----

/// MS-FSCC 2.4.2: basic, standard, internal, EA, access, position, mode,
/// alignment and name information back to back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAllInfo {
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub file_attributes: u32,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub number_of_links: u32,
    pub delete_pending: bool,
    pub is_directory: bool,
    pub file_id: u64,
    pub ea_size: u32,
    pub access_mask: u32,
    pub file_name: String,
}

const FILE_ALL_INFO: &[Field] = &[
    codec::scalar("CreationTime", 8),
    codec::scalar("LastAccessTime", 8),
    codec::scalar("LastWriteTime", 8),
    codec::scalar("ChangeTime", 8),
    codec::scalar("FileAttributes", 4),
    codec::scalar("Reserved", 4),
    codec::scalar("AllocationSize", 8),
    codec::scalar("EndOfFile", 8),
    codec::scalar("NumberOfLinks", 4),
    codec::scalar("DeletePending", 1),
    codec::scalar("Directory", 1),
    codec::scalar("Reserved2", 2),
    codec::scalar("IndexNumber", 8),
    codec::scalar("EaSize", 4),
    codec::scalar("AccessFlags", 4),
    codec::scalar("CurrentByteOffset", 8),
    codec::scalar("Mode", 4),
    codec::scalar("AlignmentRequirement", 4),
    codec::length_of("FileNameLength", "FileName", 4),
    codec::bytes("FileName"),
];

impl WireRecord for FileAllInfo {
    const SCHEMA: &'static [Field] = FILE_ALL_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("CreationTime", self.creation_time)
            .with("LastAccessTime", self.last_access_time)
            .with("LastWriteTime", self.last_write_time)
            .with("ChangeTime", self.change_time)
            .with("FileAttributes", self.file_attributes)
            .with("AllocationSize", self.allocation_size)
            .with("EndOfFile", self.end_of_file)
            .with("NumberOfLinks", self.number_of_links)
            .with("DeletePending", self.delete_pending as u8)
            .with("Directory", self.is_directory as u8)
            .with("IndexNumber", self.file_id)
            .with("EaSize", self.ea_size)
            .with("AccessFlags", self.access_mask)
            .with("FileName", string_to_utf16le(&self.file_name))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FileAllInfo {
            creation_time: v.u64("CreationTime")?,
            last_access_time: v.u64("LastAccessTime")?,
            last_write_time: v.u64("LastWriteTime")?,
            change_time: v.u64("ChangeTime")?,
            file_attributes: v.u32("FileAttributes")?,
            allocation_size: v.u64("AllocationSize")?,
            end_of_file: v.u64("EndOfFile")?,
            number_of_links: v.u32("NumberOfLinks")?,
            delete_pending: v.u8("DeletePending")? != 0,
            is_directory: v.u8("Directory")? != 0,
            file_id: v.u64("IndexNumber")?,
            ea_size: v.u32("EaSize")?,
            access_mask: v.u32("AccessFlags")?,
            file_name: utf16le_to_string(v.bytes("FileName")?),
        })
    }
}

// ---- FileStreamInformation ----

/// One named stream. MS-FSCC 2.4.43
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub size: u64,
    pub allocation_size: u64,
}

const STREAM_INFO: &[Field] = &[
    codec::scalar("NextEntryOffset", 4),
    codec::length_of("StreamNameLength", "StreamName", 4),
    codec::scalar("StreamSize", 8),
    codec::scalar("StreamAllocationSize", 8),
    codec::bytes("StreamName"),
];

impl WireRecord for StreamInfo {
    const SCHEMA: &'static [Field] = STREAM_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("StreamSize", self.size)
            .with("StreamAllocationSize", self.allocation_size)
            .with("StreamName", string_to_utf16le(&self.name))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(StreamInfo {
            name: utf16le_to_string(v.bytes("StreamName")?),
            size: v.u64("StreamSize")?,
            allocation_size: v.u64("StreamAllocationSize")?,
        })
    }
}

/// Serialize stream entries into one chained buffer, 4-byte aligned.
pub fn encode_stream_entries(entries: &[StreamInfo]) -> Result<Vec<u8>, CodecError> {
    let encoded = entries.iter().map(WireRecord::encode).collect::<Result<Vec<_>, _>>()?;
    Ok(chain(encoded, 4))
}

pub fn decode_stream_entries(buf: &[u8]) -> Result<Vec<StreamInfo>, CodecError> {
    unchain(buf)
}

// ---- Filesystem information ----

/// FileFsAttributeInformation. MS-FSCC 2.5.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsAttributeInfo {
    pub attributes: u32,
    pub max_name_length: u32,
    pub file_system_name: String,
}

const FS_ATTRIBUTE_INFO: &[Field] = &[
    codec::scalar("FileSystemAttributes", 4),
    codec::scalar("MaximumComponentNameLength", 4),
    codec::length_of("FileSystemNameLength", "FileSystemName", 4),
    codec::bytes("FileSystemName"),
];

impl WireRecord for FsAttributeInfo {
    const SCHEMA: &'static [Field] = FS_ATTRIBUTE_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("FileSystemAttributes", self.attributes)
            .with("MaximumComponentNameLength", self.max_name_length)
            .with("FileSystemName", string_to_utf16le(&self.file_system_name))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FsAttributeInfo {
            attributes: v.u32("FileSystemAttributes")?,
            max_name_length: v.u32("MaximumComponentNameLength")?,
            file_system_name: utf16le_to_string(v.bytes("FileSystemName")?),
        })
    }
}

impl Default for FsAttributeInfo {
    fn default() -> Self {
        FsAttributeInfo {
            attributes: FS_ATTRIBUTES,
            max_name_length: 255,
            file_system_name: "NTFS".to_string(),
        }
    }
}

/// FileFsSizeInformation. MS-FSCC 2.5.8
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSizeInfo {
    pub total_allocation_units: u64,
    pub available_allocation_units: u64,
    pub sectors_per_allocation_unit: u32,
    pub bytes_per_sector: u32,
}

const FS_SIZE_INFO: &[Field] = &[
    codec::scalar("TotalAllocationUnits", 8),
    codec::scalar("AvailableAllocationUnits", 8),
    codec::scalar("SectorsPerAllocationUnit", 4),
    codec::scalar("BytesPerSector", 4),
];

impl WireRecord for FsSizeInfo {
    const SCHEMA: &'static [Field] = FS_SIZE_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("TotalAllocationUnits", self.total_allocation_units)
            .with("AvailableAllocationUnits", self.available_allocation_units)
            .with("SectorsPerAllocationUnit", self.sectors_per_allocation_unit)
            .with("BytesPerSector", self.bytes_per_sector)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FsSizeInfo {
            total_allocation_units: v.u64("TotalAllocationUnits")?,
            available_allocation_units: v.u64("AvailableAllocationUnits")?,
            sectors_per_allocation_unit: v.u32("SectorsPerAllocationUnit")?,
            bytes_per_sector: v.u32("BytesPerSector")?,
        })
    }
}

impl Default for FsSizeInfo {
    fn default() -> Self {
        FsSizeInfo {
            total_allocation_units: 1024 * 1024,
            available_allocation_units: 512 * 1024,
            sectors_per_allocation_unit: 1,
            bytes_per_sector: 4096,
        }
    }
}

// ---- SET_INFO payloads ----

/// FileRenameInformation (SMB2 variant). MS-FSCC 2.4.37.2
///
/// The name is kept as raw UTF-16LE so the handler can reject invalid
/// sequences instead of silently replacing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRenameInfo {
    pub replace_if_exists: bool,
    pub root_directory: u64,
    pub file_name: Vec<u8>,
}

const FILE_RENAME_INFO: &[Field] = &[
    codec::scalar("ReplaceIfExists", 1),
    codec::fixed("Reserved", 7),
    codec::scalar("RootDirectory", 8),
    codec::length_of("FileNameLength", "FileName", 4),
    codec::bytes("FileName"),
];

impl WireRecord for FileRenameInfo {
    const SCHEMA: &'static [Field] = FILE_RENAME_INFO;

    fn store(&self) -> Values {
        Values::new()
            .with("ReplaceIfExists", self.replace_if_exists as u8)
            .with("RootDirectory", self.root_directory)
            .with("FileName", self.file_name.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FileRenameInfo {
            replace_if_exists: v.u8("ReplaceIfExists")? != 0,
            root_directory: v.u64("RootDirectory")?,
            file_name: v.bytes("FileName")?.to_vec(),
        })
    }
}

/// FileDispositionInformation. MS-FSCC 2.4.11
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDispositionInfo {
    pub delete_pending: bool,
}

const FILE_DISPOSITION_INFO: &[Field] = &[codec::scalar("DeletePending", 1)];

impl WireRecord for FileDispositionInfo {
    const SCHEMA: &'static [Field] = FILE_DISPOSITION_INFO;

    fn store(&self) -> Values {
        Values::new().with("DeletePending", self.delete_pending as u8)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(FileDispositionInfo { delete_pending: v.u8("DeletePending")? == 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> FileIdBothDirInfo {
        FileIdBothDirInfo { file_name: name.into(), end_of_file: 3, ..Default::default() }
    }

    #[test]
    fn test_directory_entries_chain() {
        let buf = encode_directory_entries(&[entry("."), entry("..")]).unwrap();
        // fixed part 104 bytes; "." is 2 bytes -> 106, padded to 112
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 112);
        assert_eq!(u32::from_le_bytes(buf[112..116].try_into().unwrap()), 0);
        assert_eq!(buf.len(), 112 + 104 + 4);

        let entries = decode_directory_entries(&buf).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].file_name, "..");
        assert_eq!(entries[1].end_of_file, 3);
    }

    #[test]
    fn test_file_all_info_layout() {
        let info = FileAllInfo { file_name: "a".into(), is_directory: true, ..Default::default() };
        let buf = info.encode().unwrap();
        assert_eq!(buf.len(), 100 + 2);
        assert_eq!(buf[61], 1);
        assert_eq!(u32::from_le_bytes(buf[96..100].try_into().unwrap()), 2);
    }

    #[test]
    fn test_stream_entries_aligned() {
        let streams = vec![
            StreamInfo { name: "::$DATA".into(), size: 10, allocation_size: 10 },
            StreamInfo { name: ":k:$DATA".into(), size: 16, allocation_size: 16 },
        ];
        let buf = encode_stream_entries(&streams).unwrap();
        // 24 + 14 = 38 -> 40
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 40);
        assert_eq!(decode_stream_entries(&buf).unwrap(), streams);
    }

    #[test]
    fn test_fs_attribute_info() {
        let buf = FsAttributeInfo::default().encode().unwrap();
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 255);
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 8);
        assert_eq!(FsSizeInfo::default().encode().unwrap().len(), 24);
    }

    #[test]
    fn test_rename_info_parse() {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&[0; 15]);
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"b\0c\0");
        let (info, _) = FileRenameInfo::decode(&buf).unwrap();
        assert!(info.replace_if_exists);
        assert_eq!(info.file_name, b"b\0c\0");
    }
}
