//! DCE/RPC over the `srvsvc` named pipe.
//!
//! A client writes one PDU to the pipe and reads the answer back: a Bind
//! is answered with a BindAck, a Request for NetShareEnumAll with a
//! Response listing the session's shares. Only connection-oriented PDUs
//! with little-endian NDR data are understood.
//!
//! References:
//! - C706 DCE 1.1: Remote Procedure Call, Chapter 12
//! - [MS-RPCE] Remote Procedure Call Protocol Extensions
//! - [MS-SRVS] Server Service Remote Protocol, Section 3.1.4.8

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::codec::{self, get_enum, store_all, CodecError, Field, SelfDescribing, Values, WireEnum, WireRecord};
use crate::error::ServerError;
use crate::resource::Anchor;
use crate::smb2::{string_to_utf16le, utf16le_to_string};

crate::wire_enum! {
    /// Connection-oriented PDU types.
    pub enum PduType: u8 {
        Request = 0,
        Response = 2,
        Fault = 3,
        Bind = 11,
        BindAck = 12,
        BindNak = 13,
        AlterContext = 14,
        AlterContextResp = 15,
        Shutdown = 17,
    }
}

pub const PDU_HEADER_LEN: usize = 16;
pub const RPC_VERSION: u8 = 5;
pub const PFC_FIRST_FRAG: u8 = 0x01;
pub const PFC_LAST_FRAG: u8 = 0x02;
/// Little-endian integers, ASCII characters, IEEE floats.
pub const DATA_REP_LE: u32 = 0x0000_0010;

/// srvsvc operation number of NetrShareEnum.
pub const OPNUM_NET_SHARE_ENUM_ALL: u16 = 15;

/// NDR transfer syntax 8a885d04-1ceb-11c9-9fe8-08002b104860, version 2.
pub const NDR_SYNTAX: SyntaxId = SyntaxId {
    uuid: [
        0x04, 0x5d, 0x88, 0x8a, 0xeb, 0x1c, 0xc9, 0x11, 0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60,
    ],
    version: 2,
};

/// srvsvc interface 4b324fc8-1670-01d3-1278-5a47bf6ee188, version 3.
pub const SRVSVC_SYNTAX: SyntaxId = SyntaxId {
    uuid: [
        0xc8, 0x4f, 0x32, 0x4b, 0x70, 0x16, 0xd3, 0x01, 0x12, 0x78, 0x5a, 0x47, 0xbf, 0x6e, 0xe1, 0x88,
    ],
    version: 3,
};

/// Secondary address reported in the BindAck.
const SRVSVC_PORT: &[u8] = b"\\PIPE\\srvsvc\0";

pub const STYPE_DISKTREE: u32 = 0x0000_0000;
pub const STYPE_IPC: u32 = 0x0000_0003;
pub const STYPE_SPECIAL: u32 = 0x8000_0000;

pub const IPC_COMMENT: &str = "IPC Service";

/// Bind result: accepted, or rejected for lack of a common transfer syntax.
const RESULT_ACCEPTANCE: u16 = 0;
const RESULT_PROVIDER_REJECTION: u16 = 2;
const REASON_TRANSFER_SYNTAXES_NOT_SUPPORTED: u16 = 2;

fn unsupported(msg: String) -> ServerError {
    ServerError::UnsupportedOperation(msg)
}

/// Render a wire UUID in its usual textual form.
pub fn format_uuid(b: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

// ---- Common header ----

/// The 16-byte header shared by every connection-oriented PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PduType,
    pub flags: u8,
    pub data_representation: u32,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

const PDU_HEADER: &[Field] = &[
    codec::scalar("Version", 1),
    codec::scalar("VersionMinor", 1),
    codec::scalar("PacketType", 1),
    codec::scalar("PacketFlags", 1),
    codec::scalar("DataRepresentation", 4),
    codec::scalar("FragLength", 2),
    codec::scalar("AuthLength", 2),
    codec::scalar("CallId", 4),
];

impl WireRecord for PduHeader {
    const SCHEMA: &'static [Field] = PDU_HEADER;

    fn store(&self) -> Values {
        Values::new()
            .with("Version", self.version)
            .with("VersionMinor", self.version_minor)
            .with("PacketType", self.packet_type.value())
            .with("PacketFlags", self.flags)
            .with("DataRepresentation", self.data_representation)
            .with("FragLength", self.frag_length)
            .with("AuthLength", self.auth_length)
            .with("CallId", self.call_id)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(PduHeader {
            version: v.u8("Version")?,
            version_minor: v.u8("VersionMinor")?,
            packet_type: v.enumeration("PacketType")?,
            flags: v.u8("PacketFlags")?,
            data_representation: v.u32("DataRepresentation")?,
            frag_length: v.u16("FragLength")?,
            auth_length: v.u16("AuthLength")?,
            call_id: v.u32("CallId")?,
        })
    }
}

impl PduHeader {
    /// A single-fragment header for a client call.
    pub fn new(packet_type: PduType, call_id: u32) -> Self {
        PduHeader {
            version: RPC_VERSION,
            version_minor: 0,
            packet_type,
            flags: PFC_FIRST_FRAG | PFC_LAST_FRAG,
            data_representation: DATA_REP_LE,
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    /// The answer to this PDU: same call, different type.
    fn reply(&self, packet_type: PduType) -> Self {
        PduHeader { packet_type, frag_length: 0, ..self.clone() }
    }
}

/// Frame `body` behind `header`, filling in the fragment length.
pub fn build_pdu(header: &PduHeader, body: &[u8]) -> Result<Vec<u8>, ServerError> {
    let total = PDU_HEADER_LEN + body.len();
    let frag_length = u16::try_from(total).map_err(|_| CodecError::Overflow("FragLength"))?;
    let mut out = PduHeader { frag_length, ..header.clone() }.encode()?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a PDU into its header and body. Unknown packet types are
/// reported as unsupported.
pub fn parse_pdu(buf: &[u8]) -> Result<(PduHeader, &[u8]), ServerError> {
    if buf.len() < PDU_HEADER_LEN {
        return Err(CodecError::OutOfBounds { field: "PduHeader", end: PDU_HEADER_LEN, len: buf.len() }.into());
    }
    get_enum::<PduType>(&buf[2..]).map_err(|e| unsupported(format!("PDU type: {}", e)))?;
    let (header, used) = PduHeader::decode(buf)?;
    if header.version != RPC_VERSION {
        return Err(ServerError::ProtocolViolation(format!("RPC version {}", header.version)));
    }
    let end = (header.frag_length as usize).clamp(used, buf.len());
    Ok((header, &buf[used..end]))
}

// ---- Bind / BindAck ----

/// Interface or transfer syntax identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: [u8; 16],
    pub version: u32,
}

const SYNTAX_ID: &[Field] = &[codec::fixed("Uuid", 16), codec::scalar("Version", 4)];

impl WireRecord for SyntaxId {
    const SCHEMA: &'static [Field] = SYNTAX_ID;

    fn store(&self) -> Values {
        Values::new().with("Uuid", self.uuid).with("Version", self.version)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(SyntaxId { uuid: v.array("Uuid")?, version: v.u32("Version")? })
    }
}

/// One presentation context offered in a Bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextItem {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

const CONTEXT_ITEM: &[Field] = &[
    codec::scalar("ContextId", 2),
    codec::count_of("NumTransItems", "TransferSyntaxes", 1),
    codec::scalar("Reserved", 1),
    codec::nested("AbstractSyntax", SYNTAX_ID),
    codec::list("TransferSyntaxes", SYNTAX_ID),
];

impl WireRecord for ContextItem {
    const SCHEMA: &'static [Field] = CONTEXT_ITEM;

    fn store(&self) -> Values {
        Values::new()
            .with("ContextId", self.context_id)
            .with("AbstractSyntax", self.abstract_syntax.store())
            .with("TransferSyntaxes", store_all(&self.transfer_syntaxes))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(ContextItem {
            context_id: v.u16("ContextId")?,
            abstract_syntax: v.nested("AbstractSyntax")?,
            transfer_syntaxes: v.records("TransferSyntaxes")?,
        })
    }
}

/// Bind body (after the common header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindBody {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    pub contexts: Vec<ContextItem>,
}

const BIND_BODY: &[Field] = &[
    codec::scalar("MaxXmitFrag", 2),
    codec::scalar("MaxRecvFrag", 2),
    codec::scalar("AssocGroup", 4),
    codec::count_of("NumCtxItems", "CtxItems", 1),
    codec::scalar("Reserved", 1),
    codec::scalar("Reserved2", 2),
    codec::list("CtxItems", CONTEXT_ITEM),
];

impl WireRecord for BindBody {
    const SCHEMA: &'static [Field] = BIND_BODY;
    const BASE: usize = PDU_HEADER_LEN;

    fn store(&self) -> Values {
        Values::new()
            .with("MaxXmitFrag", self.max_xmit_frag)
            .with("MaxRecvFrag", self.max_recv_frag)
            .with("AssocGroup", self.assoc_group)
            .with("CtxItems", store_all(&self.contexts))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(BindBody {
            max_xmit_frag: v.u16("MaxXmitFrag")?,
            max_recv_frag: v.u16("MaxRecvFrag")?,
            assoc_group: v.u32("AssocGroup")?,
            contexts: v.records("CtxItems")?,
        })
    }
}

impl BindBody {
    /// Bind to srvsvc over NDR.
    pub fn srvsvc() -> Self {
        BindBody {
            max_xmit_frag: 4280,
            max_recv_frag: 4280,
            assoc_group: 0,
            contexts: vec![ContextItem {
                context_id: 0,
                abstract_syntax: SRVSVC_SYNTAX,
                transfer_syntaxes: vec![NDR_SYNTAX],
            }],
        }
    }
}

/// Outcome for one offered context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextResult {
    pub result: u16,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

const CONTEXT_RESULT: &[Field] = &[
    codec::scalar("AckResult", 2),
    codec::scalar("AckReason", 2),
    codec::nested("TransferSyntax", SYNTAX_ID),
];

impl WireRecord for ContextResult {
    const SCHEMA: &'static [Field] = CONTEXT_RESULT;

    fn store(&self) -> Values {
        Values::new()
            .with("AckResult", self.result)
            .with("AckReason", self.reason)
            .with("TransferSyntax", self.transfer_syntax.store())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(ContextResult {
            result: v.u16("AckResult")?,
            reason: v.u16("AckReason")?,
            transfer_syntax: v.nested("TransferSyntax")?,
        })
    }
}

impl ContextResult {
    fn answer(item: &ContextItem) -> Self {
        if item.transfer_syntaxes.contains(&NDR_SYNTAX) {
            ContextResult { result: RESULT_ACCEPTANCE, reason: 0, transfer_syntax: NDR_SYNTAX }
        } else {
            ContextResult {
                result: RESULT_PROVIDER_REJECTION,
                reason: REASON_TRANSFER_SYNTAXES_NOT_SUPPORTED,
                transfer_syntax: SyntaxId { uuid: [0; 16], version: 0 },
            }
        }
    }
}

/// BindAck body (after the common header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAckBody {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    pub secondary_address: Vec<u8>,
    pub results: Vec<ContextResult>,
}

const BIND_ACK_BODY: &[Field] = &[
    codec::scalar("MaxXmitFrag", 2),
    codec::scalar("MaxRecvFrag", 2),
    codec::scalar("AssocGroup", 4),
    codec::length_of("SecAddrLen", "SecAddr", 2),
    codec::bytes("SecAddr"),
    codec::align("Pad", 4),
    codec::count_of("NumResults", "Results", 1),
    codec::scalar("Reserved", 1),
    codec::scalar("Reserved2", 2),
    codec::list("Results", CONTEXT_RESULT),
];

impl WireRecord for BindAckBody {
    const SCHEMA: &'static [Field] = BIND_ACK_BODY;
    const BASE: usize = PDU_HEADER_LEN;

    fn store(&self) -> Values {
        Values::new()
            .with("MaxXmitFrag", self.max_xmit_frag)
            .with("MaxRecvFrag", self.max_recv_frag)
            .with("AssocGroup", self.assoc_group)
            .with("SecAddr", self.secondary_address.clone())
            .with("Results", store_all(&self.results))
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(BindAckBody {
            max_xmit_frag: v.u16("MaxXmitFrag")?,
            max_recv_frag: v.u16("MaxRecvFrag")?,
            assoc_group: v.u32("AssocGroup")?,
            secondary_address: v.bytes("SecAddr")?.to_vec(),
            results: v.records("Results")?,
        })
    }
}

// ---- Request / Response ----

/// Request body (after the common header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub stub: Vec<u8>,
}

const REQUEST_BODY: &[Field] = &[
    codec::scalar("AllocHint", 4),
    codec::scalar("ContextId", 2),
    codec::scalar("Opnum", 2),
    codec::bytes("Stub"),
];

impl WireRecord for RequestBody {
    const SCHEMA: &'static [Field] = REQUEST_BODY;
    const BASE: usize = PDU_HEADER_LEN;

    fn store(&self) -> Values {
        Values::new()
            .with("AllocHint", self.alloc_hint)
            .with("ContextId", self.context_id)
            .with("Opnum", self.opnum)
            .with("Stub", self.stub.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(RequestBody {
            alloc_hint: v.u32("AllocHint")?,
            context_id: v.u16("ContextId")?,
            opnum: v.u16("Opnum")?,
            stub: v.bytes("Stub")?.to_vec(),
        })
    }
}

/// Response body (after the common header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub: Vec<u8>,
}

const RESPONSE_BODY: &[Field] = &[
    codec::scalar("AllocHint", 4),
    codec::scalar("ContextId", 2),
    codec::scalar("CancelCount", 1),
    codec::scalar("Reserved", 1),
    codec::bytes("Stub"),
];

impl WireRecord for ResponseBody {
    const SCHEMA: &'static [Field] = RESPONSE_BODY;
    const BASE: usize = PDU_HEADER_LEN;

    fn store(&self) -> Values {
        Values::new()
            .with("AllocHint", self.alloc_hint)
            .with("ContextId", self.context_id)
            .with("CancelCount", self.cancel_count)
            .with("Stub", self.stub.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(ResponseBody {
            alloc_hint: v.u32("AllocHint")?,
            context_id: v.u16("ContextId")?,
            cancel_count: v.u8("CancelCount")?,
            stub: v.bytes("Stub")?.to_vec(),
        })
    }
}

// ---- NDR helpers ----

/// Bounds-checked little-endian reader over an NDR stub.
struct NdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> NdrReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        NdrReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        let out = self.buf.get(self.pos..end).ok_or(CodecError::OutOfBounds { field, end, len: self.buf.len() })?;
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn align4(&mut self) {
        self.pos = self.pos.div_ceil(4) * 4;
    }

    /// A conformant varying string: max count, offset, actual count,
    /// then `actual` UTF-16 units. The terminator is stripped.
    fn string(&mut self, field: &'static str) -> Result<(String, u32), CodecError> {
        let _max = self.u32(field)?;
        let _offset = self.u32(field)?;
        let actual = self.u32(field)?;
        let units = self.take(actual as usize * 2, field)?;
        let mut s = utf16le_to_string(units);
        if s.ends_with('\0') {
            s.pop();
        }
        Ok((s, actual))
    }
}

/// Append a conformant varying string with its terminator. Returns the
/// number of UTF-16 units written.
fn put_string(buf: &mut BytesMut, s: &str) -> u32 {
    let mut units = string_to_utf16le(s);
    units.extend_from_slice(&[0, 0]);
    let count = (units.len() / 2) as u32;
    buf.put_u32_le(count);
    buf.put_u32_le(0);
    buf.put_u32_le(count);
    buf.put_slice(&units);
    count
}

// ---- srvsvc NetShareEnumAll ----

/// SHARE_INFO_1: name, type, comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo1 {
    pub name: String,
    pub share_type: u32,
    pub comment: String,
}

impl ShareInfo1 {
    pub fn for_anchor(anchor: &Anchor) -> Self {
        if anchor.is_named_pipe() {
            ShareInfo1 {
                name: anchor.name.clone(),
                share_type: STYPE_SPECIAL | STYPE_IPC,
                comment: IPC_COMMENT.to_string(),
            }
        } else {
            ShareInfo1 { name: anchor.name.clone(), share_type: STYPE_DISKTREE, comment: String::new() }
        }
    }
}

/// SHARE_INFO_1_CONTAINER behind its level switch and referent pointer.
///
/// Every referent id is 1. Strings are padded to four bytes when their
/// unit count is odd, except the comment of the final entry, which is
/// left unpadded as observed from macOS and Windows peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareInfoCtr {
    pub entries: Vec<ShareInfo1>,
}

impl SelfDescribing for ShareInfoCtr {
    fn encode_self(&self, buf: &mut BytesMut) {
        let count = self.entries.len() as u32;
        buf.put_u32_le(1); // level
        buf.put_u32_le(1); // container referent
        buf.put_u32_le(count);
        if self.entries.is_empty() {
            buf.put_u32_le(0); // null array pointer
            return;
        }
        buf.put_u32_le(1); // array referent
        buf.put_u32_le(count);
        for entry in &self.entries {
            buf.put_u32_le(1);
            buf.put_u32_le(entry.share_type);
            buf.put_u32_le(1);
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if put_string(buf, &entry.name) % 2 == 1 {
                buf.put_bytes(0, 2);
            }
            let last = i + 1 == self.entries.len();
            if put_string(buf, &entry.comment) % 2 == 1 && !last {
                buf.put_bytes(0, 2);
            }
        }
    }

    fn decode_self(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut r = NdrReader::new(buf);
        let _level = r.u32("Ctr")?;
        let _referent = r.u32("Ctr1ReferentId")?;
        let count = r.u32("Ctr1Count")? as usize;
        if count == 0 {
            r.u32("Ctr1Array")?;
            return Ok((ShareInfoCtr::default(), r.pos));
        }
        let _array_referent = r.u32("ArrayReferentId")?;
        let max_count = r.u32("ArrayMaxCount")? as usize;
        if max_count != count {
            return Err(CodecError::Invalid(format!("share count {} vs array size {}", count, max_count)));
        }
        let mut types = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            r.u32("NameReferentId")?;
            types.push(r.u32("ShareType")?);
            r.u32("CommentReferentId")?;
        }
        let mut entries = Vec::with_capacity(types.len());
        for (i, share_type) in types.into_iter().enumerate() {
            let (name, units) = r.string("Name")?;
            if units % 2 == 1 {
                r.take(2, "NamePad")?;
            }
            let (comment, units) = r.string("Comment")?;
            if units % 2 == 1 && i + 1 < count {
                r.take(2, "CommentPad")?;
            }
            entries.push(ShareInfo1 { name, share_type, comment });
        }
        Ok((ShareInfoCtr { entries }, r.pos))
    }
}

/// NetrShareEnum response stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetShareEnumAllResponse {
    pub ctr: ShareInfoCtr,
    pub total_entries: u32,
    pub resume_handle: u32,
    pub status: u32,
}

const NET_SHARE_ENUM_ALL_RESPONSE: &[Field] = &[
    codec::scalar("Level", 4),
    codec::self_describing("Ctr", ShareInfoCtr::measure),
    codec::scalar("TotalEntries", 4),
    codec::scalar("ResumeHandle", 4),
    codec::scalar("WindowsError", 4),
];

impl WireRecord for NetShareEnumAllResponse {
    const SCHEMA: &'static [Field] = NET_SHARE_ENUM_ALL_RESPONSE;

    fn store(&self) -> Values {
        Values::new()
            .with("Level", 1u32)
            .with("Ctr", self.ctr.to_value())
            .with("TotalEntries", self.total_entries)
            .with("ResumeHandle", self.resume_handle)
            .with("WindowsError", self.status)
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        let (ctr, _) = ShareInfoCtr::decode_self(v.bytes("Ctr")?)?;
        Ok(NetShareEnumAllResponse {
            ctr,
            total_entries: v.u32("TotalEntries")?,
            resume_handle: v.u32("ResumeHandle")?,
            status: v.u32("WindowsError")?,
        })
    }
}

impl NetShareEnumAllResponse {
    pub fn for_anchors(anchors: &[Arc<Anchor>]) -> Self {
        let entries: Vec<ShareInfo1> = anchors.iter().map(|a| ShareInfo1::for_anchor(a)).collect();
        NetShareEnumAllResponse {
            total_entries: entries.len() as u32,
            ctr: ShareInfoCtr { entries },
            resume_handle: 0,
            status: 0,
        }
    }
}

/// NetrShareEnum request stub, up to the information level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetShareEnumAllRequest {
    pub server_unc: String,
    pub level: u32,
}

impl SelfDescribing for NetShareEnumAllRequest {
    fn encode_self(&self, buf: &mut BytesMut) {
        buf.put_u32_le(0x0002_0000); // server name referent
        put_string(buf, &self.server_unc);
        let pad = buf.len().next_multiple_of(4) - buf.len();
        buf.put_bytes(0, pad);
        buf.put_u32_le(self.level);
        buf.put_u32_le(self.level); // container switch
        buf.put_u32_le(0x0002_0004); // container referent
        buf.put_u32_le(0); // count
        buf.put_u32_le(0); // null array
        buf.put_u32_le(u32::MAX); // preferred maximum length
        buf.put_u32_le(0); // null resume handle
    }

    fn decode_self(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut r = NdrReader::new(buf);
        let referent = r.u32("ServerNameReferentId")?;
        let server_unc = if referent == 0 { String::new() } else { r.string("ServerName")?.0 };
        r.align4();
        let level = r.u32("Level")?;
        Ok((NetShareEnumAllRequest { server_unc, level }, r.pos))
    }
}

// ---- Pipe state ----

/// A PDU written to the pipe and not yet answered.
#[derive(Debug, Clone)]
enum Pending {
    Bind { header: PduHeader, bind: BindBody },
    Request { header: PduHeader, request: RequestBody },
}

/// Server side of the `srvsvc` pipe: each write stores one PDU, the
/// following read answers it.
#[derive(Debug, Default)]
pub struct RpcPipe {
    pending: Option<Pending>,
}

impl RpcPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one PDU. Returns the number of bytes consumed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ServerError> {
        let (header, body) = parse_pdu(data)?;
        let pending = match header.packet_type {
            PduType::Bind => {
                let (bind, _) = BindBody::decode(body)?;
                for ctx in &bind.contexts {
                    debug!(
                        context_id = ctx.context_id,
                        interface = %format_uuid(&ctx.abstract_syntax.uuid),
                        "RPC bind"
                    );
                }
                Pending::Bind { header, bind }
            }
            PduType::Request => {
                let (request, _) = RequestBody::decode(body)?;
                if request.opnum != OPNUM_NET_SHARE_ENUM_ALL {
                    return Err(unsupported(format!("srvsvc opnum {}", request.opnum)));
                }
                let (call, _) = NetShareEnumAllRequest::decode_self(&request.stub)?;
                debug!(server = %call.server_unc, level = call.level, "NetShareEnumAll");
                Pending::Request { header, request }
            }
            other => return Err(unsupported(format!("PDU type {:?} written to pipe", other))),
        };
        self.pending = Some(pending);
        Ok(data.len())
    }

    /// Answer the stored PDU.
    pub fn read(&mut self, anchors: &[Arc<Anchor>]) -> Result<Vec<u8>, ServerError> {
        match self.pending.take() {
            Some(Pending::Bind { header, bind }) => {
                let ack = BindAckBody {
                    max_xmit_frag: bind.max_xmit_frag,
                    max_recv_frag: bind.max_recv_frag,
                    assoc_group: bind.assoc_group,
                    secondary_address: SRVSVC_PORT.to_vec(),
                    results: bind.contexts.iter().map(ContextResult::answer).collect(),
                };
                build_pdu(&header.reply(PduType::BindAck), &ack.encode()?)
            }
            Some(Pending::Request { header, request }) => {
                let stub = NetShareEnumAllResponse::for_anchors(anchors).encode()?;
                debug!(shares = anchors.len(), "NetShareEnumAll answered");
                let response = ResponseBody {
                    alloc_hint: stub.len() as u32,
                    context_id: request.context_id,
                    cancel_count: 0,
                    stub,
                };
                build_pdu(&header.reply(PduType::Response), &response.encode()?)
            }
            None => Err(unsupported("read from pipe with no pending PDU".into())),
        }
    }
}
