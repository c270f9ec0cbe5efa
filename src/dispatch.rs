//! Command dispatch: the command registry, compound chains, and the
//! per-command handlers.
//!
//! A frame may carry several requests chained by their headers'
//! NextCommand offsets. All of them are decoded through the registry into
//! [`Command`]s before any runs; they are then handled in order against one
//! shared [`RequestContext`], so a Create followed by a Close on the
//! sentinel file id closes the file just created. Responses are encoded separately and chained the same way.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::auth::{AuthState, AuthStep, Authenticator};
use crate::codec::{CodecError, WireEnum, WireRecord};
use crate::dcerpc::RpcPipe;
use crate::error::{error_to_ntstatus, io_to_ntstatus, ServerError};
use crate::resource::{
    split_xattr_name, Guid, Handle, OpenFile, PendingAction, ResourceTable, SRVSVC_PIPE,
};
use crate::server::ServerState;
use crate::smb2::ack::{
    build_error_response_body, AckResponse, ChangeNotifyRequest, FlushRequest, LockRequest,
    PlainRequest,
};
use crate::smb2::close::{CloseRequest, CloseResponse, CLOSE_FLAG_POSTQUERY_ATTRIB};
use crate::smb2::create::{
    CreateContext, CreateDisposition, CreateRequest, CreateResponse, MaximalAccessResponse,
    CONTEXT_QUERY_MAXIMAL_ACCESS, FILE_ATTRIBUTE_ARCHIVE, FILE_ATTRIBUTE_DIRECTORY,
    FILE_ATTRIBUTE_NORMAL,
};
use crate::smb2::header::{Smb2Header, FLAGS_SERVER_TO_REDIR, NEXT_COMMAND_OFFSET};
use crate::smb2::info::{
    encode_directory_entries, encode_stream_entries, FileAllInfo, FileDispositionInfo,
    FileIdBothDirInfo, FileRenameInfo, FsAttributeInfo, FsSizeInfo, StreamInfo,
    FILE_ALL_INFORMATION, FILE_BASIC_INFORMATION, FILE_DISPOSITION_INFORMATION,
    FILE_FS_ATTRIBUTE_INFORMATION, FILE_FS_SIZE_INFORMATION, FILE_ID_BOTH_DIRECTORY_INFORMATION,
    FILE_RENAME_INFORMATION, FILE_STREAM_INFORMATION, PLACEHOLDER_EA_SIZE,
};
use crate::smb2::negotiate::{
    NegotiateRequest, NegotiateResponse, MAX_IO_SIZE, NEGOTIATE_SIGNING_ENABLED,
    NEGOTIATE_SIGNING_REQUIRED, SERVER_CAPABILITIES,
};
use crate::smb2::query::{
    QueryDirectoryRequest, QueryInfoRequest, QueryResponse, SetInfoRequest, SetInfoResponse,
    SMB2_0_INFO_FILE, SMB2_0_INFO_FILESYSTEM,
};
use crate::smb2::read::{ReadRequest, ReadResponse};
use crate::smb2::session::{SessionSetupRequest, SessionSetupResponse};
use crate::smb2::status::NtStatus;
use crate::smb2::tree::{
    TreeConnectRequest, TreeConnectResponse, ALL_ACCESS_MASK, SHARE_FLAG_ACCESS_BASED_DIRECTORY_ENUM,
    SHARE_FLAG_NO_CACHING, SHARE_TYPE_DISK, SHARE_TYPE_PIPE,
};
use crate::smb2::write::{WriteRequest, WriteResponse};
use crate::smb2::{self, Dialect, Smb2Command};
use crate::spnego::NegTokenInit;
use crate::vfs::{filetime_now, FileInfo, OpenFlags};

/// Credits granted with the first SESSION_SETUP answer.
const SETUP_CREDITS: u16 = 33;

// ---- Per-connection state ----

/// Server-side state of one connection, owned by its task.
pub struct Session {
    server: Arc<ServerState>,
    /// Zero until the first SESSION_SETUP; fixed afterwards.
    id: u64,
    dialect: Option<Dialect>,
    signing_required: bool,
    auth: Authenticator,
    resources: ResourceTable,
    pipe: RpcPipe,
    /// CHANGE_NOTIFY requests answered with STATUS_PENDING, by message id.
    notifications: HashMap<u64, PendingNotify>,
}

/// A change notification waiting on an open directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotify {
    pub file_id: Guid,
    pub request: ChangeNotifyRequest,
}

impl Session {
    pub fn new(server: Arc<ServerState>) -> Self {
        let auth = Authenticator::new(server.server_name.clone());
        Session {
            server,
            id: 0,
            dialect: None,
            signing_required: false,
            auth,
            resources: ResourceTable::new(),
            pipe: RpcPipe::new(),
            notifications: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Whether the client asked for signing. Recorded only.
    pub fn signing_required(&self) -> bool {
        self.signing_required
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn pending_notify(&self, message_id: u64) -> Option<&PendingNotify> {
        self.notifications.get(&message_id)
    }

    fn assign_id(&mut self) -> u64 {
        while self.id == 0 {
            self.id = rand::thread_rng().next_u64();
        }
        self.id
    }

    fn check_session(&self, header: &Smb2Header) -> Result<(), ServerError> {
        if self.id != 0 && header.session_id != self.id {
            return Err(ServerError::SessionExpired { expected: self.id, received: header.session_id });
        }
        Ok(())
    }
}

/// State shared by every command of one compound chain.
pub struct RequestContext<'a> {
    pub session: &'a mut Session,
    /// File id minted by the latest Create of the chain, or nil.
    pub latest: Guid,
}

impl RequestContext<'_> {
    /// The file id a request refers to, with the sentinel resolved.
    fn file_id(&self, raw: [u8; 16]) -> Guid {
        ResourceTable::resolve_sentinel(Guid::from(raw), self.latest)
    }
}

// ---- Replies ----

/// A handler's answer: status and body, plus header fields it overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: NtStatus,
    pub body: Vec<u8>,
    session_id: Option<u64>,
    tree_id: Option<u32>,
    credits: Option<u16>,
}

impl Reply {
    pub fn with_status(status: NtStatus, body: Vec<u8>) -> Self {
        Reply { status, body, session_id: None, tree_id: None, credits: None }
    }

    pub fn success(body: Vec<u8>) -> Self {
        Self::with_status(NtStatus::Success, body)
    }

    fn record<T: WireRecord>(record: &T) -> Result<Self, ServerError> {
        Ok(Self::success(record.encode()?))
    }

    fn ack() -> Result<Self, ServerError> {
        Self::record(&AckResponse)
    }

    /// Error response carrying the most specific status for `e`.
    fn failure(e: &ServerError) -> Self {
        Self::with_status(error_to_ntstatus(e), build_error_response_body())
    }

    fn session(mut self, id: u64) -> Self {
        self.session_id = Some(id);
        self
    }

    fn tree(mut self, id: u32) -> Self {
        self.tree_id = Some(id);
        self
    }

    fn credits(mut self, credits: u16) -> Self {
        self.credits = Some(credits);
        self
    }

    fn header(&self, request: &Smb2Header) -> Smb2Header {
        let mut header = Smb2Header::new_response(request, self.status);
        if let Some(id) = self.session_id {
            header.session_id = id;
        }
        if let Some(id) = self.tree_id {
            header.tree_id = id;
        }
        if let Some(credits) = self.credits {
            header.credits = credits;
        }
        header
    }
}

// ---- Registry ----

/// A decoded request body that knows how to answer itself.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    async fn handle(&self, header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError>;
}

/// Decodes one command body.
type Constructor = fn(&[u8]) -> Result<Box<dyn Command>, CodecError>;

fn decoded<T: WireRecord + Command + 'static>(body: &[u8]) -> Result<Box<dyn Command>, CodecError> {
    let (request, _) = T::decode(body)?;
    Ok(Box::new(request))
}

/// Commands whose body is just a structure size.
fn plain<T: Command + Default + 'static>(body: &[u8]) -> Result<Box<dyn Command>, CodecError> {
    PlainRequest::decode(body)?;
    Ok(Box::new(T::default()))
}

fn registry() -> &'static HashMap<u16, Constructor> {
    static REGISTRY: OnceLock<HashMap<u16, Constructor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let entries: [(Smb2Command, Constructor); 17] = [
            (Smb2Command::Negotiate, decoded::<NegotiateRequest>),
            (Smb2Command::SessionSetup, decoded::<SessionSetupRequest>),
            (Smb2Command::Logoff, plain::<Logoff>),
            (Smb2Command::TreeConnect, decoded::<TreeConnectRequest>),
            (Smb2Command::TreeDisconnect, plain::<TreeDisconnect>),
            (Smb2Command::Create, decoded::<CreateRequest>),
            (Smb2Command::Close, decoded::<CloseRequest>),
            (Smb2Command::Flush, decoded::<FlushRequest>),
            (Smb2Command::Read, decoded::<ReadRequest>),
            (Smb2Command::Write, decoded::<WriteRequest>),
            (Smb2Command::Lock, decoded::<LockRequest>),
            (Smb2Command::Cancel, plain::<Cancel>),
            (Smb2Command::Echo, plain::<Echo>),
            (Smb2Command::QueryDirectory, decoded::<QueryDirectoryRequest>),
            (Smb2Command::ChangeNotify, decoded::<ChangeNotifyRequest>),
            (Smb2Command::QueryInfo, decoded::<QueryInfoRequest>),
            (Smb2Command::SetInfo, decoded::<SetInfoRequest>),
        ];
        entries.into_iter().map(|(command, constructor)| (command.code(), constructor)).collect()
    })
}

pub fn is_registered(command: u16) -> bool {
    registry().contains_key(&command)
}

/// Decode a command body through the registry.
pub fn decode_command(command: u16, body: &[u8]) -> Result<Box<dyn Command>, CodecError> {
    let constructor = registry()
        .get(&command)
        .ok_or_else(|| CodecError::Unsupported(format!("command {:#06x}", command)))?;
    constructor(body)
}

// ---- Compound chains ----

/// Iterator over the messages of a compound frame. Stops after the first
/// malformed message.
pub struct Chain<'a> {
    frame: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Chain<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Chain { frame, pos: 0, done: false }
    }
}

impl<'a> Iterator for Chain<'a> {
    type Item = Result<(Smb2Header, &'a [u8]), ServerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = self.frame;
        let start = self.pos;
        let rest = frame.get(start..).unwrap_or(&[]);
        let item = Smb2Header::decode(rest).map_err(ServerError::from).and_then(|(header, used)| {
            let next = header.next_command as usize;
            let end = if next == 0 { rest.len() } else { next };
            if end < used || end > rest.len() {
                return Err(CodecError::OutOfBounds { field: "NextCommand", end: start + end, len: frame.len() }.into());
            }
            Ok((header, &rest[used..end]))
        });
        match &item {
            Ok((header, _)) if header.next_command != 0 => self.pos += header.next_command as usize,
            _ => self.done = true,
        }
        Some(item)
    }
}

/// Concatenate encoded responses, padding each but the last to 8 bytes
/// and pointing its NextCommand at the following one.
///
/// NextCommand counts the padding, so it is the padded length rather than
/// the length of the encoded response.
pub fn join_chain(messages: Vec<Vec<u8>>) -> Vec<u8> {
    let count = messages.len();
    let mut out = Vec::new();
    for (i, mut message) in messages.into_iter().enumerate() {
        if i + 1 < count {
            let padded = message.len().div_ceil(8) * 8;
            message.resize(padded, 0);
            message[NEXT_COMMAND_OFFSET..NEXT_COMMAND_OFFSET + 4].copy_from_slice(&(padded as u32).to_le_bytes());
        }
        out.extend_from_slice(&message);
    }
    out
}

/// What to send back for one frame.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Vec<u8>,
    /// Drop the connection once the reply is written.
    pub disconnect: bool,
}

/// Handle every request of a frame.
///
/// Every message is validated before any of them runs. A malformed header
/// or a session id mismatch aborts the frame with an error and nothing is
/// answered. An unregistered command or an undecodable body is answered
/// with a single error response and no command of the chain runs. Once
/// the chain is valid, handler errors are answered and the chain goes on.
pub async fn dispatch(session: &mut Session, frame: &[u8]) -> Result<Outcome, ServerError> {
    let mut requests = Vec::new();
    for item in Chain::new(frame) {
        let (header, body) = item?;
        session.check_session(&header)?;

        debug!(
            command = ?Smb2Command::from_u16(header.command),
            message_id = header.message_id,
            session_id = header.session_id,
            tree_id = header.tree_id,
            "Received request"
        );

        match decode_command(header.command, body) {
            Ok(command) => requests.push((header, command)),
            Err(e) => {
                warn!(command = header.command, "Cannot decode request, chain rejected: {}", e);
                let reply = Reply::failure(&ServerError::from(e));
                let mut message = reply.header(&header).encode()?;
                message.extend_from_slice(&reply.body);
                return Ok(Outcome { reply: message, disconnect: false });
            }
        }
    }

    let mut ctx = RequestContext { session, latest: Guid::NIL };
    let mut messages = Vec::new();
    let mut disconnect = false;

    for (header, command) in requests {
        let reply = match command.handle(&header, &mut ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(command = header.command, "Request failed: {}", e);
                Reply::failure(&e)
            }
        };

        let mut message = reply.header(&header).encode()?;
        message.extend_from_slice(&reply.body);
        messages.push(message);

        if ctx.session.auth.state() == &AuthState::Failed {
            disconnect = true;
            break;
        }
    }

    Ok(Outcome { reply: join_chain(messages), disconnect })
}

/// Answer an SMB1 negotiate with the SMB2 wildcard dialect so the client
/// starts over with an SMB2 NEGOTIATE.
pub fn legacy_negotiate(session: &Session) -> Result<Vec<u8>, ServerError> {
    let mut header = Smb2Header::request(Smb2Command::Negotiate.code(), 0, 0, 0);
    header.credit_charge = 0;
    header.credits = 1;
    header.flags = FLAGS_SERVER_TO_REDIR;

    let mut response = negotiate_response(&session.server, Dialect::Wildcard);
    response.reserved = 1;

    let mut out = header.encode()?;
    out.extend_from_slice(&response.encode()?);
    Ok(out)
}

// ---- Helpers ----

fn negotiate_response(server: &ServerState, dialect: Dialect) -> NegotiateResponse {
    NegotiateResponse {
        security_mode: NEGOTIATE_SIGNING_ENABLED,
        dialect,
        reserved: 0,
        server_guid: server.server_guid,
        capabilities: SERVER_CAPABILITIES,
        max_transact_size: MAX_IO_SIZE,
        max_read_size: MAX_IO_SIZE,
        max_write_size: MAX_IO_SIZE,
        system_time: filetime_now(),
        server_start_time: server.start_time,
        security_buffer: NegTokenInit::ntlm(None).encode(),
    }
}

fn file_attributes(info: &FileInfo) -> u32 {
    if info.is_directory {
        FILE_ATTRIBUTE_DIRECTORY
    } else {
        FILE_ATTRIBUTE_ARCHIVE
    }
}

fn open_flags(disposition: CreateDisposition, write: bool) -> OpenFlags {
    use CreateDisposition::*;
    let create = matches!(disposition, Supersede | Create | OpenIf | OverwriteIf);
    let truncate = matches!(disposition, Supersede | Overwrite | OverwriteIf);
    OpenFlags { write: write || create, create, truncate }
}

fn pipe_info() -> FileInfo {
    FileInfo { name: SRVSVC_PIPE.to_string(), ..Default::default() }
}

/// Metadata of whatever an open file id refers to.
async fn stat_open(entry: &OpenFile) -> Result<FileInfo, ServerError> {
    match entry.handle {
        Handle::Pipe => Ok(pipe_info()),
        _ => Ok(entry.anchor.provider.stat(&entry.path).await?),
    }
}

fn unsupported(what: String) -> ServerError {
    ServerError::UnsupportedOperation(what)
}

fn dir_entry(info: &FileInfo, file_id: u64) -> FileIdBothDirInfo {
    let ea_size = if info.is_directory || info.end_of_file == 0 {
        PLACEHOLDER_EA_SIZE
    } else {
        info.end_of_file as u32
    };
    FileIdBothDirInfo {
        file_index: 0,
        creation_time: info.creation_time,
        last_access_time: info.last_access_time,
        last_write_time: info.last_write_time,
        change_time: info.change_time,
        end_of_file: info.end_of_file,
        allocation_size: info.allocation_size,
        file_attributes: if info.is_directory { FILE_ATTRIBUTE_DIRECTORY } else { FILE_ATTRIBUTE_NORMAL },
        ea_size,
        file_id,
        file_name: info.name.clone(),
    }
}

async fn streams(entry: &OpenFile) -> Result<Vec<StreamInfo>, ServerError> {
    let info = stat_open(entry).await?;
    let mut out = vec![StreamInfo {
        name: "::$DATA".to_string(),
        size: info.end_of_file,
        allocation_size: info.end_of_file,
    }];
    if matches!(entry.handle, Handle::Pipe) {
        return Ok(out);
    }
    let xattrs = &entry.anchor.xattrs;
    for key in xattrs.list(&entry.path).await? {
        match xattrs.get(&entry.path, &key).await {
            Ok(value) => out.push(StreamInfo {
                name: format!(":{}:$DATA", key),
                size: value.len() as u64,
                allocation_size: value.len() as u64,
            }),
            Err(e) => debug!(key = %key, "Skipping attribute stream: {}", e),
        }
    }
    Ok(out)
}

// ---- Command handlers ----

#[async_trait]
impl Command for NegotiateRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        if !self.offers(Dialect::Smb210) {
            return Err(ServerError::ProtocolViolation(format!(
                "no supported dialect in {:04x?}",
                self.dialects
            )));
        }
        let session = &mut *ctx.session;
        session.dialect = Some(Dialect::Smb210);
        session.signing_required = self.security_mode & NEGOTIATE_SIGNING_REQUIRED != 0;
        session.auth.negotiated();

        info!(dialect = "0x0210", signing_required = session.signing_required, "Negotiated");
        Reply::record(&negotiate_response(&session.server, Dialect::Smb210))
    }
}

#[async_trait]
impl Command for SessionSetupRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let session = &mut *ctx.session;
        let users = session.server.users.clone();
        let step = session.auth.step(&self.security_buffer, users.as_ref())?;
        let id = session.assign_id();

        match step {
            AuthStep::Continue(token) => {
                let body = SessionSetupResponse { session_flags: 0, security_buffer: token }.encode()?;
                Ok(Reply::with_status(NtStatus::MoreProcessingRequired, body)
                    .session(id)
                    .credits(SETUP_CREDITS))
            }
            AuthStep::Complete { username, token } => {
                session.resources.register_anchors(users.anchors_for(&username));
                info!(
                    user = %username,
                    session_id = id,
                    shares = session.resources.anchors().len(),
                    "Session established"
                );
                let response = SessionSetupResponse { session_flags: 0, security_buffer: token };
                Ok(Reply::record(&response)?.session(id).credits(1))
            }
        }
    }
}

#[derive(Debug, Default)]
struct Logoff;

#[async_trait]
impl Command for Logoff {
    async fn handle(&self, header: &Smb2Header, _ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        info!(session_id = header.session_id, "Logoff");
        Reply::ack()
    }
}

#[async_trait]
impl Command for TreeConnectRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let anchor = ctx.session.resources.set_active_anchor(self.share_name())?;
        let (share_type, share_flags) = if anchor.is_named_pipe() {
            (SHARE_TYPE_PIPE, SHARE_FLAG_NO_CACHING)
        } else {
            (SHARE_TYPE_DISK, SHARE_FLAG_NO_CACHING | SHARE_FLAG_ACCESS_BASED_DIRECTORY_ENUM)
        };

        info!(share = %anchor.name, tree_id = anchor.tree_id, "Tree connected");
        let response = TreeConnectResponse {
            share_type,
            share_flags,
            capabilities: 0,
            maximal_access: ALL_ACCESS_MASK,
        };
        Ok(Reply::record(&response)?.tree(anchor.tree_id))
    }
}

#[derive(Debug, Default)]
struct TreeDisconnect;

#[async_trait]
impl Command for TreeDisconnect {
    async fn handle(&self, header: &Smb2Header, _ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        debug!(tree_id = header.tree_id, "Tree disconnected");
        Reply::ack()
    }
}

#[async_trait]
impl Command for CreateRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let disposition = CreateDisposition::from_wire(self.create_disposition as u64)
            .ok_or(ServerError::Resource(NtStatus::InvalidParameter))?;
        let anchor = ctx.session.resources.active_anchor()?.clone();

        let (path, handle, info) = if anchor.is_named_pipe() {
            if !self.name.trim_start_matches('\\').eq_ignore_ascii_case(SRVSVC_PIPE) {
                return Err(NtStatus::ObjectNameNotFound.into());
            }
            ctx.session.pipe = RpcPipe::new();
            (PathBuf::from(SRVSVC_PIPE), Handle::Pipe, pipe_info())
        } else if let Some((file, key)) = split_xattr_name(&self.name) {
            let path = anchor.resolve(file)?;
            let info = anchor
                .provider
                .stat(&path)
                .await
                .map_err(|_| NtStatus::ObjectNameNotFound)?;
            (path, Handle::Xattr { key: key.to_string() }, info)
        } else {
            let path = anchor.resolve(&self.name)?;
            if self.wants_directory() && disposition == CreateDisposition::Create {
                anchor.provider.mkdir(&path).await.map_err(|e| io_to_ntstatus(&e))?;
            }
            let file = anchor
                .provider
                .open(&path, open_flags(disposition, self.wants_write()))
                .await
                .map_err(|e| {
                    debug!(path = ?path, "Open failed: {}", e);
                    NtStatus::ObjectNameNotFound
                })?;
            let info = anchor.provider.stat(&path).await?;
            (path, Handle::File(file), info)
        };

        let resources = &mut ctx.session.resources;
        let guid = resources.create_handle(anchor.tree_id);
        resources.open(guid, OpenFile::new(anchor, path, handle));
        ctx.latest = guid;

        let mut contexts = Vec::new();
        if self.context(CONTEXT_QUERY_MAXIMAL_ACCESS).is_some() {
            let access = MaximalAccessResponse { query_status: 0, maximal_access: ALL_ACCESS_MASK };
            contexts.push(CreateContext { name: CONTEXT_QUERY_MAXIMAL_ACCESS.to_vec(), data: access.encode()? });
        }

        debug!(file_id = %guid, name = %self.name, action = ?disposition.action(), "File opened");
        Reply::record(&CreateResponse {
            oplock_level: 0,
            create_action: disposition.action(),
            creation_time: info.creation_time,
            last_access_time: info.last_access_time,
            last_write_time: info.last_write_time,
            change_time: info.change_time,
            allocation_size: info.allocation_size,
            end_of_file: info.end_of_file,
            file_attributes: file_attributes(&info),
            file_id: guid.bytes(),
            contexts,
        })
    }
}

#[async_trait]
impl Command for CloseRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        if self.structure_size != 24 {
            return Err(NtStatus::InvalidParameter.into());
        }
        let guid = ctx.file_id(self.file_id);
        let entry = ctx.session.resources.get(&guid)?;
        // A failed stat only costs the attributes; the handle is closed regardless.
        let post_query = if self.wants_post_query() {
            match stat_open(entry).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(file_id = %guid, "Post-query stat failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        ctx.session.notifications.retain(|_, pending| pending.file_id != guid);
        ctx.session.resources.close(&guid).await?;
        ctx.latest = Guid::NIL;

        let response = match post_query {
            Some(info) => CloseResponse {
                flags: CLOSE_FLAG_POSTQUERY_ATTRIB,
                creation_time: info.creation_time,
                last_access_time: info.last_access_time,
                last_write_time: info.last_write_time,
                change_time: info.change_time,
                allocation_size: info.allocation_size,
                end_of_file: info.end_of_file,
                file_attributes: file_attributes(&info),
            },
            None => CloseResponse::default(),
        };
        Reply::record(&response)
    }
}

#[async_trait]
impl Command for FlushRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let guid = ctx.file_id(self.file_id);
        if let Handle::File(file) = &mut ctx.session.resources.get_mut(&guid)?.handle {
            file.flush().await?;
        }
        Reply::ack()
    }
}

#[async_trait]
impl Command for ReadRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        if self.length > MAX_IO_SIZE {
            return Err(NtStatus::InvalidParameter.into());
        }
        let guid = ctx.file_id(self.file_id);
        let session = &mut *ctx.session;
        let anchors = session.resources.anchors().to_vec();
        let entry = session.resources.get_mut(&guid)?;
        let length = self.length as usize;

        let data = match &mut entry.handle {
            Handle::File(file) => file.read_at(self.offset, length).await?,
            Handle::Xattr { key } => {
                let value = entry.anchor.xattrs.get(&entry.path, key).await?;
                let start = (self.offset as usize).min(value.len());
                value[start..value.len().min(start + length)].to_vec()
            }
            Handle::Pipe => session.pipe.read(&anchors)?,
        };

        if data.len() < self.minimum_count as usize || (data.is_empty() && length > 0) {
            return Err(NtStatus::EndOfFile.into());
        }
        Reply::record(&ReadResponse { data, data_remaining: 0 })
    }
}

#[async_trait]
impl Command for WriteRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        if self.data.is_empty()
            || self.data.len() > MAX_IO_SIZE as usize
            || self.data.len() < self.length as usize
        {
            return Err(NtStatus::InvalidParameter.into());
        }
        let guid = ctx.file_id(self.file_id);
        let session = &mut *ctx.session;
        let entry = session.resources.get_mut(&guid)?;

        let count = match &mut entry.handle {
            Handle::File(file) => file.write_at(self.offset, &self.data).await?,
            Handle::Xattr { key } => {
                entry.anchor.xattrs.set(&entry.path, key, &self.data).await?;
                self.data.len()
            }
            Handle::Pipe => session.pipe.write(&self.data)?,
        };
        Reply::record(&WriteResponse { count: count as u32 })
    }
}

#[async_trait]
impl Command for LockRequest {
    async fn handle(&self, _header: &Smb2Header, _ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        debug!(locks = self.locks.len(), "Lock acknowledged");
        Reply::ack()
    }
}

#[derive(Debug, Default)]
struct Cancel;

#[async_trait]
impl Command for Cancel {
    async fn handle(&self, header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let cancelled = ctx.session.notifications.remove(&header.message_id).is_some();
        debug!(message_id = header.message_id, cancelled, "Cancel acknowledged");
        Reply::ack()
    }
}

#[derive(Debug, Default)]
struct Echo;

#[async_trait]
impl Command for Echo {
    async fn handle(&self, _header: &Smb2Header, _ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        Reply::ack()
    }
}

#[async_trait]
impl Command for QueryDirectoryRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let guid = ctx.file_id(self.file_id);
        let entry = ctx.session.resources.get(&guid)?;
        if self.is_continuation() {
            return Err(NtStatus::NoMoreFiles.into());
        }
        if self.file_information_class != FILE_ID_BOTH_DIRECTORY_INFORMATION {
            return Err(unsupported(format!("directory class {}", self.file_information_class)));
        }

        let provider = &entry.anchor.provider;
        let listing = provider.list(&entry.path).await?;
        let infos = if self.file_name_pattern == "*" {
            let own = provider.stat(&entry.path).await?;
            let mut infos = listing;
            for dot in [".", ".."] {
                infos.push(FileInfo { name: dot.to_string(), ..own.clone() });
            }
            infos
        } else {
            let found: Vec<FileInfo> = listing
                .into_iter()
                .filter(|info| info.name == self.file_name_pattern)
                .take(1)
                .collect();
            if found.is_empty() {
                return Err(NtStatus::NoSuchFile.into());
            }
            found
        };

        let entries: Vec<FileIdBothDirInfo> = infos
            .iter()
            .enumerate()
            .map(|(i, info)| dir_entry(info, i as u64 + 1))
            .collect();
        debug!(file_id = %guid, pattern = %self.file_name_pattern, entries = entries.len(), "Directory listed");
        Reply::record(&QueryResponse { buffer: encode_directory_entries(&entries)? })
    }
}

#[async_trait]
impl Command for ChangeNotifyRequest {
    async fn handle(&self, header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let file_id = ctx.file_id(self.file_id);
        debug!(file_id = %file_id, message_id = header.message_id, filter = self.completion_filter, "Change notify pending");
        let pending = PendingNotify { file_id, request: self.clone() };
        ctx.session.notifications.insert(header.message_id, pending);
        Ok(Reply::with_status(NtStatus::Pending, build_error_response_body()))
    }
}

#[async_trait]
impl Command for QueryInfoRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        let guid = ctx.file_id(self.file_id);
        let entry = ctx.session.resources.get(&guid)?;

        let buffer = match (self.info_type, self.file_info_class) {
            (SMB2_0_INFO_FILE, FILE_ALL_INFORMATION) => {
                let info = stat_open(entry).await?;
                FileAllInfo {
                    creation_time: info.creation_time,
                    last_access_time: info.last_access_time,
                    last_write_time: info.last_write_time,
                    change_time: info.change_time,
                    file_attributes: file_attributes(&info),
                    allocation_size: info.allocation_size,
                    end_of_file: info.end_of_file,
                    number_of_links: 1,
                    delete_pending: entry.pending == Some(PendingAction::Delete),
                    is_directory: info.is_directory,
                    file_id: if info.is_directory { 0 } else { guid.sequence() },
                    ea_size: 0,
                    access_mask: ALL_ACCESS_MASK,
                    file_name: info.name,
                }
                .encode()?
            }
            (SMB2_0_INFO_FILE, FILE_STREAM_INFORMATION) => encode_stream_entries(&streams(entry).await?)?,
            (SMB2_0_INFO_FILESYSTEM, FILE_FS_ATTRIBUTE_INFORMATION) => FsAttributeInfo::default().encode()?,
            (SMB2_0_INFO_FILESYSTEM, FILE_FS_SIZE_INFORMATION) => FsSizeInfo::default().encode()?,
            (info_type, class) => {
                return Err(unsupported(format!("query info type {} class {}", info_type, class)));
            }
        };
        Reply::record(&QueryResponse { buffer })
    }
}

#[async_trait]
impl Command for SetInfoRequest {
    async fn handle(&self, _header: &Smb2Header, ctx: &mut RequestContext<'_>) -> Result<Reply, ServerError> {
        if self.info_type != SMB2_0_INFO_FILE {
            return Err(unsupported(format!("set info type {}", self.info_type)));
        }
        let guid = ctx.file_id(self.file_id);
        let entry = ctx.session.resources.get_mut(&guid)?;

        match self.file_info_class {
            FILE_BASIC_INFORMATION => {}
            FILE_DISPOSITION_INFORMATION => {
                let (disposition, _) = FileDispositionInfo::decode(&self.buffer)?;
                if disposition.delete_pending {
                    let action = match &entry.handle {
                        Handle::File(_) => PendingAction::Delete,
                        Handle::Xattr { key } => PendingAction::DeleteAttribute { key: key.clone() },
                        Handle::Pipe => return Err(unsupported("delete of a pipe".into())),
                    };
                    entry.defer(action);
                }
            }
            FILE_RENAME_INFORMATION => {
                if !matches!(entry.handle, Handle::File(_)) {
                    return Err(unsupported(format!("rename of {:?} handle", entry.handle)));
                }
                let (rename, _) = FileRenameInfo::decode(&self.buffer)?;
                let name = smb2::utf16le_to_string_strict(&rename.file_name).ok_or(NtStatus::Unsuccessful)?;
                let new_path = entry.anchor.resolve(&name).map_err(|_| NtStatus::Unsuccessful)?;
                debug!(file_id = %guid, to = ?new_path, "Rename deferred to close");
                entry.defer(PendingAction::Rename { new_path, replace_existing: rename.replace_if_exists });
            }
            class => return Err(unsupported(format!("set info class {}", class))),
        }
        Reply::record(&SetInfoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserDirectory;
    use crate::dcerpc::{
        build_pdu, parse_pdu, BindBody, NetShareEnumAllRequest, NetShareEnumAllResponse, PduHeader,
        PduType, RequestBody, ResponseBody, OPNUM_NET_SHARE_ENUM_ALL,
    };
    use crate::codec::SelfDescribing;
    use crate::ntlm::{AuthenticateMessage, ChallengeMessage, NegotiateMessage};
    use crate::resource::{Anchor, NAMED_PIPE_SHARE};
    use crate::smb2::create::{CreateAction, FILE_DIRECTORY_FILE, FILE_READ_ATTRIBUTES, GENERIC_WRITE};
    use crate::smb2::header::SMB2_HEADER_SIZE;
    use crate::smb2::query::SL_RESTART_SCAN;
    use crate::spnego::{NegTokenResp, NegotiationToken};
    use crate::vfs::{LocalProvider, MemoryXattrStore};
    use bytes::BytesMut;
    use std::path::Path;
    use tempfile::TempDir;

    const SESSION_ID: u64 = 0x171a_7b5b_99fc_5598;

    const CREATE_HEX: &str = "fe534d4240000100000000000500000100000000980000000900000000000000fffe0000000000009855fc995b7b1a170000000000000000000000000000000039000000020000000000000000000000000000000000000080000000100000000700000001000000010000007800000080000000180000000000000000000000000000001000040000000000000000004d78416300000000";
    const GETINFO_HEX: &str = "fe534d4240000100000000001000000104000000680000000a00000000000000fffe0000000000009855fc995b7b1a1700000000000000000000000000000000290001120000010000000000000000000000000000000000ffffffffffffffffffffffffffffffff";
    const CLOSE_HEX: &str = "fe534d4240000100000000000600000104000000000000000b00000000000000fffe0000000000009855fc995b7b1a17000000000000000000000000000000001800000000000000ffffffffffffffffffffffffffffffff";

    struct Users {
        root: PathBuf,
    }

    impl UserDirectory for Users {
        fn password(&self, user: &str) -> Option<String> {
            (user == "alice").then(|| "secret".to_string())
        }

        fn anchors_for(&self, _user: &str) -> Vec<Anchor> {
            vec![disk_anchor(&self.root), Anchor::named_pipe()]
        }
    }

    fn disk_anchor(root: &Path) -> Anchor {
        Anchor::new(
            "Public",
            root,
            Arc::new(LocalProvider::new(root)),
            Arc::new(MemoryXattrStore::new()),
        )
    }

    fn new_session(root: &Path) -> Session {
        let users = Arc::new(Users { root: root.to_path_buf() });
        Session::new(Arc::new(ServerState::new("SMB", users)))
    }

    /// A session that has already logged on, attached to `Public`.
    fn seeded_session(root: &Path) -> Session {
        let mut session = new_session(root);
        session.id = SESSION_ID;
        session.resources.register_anchors(vec![disk_anchor(root), Anchor::named_pipe()]);
        session.resources.set_active_anchor("public").unwrap();
        session
    }

    fn message<T: WireRecord>(command: Smb2Command, session_id: u64, body: &T) -> Vec<u8> {
        let mut out = Smb2Header::request(command.code(), 1, session_id, 0).encode().unwrap();
        out.extend_from_slice(&body.encode().unwrap());
        out
    }

    fn compound(messages: Vec<Vec<u8>>) -> Vec<u8> {
        join_chain(messages)
    }

    fn responses(reply: &[u8]) -> Vec<(Smb2Header, Vec<u8>)> {
        Chain::new(reply).map(|m| m.map(|(h, b)| (h, b.to_vec()))).collect::<Result<_, _>>().unwrap()
    }

    async fn single(session: &mut Session, frame: Vec<u8>) -> (Smb2Header, Vec<u8>) {
        let outcome = dispatch(session, &frame).await.unwrap();
        let mut all = responses(&outcome.reply);
        assert_eq!(all.len(), 1);
        all.remove(0)
    }

    fn create_request(name: &str, disposition: CreateDisposition, desired_access: u32) -> CreateRequest {
        CreateRequest {
            requested_oplock_level: 0,
            impersonation_level: 2,
            desired_access,
            file_attributes: 0,
            share_access: 7,
            create_disposition: disposition.to_wire() as u32,
            create_options: 0,
            name: name.to_string(),
            contexts: Vec::new(),
        }
    }

    async fn open(session: &mut Session, name: &str, disposition: CreateDisposition) -> Guid {
        let req = create_request(name, disposition, GENERIC_WRITE);
        let (header, body) = single(session, message(Smb2Command::Create, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::Success, "create {}", name);
        Guid::from(CreateResponse::decode(&body).unwrap().0.file_id)
    }

    #[test]
    fn test_registry_leaves_out_ioctl_and_oplock_break() {
        assert!(is_registered(Smb2Command::Create.code()));
        assert!(is_registered(Smb2Command::ChangeNotify.code()));
        assert!(!is_registered(Smb2Command::Ioctl.code()));
        assert!(!is_registered(Smb2Command::OplockBreak.code()));
    }

    #[tokio::test]
    async fn test_captured_create_getinfo_close_chain() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let tree_id = session.resources.active_anchor().unwrap().tree_id;

        let frame = hex::decode(format!("{}{}{}", CREATE_HEX, GETINFO_HEX, CLOSE_HEX)).unwrap();
        let outcome = dispatch(&mut session, &frame).await.unwrap();
        assert!(!outcome.disconnect);

        let replies = responses(&outcome.reply);
        assert_eq!(replies.len(), 3);
        for (header, _) in &replies {
            assert_eq!(header.status, NtStatus::Success);
            assert!(header.is_response());
            assert_eq!(header.session_id, SESSION_ID);
        }

        let (create, _) = CreateResponse::decode(&replies[0].1).unwrap();
        assert_eq!(create.file_id, Guid::new(tree_id, 1).bytes());
        assert_eq!(create.create_action, CreateAction::Opened);
        assert_eq!(create.file_attributes, FILE_ATTRIBUTE_DIRECTORY);
        assert_eq!(create.contexts.len(), 1);
        assert_eq!(create.contexts[0].name, CONTEXT_QUERY_MAXIMAL_ACCESS.to_vec());

        let (query, _) = QueryResponse::decode(&replies[1].1).unwrap();
        let (all, _) = FileAllInfo::decode(&query.buffer).unwrap();
        assert!(all.is_directory);

        assert_eq!(replies[2].0.command, Smb2Command::Close.code());
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_chain_offsets_match_response_lengths() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let frame = hex::decode(format!("{}{}{}", CREATE_HEX, GETINFO_HEX, CLOSE_HEX)).unwrap();
        let reply = dispatch(&mut session, &frame).await.unwrap().reply;

        let mut pos = 0;
        let mut lengths = Vec::new();
        loop {
            let (header, _) = Smb2Header::decode(&reply[pos..]).unwrap();
            if header.next_command == 0 {
                lengths.push(reply.len() - pos);
                break;
            }
            assert_eq!(header.next_command % 8, 0);
            lengths.push(header.next_command as usize);
            pos += header.next_command as usize;
        }
        assert_eq!(lengths.len(), 3);
        assert_eq!(lengths.iter().sum::<usize>(), reply.len());
        // CLOSE response: header plus the 60-byte body, last in the chain
        assert_eq!(lengths[2], SMB2_HEADER_SIZE + 60);
    }

    #[tokio::test]
    async fn test_session_mismatch_aborts_without_reply() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let frame = message(Smb2Command::Echo, SESSION_ID + 1, &PlainRequest);
        match dispatch(&mut session, &frame).await {
            Err(ServerError::SessionExpired { expected, received }) => {
                assert_eq!(expected, SESSION_ID);
                assert_eq!(received, SESSION_ID + 1);
            }
            other => panic!("expected SessionExpired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_mismatch_later_in_chain_runs_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let create = create_request("made.txt", CreateDisposition::OpenIf, GENERIC_WRITE);
        let frame = compound(vec![
            message(Smb2Command::Create, SESSION_ID, &create),
            message(Smb2Command::Echo, SESSION_ID + 1, &PlainRequest),
        ]);
        let result = dispatch(&mut session, &frame).await;
        assert!(matches!(result, Err(ServerError::SessionExpired { .. })));
        assert!(!tmp.path().join("made.txt").exists());
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_command_rejects_chain() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let create = create_request("made.txt", CreateDisposition::OpenIf, GENERIC_WRITE);
        let frame = compound(vec![
            message(Smb2Command::Create, SESSION_ID, &create),
            message(Smb2Command::Ioctl, SESSION_ID, &PlainRequest),
            message(Smb2Command::Echo, SESSION_ID, &PlainRequest),
        ]);
        let outcome = dispatch(&mut session, &frame).await.unwrap();

        let replies = responses(&outcome.reply);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.command, Smb2Command::Ioctl.code());
        assert_eq!(replies[0].0.status, NtStatus::NotImplemented);
        assert_eq!(replies[0].1, build_error_response_body());
        assert!(!tmp.path().join("made.txt").exists());
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_body_rejects_chain() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), "x").unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "keep.txt", CreateDisposition::Open).await;

        let set = SetInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_DISPOSITION_INFORMATION,
            additional_information: 0,
            file_id: guid.bytes(),
            buffer: FileDispositionInfo { delete_pending: true }.encode().unwrap(),
        };
        let mut broken = Smb2Header::request(Smb2Command::Echo.code(), 1, SESSION_ID, 0).encode().unwrap();
        broken.extend_from_slice(&[9, 0, 0, 0]);
        let frame = compound(vec![
            message(Smb2Command::SetInfo, SESSION_ID, &set),
            message(Smb2Command::Close, SESSION_ID, &CloseRequest::new(0, guid.bytes())),
            broken,
        ]);
        let outcome = dispatch(&mut session, &frame).await.unwrap();

        let replies = responses(&outcome.reply);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.status, NtStatus::InvalidParameter);
        assert!(tmp.path().join("keep.txt").exists());
        assert!(session.resources.is_open(&guid));
        assert!(session.resources.get(&guid).unwrap().pending.is_none());
    }

    #[tokio::test]
    async fn test_malformed_later_header_rejects_chain() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let create = create_request("made.txt", CreateDisposition::OpenIf, GENERIC_WRITE);
        let mut frame = compound(vec![
            message(Smb2Command::Create, SESSION_ID, &create),
            message(Smb2Command::Echo, SESSION_ID, &PlainRequest),
        ]);
        let second = frame.len() - (SMB2_HEADER_SIZE + 4);
        frame.truncate(second + 10);
        assert!(dispatch(&mut session, &frame).await.is_err());
        assert!(!tmp.path().join("made.txt").exists());
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "a.txt", CreateDisposition::OpenIf).await;
        assert!(session.resources.is_open(&guid));

        let close = message(Smb2Command::Close, SESSION_ID, &CloseRequest::new(0, guid.bytes()));
        let (first, _) = single(&mut session, close.clone()).await;
        assert_eq!(first.status, NtStatus::Success);
        assert!(!session.resources.is_open(&guid));

        let (second, body) = single(&mut session, close).await;
        assert_eq!(second.status, NtStatus::FileClosed);
        assert_eq!(body, build_error_response_body());
    }

    #[tokio::test]
    async fn test_close_with_bad_structure_size() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "a.txt", CreateDisposition::OpenIf).await;
        let req = CloseRequest { structure_size: 23, flags: 0, file_id: guid.bytes() };
        let (header, _) = single(&mut session, message(Smb2Command::Close, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::InvalidParameter);
        assert!(session.resources.is_open(&guid));
    }

    #[tokio::test]
    async fn test_post_query_close_of_vanished_file() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "gone.txt", CreateDisposition::OpenIf).await;
        std::fs::remove_file(tmp.path().join("gone.txt")).unwrap();

        let req = CloseRequest::new(CLOSE_FLAG_POSTQUERY_ATTRIB, guid.bytes());
        let (header, body) = single(&mut session, message(Smb2Command::Close, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::Success);
        let (response, _) = CloseResponse::decode(&body).unwrap();
        assert_eq!(response, CloseResponse::default());
        assert!(!session.resources.is_open(&guid));
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_create_dispositions() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());

        let req = create_request("missing.txt", CreateDisposition::Open, FILE_READ_ATTRIBUTES);
        let (header, _) = single(&mut session, message(Smb2Command::Create, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::ObjectNameNotFound);

        let mut req = create_request("x", CreateDisposition::Open, 0);
        req.create_disposition = 9;
        let (header, _) = single(&mut session, message(Smb2Command::Create, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::InvalidParameter);

        let mut req = create_request("newdir", CreateDisposition::Create, FILE_READ_ATTRIBUTES);
        req.file_attributes = FILE_ATTRIBUTE_DIRECTORY;
        req.create_options = FILE_DIRECTORY_FILE;
        let (header, body) = single(&mut session, message(Smb2Command::Create, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::Success);
        assert!(tmp.path().join("newdir").is_dir());
        let (created, _) = CreateResponse::decode(&body).unwrap();
        assert_eq!(created.create_action, CreateAction::Created);
        assert!(created.contexts.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "data.bin", CreateDisposition::OverwriteIf).await;

        let write = WriteRequest {
            length: 5,
            offset: 0,
            file_id: guid.bytes(),
            remaining_bytes: 0,
            flags: 0,
            data: b"hello".to_vec(),
        };
        let (header, body) = single(&mut session, message(Smb2Command::Write, SESSION_ID, &write)).await;
        assert_eq!(header.status, NtStatus::Success);
        assert_eq!(WriteResponse::decode(&body).unwrap().0.count, 5);

        let read = ReadRequest {
            flags: 0,
            length: 64,
            offset: 1,
            file_id: guid.bytes(),
            minimum_count: 0,
            remaining_bytes: 0,
        };
        let (header, body) = single(&mut session, message(Smb2Command::Read, SESSION_ID, &read)).await;
        assert_eq!(header.status, NtStatus::Success);
        assert_eq!(ReadResponse::decode(&body).unwrap().0.data, b"ello");

        let past_end = ReadRequest { offset: 5, ..read };
        let (header, _) = single(&mut session, message(Smb2Command::Read, SESSION_ID, &past_end)).await;
        assert_eq!(header.status, NtStatus::EndOfFile);
    }

    #[tokio::test]
    async fn test_attribute_handle_reads_and_writes_value() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("tagged.txt"), "x").unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "tagged.txt:com.apple.FinderInfo", CreateDisposition::OpenIf).await;

        let write = WriteRequest {
            length: 4,
            offset: 0,
            file_id: guid.bytes(),
            remaining_bytes: 0,
            flags: 0,
            data: b"TEXT".to_vec(),
        };
        let (header, _) = single(&mut session, message(Smb2Command::Write, SESSION_ID, &write)).await;
        assert_eq!(header.status, NtStatus::Success);

        let anchor = session.resources.active_anchor().unwrap().clone();
        let value = anchor.xattrs.get(&tmp.path().join("tagged.txt"), "com.apple.FinderInfo").await.unwrap();
        assert_eq!(value, b"TEXT");

        let query = QueryInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_STREAM_INFORMATION,
            output_buffer_length: 4096,
            additional_information: 0,
            flags: 0,
            file_id: guid.bytes(),
            input: Vec::new(),
        };
        let (header, body) = single(&mut session, message(Smb2Command::QueryInfo, SESSION_ID, &query)).await;
        assert_eq!(header.status, NtStatus::Success);
        let (query, _) = QueryResponse::decode(&body).unwrap();
        let streams = crate::smb2::info::decode_stream_entries(&query.buffer).unwrap();
        let names: Vec<_> = streams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["::$DATA", ":com.apple.FinderInfo:$DATA"]);
    }

    #[tokio::test]
    async fn test_rename_is_deferred_to_close() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("old.txt"), "contents").unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "old.txt", CreateDisposition::Open).await;

        let rename = FileRenameInfo {
            replace_if_exists: false,
            root_directory: 0,
            file_name: smb2::string_to_utf16le("new.txt"),
        };
        let set = SetInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_RENAME_INFORMATION,
            additional_information: 0,
            file_id: guid.bytes(),
            buffer: rename.encode().unwrap(),
        };
        let (header, _) = single(&mut session, message(Smb2Command::SetInfo, SESSION_ID, &set)).await;
        assert_eq!(header.status, NtStatus::Success);
        assert!(tmp.path().join("old.txt").exists());

        let close = message(Smb2Command::Close, SESSION_ID, &CloseRequest::new(0, guid.bytes()));
        single(&mut session, close).await;
        assert!(!tmp.path().join("old.txt").exists());
        assert_eq!(std::fs::read_to_string(tmp.path().join("new.txt")).unwrap(), "contents");
    }

    #[tokio::test]
    async fn test_rename_with_invalid_name_fails_immediately() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("old.txt"), "x").unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "old.txt", CreateDisposition::Open).await;

        let rename = FileRenameInfo { replace_if_exists: false, root_directory: 0, file_name: vec![0x00, 0xD8] };
        let set = SetInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_RENAME_INFORMATION,
            additional_information: 0,
            file_id: guid.bytes(),
            buffer: rename.encode().unwrap(),
        };
        let (header, _) = single(&mut session, message(Smb2Command::SetInfo, SESSION_ID, &set)).await;
        assert_eq!(header.status, NtStatus::Unsuccessful);
        assert!(session.resources.get(&guid).unwrap().pending.is_none());
    }

    #[tokio::test]
    async fn test_delete_on_close_through_sentinel() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("doomed.txt"), "x").unwrap();
        let mut session = seeded_session(tmp.path());

        let create = create_request("doomed.txt", CreateDisposition::Open, 0);
        let set = SetInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_DISPOSITION_INFORMATION,
            additional_information: 0,
            file_id: [0xFF; 16],
            buffer: FileDispositionInfo { delete_pending: true }.encode().unwrap(),
        };
        let frame = compound(vec![
            message(Smb2Command::Create, SESSION_ID, &create),
            message(Smb2Command::SetInfo, SESSION_ID, &set),
            message(Smb2Command::Close, SESSION_ID, &CloseRequest::new(0, [0xFF; 16])),
        ]);
        let outcome = dispatch(&mut session, &frame).await.unwrap();

        let replies = responses(&outcome.reply);
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|(h, _)| h.status == NtStatus::Success));
        assert!(!tmp.path().join("doomed.txt").exists());
        assert_eq!(session.resources.open_count(), 0);
    }

    #[tokio::test]
    async fn test_query_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "abc").unwrap();
        std::fs::write(tmp.path().join("empty.txt"), "").unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "", CreateDisposition::Open).await;

        let mut req = QueryDirectoryRequest {
            file_information_class: FILE_ID_BOTH_DIRECTORY_INFORMATION,
            flags: SL_RESTART_SCAN,
            file_index: 0,
            file_id: guid.bytes(),
            file_name_pattern: "*".to_string(),
            output_buffer_length: 65536,
        };
        let (header, body) = single(&mut session, message(Smb2Command::QueryDirectory, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::Success);
        let (listing, _) = QueryResponse::decode(&body).unwrap();
        let entries = crate::smb2::info::decode_directory_entries(&listing.buffer).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "empty.txt", ".", ".."]);
        assert_eq!(entries[0].ea_size, 3);
        assert_eq!(entries[1].ea_size, PLACEHOLDER_EA_SIZE);
        assert_eq!(entries[2].ea_size, PLACEHOLDER_EA_SIZE);

        req.file_name_pattern = "nope.txt".to_string();
        let (header, _) = single(&mut session, message(Smb2Command::QueryDirectory, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::NoSuchFile);

        req.flags = 0;
        let (header, _) = single(&mut session, message(Smb2Command::QueryDirectory, SESSION_ID, &req)).await;
        assert_eq!(header.status, NtStatus::NoMoreFiles);
    }

    #[tokio::test]
    async fn test_unsupported_query_info_class() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let guid = open(&mut session, "", CreateDisposition::Open).await;
        let query = QueryInfoRequest {
            info_type: SMB2_0_INFO_FILE,
            file_info_class: FILE_BASIC_INFORMATION,
            output_buffer_length: 4096,
            additional_information: 0,
            flags: 0,
            file_id: guid.bytes(),
            input: Vec::new(),
        };
        let (header, _) = single(&mut session, message(Smb2Command::QueryInfo, SESSION_ID, &query)).await;
        assert_eq!(header.status, NtStatus::NotSupported);
    }

    #[tokio::test]
    async fn test_change_notify_is_pending() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let dir = open(&mut session, "", CreateDisposition::Open).await;
        let req = ChangeNotifyRequest {
            flags: 0,
            output_buffer_length: 4096,
            file_id: dir.bytes(),
            completion_filter: 0x17,
        };
        let mut frame = Smb2Header::request(Smb2Command::ChangeNotify.code(), 7, SESSION_ID, 0).encode().unwrap();
        frame.extend_from_slice(&req.encode().unwrap());
        let (header, body) = single(&mut session, frame).await;
        assert_eq!(header.status, NtStatus::Pending);
        assert_eq!(body, build_error_response_body());

        let pending = session.pending_notify(7).unwrap();
        assert_eq!(pending.file_id, dir);
        assert_eq!(pending.request, req);
    }

    #[tokio::test]
    async fn test_cancel_and_close_drop_pending_notify() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let dir = open(&mut session, "", CreateDisposition::Open).await;
        let req = ChangeNotifyRequest {
            flags: 0,
            output_buffer_length: 4096,
            file_id: dir.bytes(),
            completion_filter: 0x17,
        };
        let notify = |message_id: u64| {
            let mut frame =
                Smb2Header::request(Smb2Command::ChangeNotify.code(), message_id, SESSION_ID, 0).encode().unwrap();
            frame.extend_from_slice(&req.encode().unwrap());
            frame
        };
        single(&mut session, notify(7)).await;
        single(&mut session, notify(8)).await;

        let mut cancel = Smb2Header::request(Smb2Command::Cancel.code(), 7, SESSION_ID, 0).encode().unwrap();
        cancel.extend_from_slice(&PlainRequest.encode().unwrap());
        let (header, _) = single(&mut session, cancel).await;
        assert_eq!(header.status, NtStatus::Success);
        assert!(session.pending_notify(7).is_none());
        assert!(session.pending_notify(8).is_some());

        let close = message(Smb2Command::Close, SESSION_ID, &CloseRequest::new(0, dir.bytes()));
        single(&mut session, close).await;
        assert!(session.pending_notify(8).is_none());
    }

    #[tokio::test]
    async fn test_share_enumeration_over_pipe() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let connect = TreeConnectRequest { flags: 0, path: format!("\\\\host\\{}", NAMED_PIPE_SHARE) };
        let (header, body) = single(&mut session, message(Smb2Command::TreeConnect, SESSION_ID, &connect)).await;
        assert_eq!(header.status, NtStatus::Success);
        assert_eq!(TreeConnectResponse::decode(&body).unwrap().0.share_type, SHARE_TYPE_PIPE);

        let pipe = open(&mut session, SRVSVC_PIPE, CreateDisposition::Open).await;
        let write = |data: Vec<u8>| WriteRequest {
            length: data.len() as u32,
            offset: 0,
            file_id: pipe.bytes(),
            remaining_bytes: 0,
            flags: 0,
            data,
        };
        let read = ReadRequest {
            flags: 0,
            length: 4280,
            offset: 0,
            file_id: pipe.bytes(),
            minimum_count: 0,
            remaining_bytes: 0,
        };

        let bind = build_pdu(&PduHeader::new(PduType::Bind, 1), &BindBody::srvsvc().encode().unwrap()).unwrap();
        let (header, _) = single(&mut session, message(Smb2Command::Write, SESSION_ID, &write(bind))).await;
        assert_eq!(header.status, NtStatus::Success);
        let (_, body) = single(&mut session, message(Smb2Command::Read, SESSION_ID, &read)).await;
        let data = ReadResponse::decode(&body).unwrap().0.data;
        assert_eq!(parse_pdu(&data).unwrap().0.packet_type, PduType::BindAck);

        let mut stub = BytesMut::new();
        NetShareEnumAllRequest { server_unc: "\\\\host".into(), level: 1 }.encode_self(&mut stub);
        let request = RequestBody {
            alloc_hint: stub.len() as u32,
            context_id: 0,
            opnum: OPNUM_NET_SHARE_ENUM_ALL,
            stub: stub.to_vec(),
        };
        let pdu = build_pdu(&PduHeader::new(PduType::Request, 2), &request.encode().unwrap()).unwrap();
        single(&mut session, message(Smb2Command::Write, SESSION_ID, &write(pdu))).await;
        let (_, body) = single(&mut session, message(Smb2Command::Read, SESSION_ID, &read)).await;
        let data = ReadResponse::decode(&body).unwrap().0.data;

        let (header, body) = parse_pdu(&data).unwrap();
        assert_eq!(header.packet_type, PduType::Response);
        let (response, _) = ResponseBody::decode(body).unwrap();
        let (shares, _) = NetShareEnumAllResponse::decode(&response.stub).unwrap();
        assert_eq!(shares.total_entries, 2);
        let names: Vec<_> = shares.ctr.entries.iter().map(|e| (e.name.as_str(), e.comment.as_str())).collect();
        assert_eq!(names, vec![("Public", ""), ("IPC$", "IPC Service")]);
    }

    #[tokio::test]
    async fn test_tree_connect_unknown_share() {
        let tmp = TempDir::new().unwrap();
        let mut session = seeded_session(tmp.path());
        let connect = TreeConnectRequest { flags: 0, path: "\\\\host\\nowhere".into() };
        let (header, _) = single(&mut session, message(Smb2Command::TreeConnect, SESSION_ID, &connect)).await;
        assert_eq!(header.status, NtStatus::NetworkNameDeleted);
    }

    fn negotiate_request() -> NegotiateRequest {
        NegotiateRequest {
            security_mode: NEGOTIATE_SIGNING_ENABLED,
            capabilities: 0,
            client_guid: [7; 16],
            dialects: vec![0x0202, 0x0210, 0x0300],
        }
    }

    fn setup(token: Vec<u8>) -> SessionSetupRequest {
        SessionSetupRequest {
            flags: 0,
            security_mode: 1,
            capabilities: 0,
            previous_session_id: 0,
            security_buffer: token,
        }
    }

    /// Negotiate and run the first SESSION_SETUP leg.
    async fn challenge(session: &mut Session) -> (u64, ChallengeMessage) {
        let (header, body) = single(session, message(Smb2Command::Negotiate, 0, &negotiate_request())).await;
        assert_eq!(header.status, NtStatus::Success);
        let (negotiated, _) = NegotiateResponse::decode(&body).unwrap();
        assert_eq!(negotiated.dialect, Dialect::Smb210);
        assert_eq!(negotiated.security_mode, NEGOTIATE_SIGNING_ENABLED);
        assert_eq!(u16::from_le_bytes([body[56], body[57]]), 0x80);

        let leg1 = NegTokenInit::ntlm(Some(NegotiateMessage::new("", "WS").encode().unwrap())).encode();
        let (header, body) = single(session, message(Smb2Command::SessionSetup, 0, &setup(leg1))).await;
        assert_eq!(header.status, NtStatus::MoreProcessingRequired);
        assert_eq!(header.credits, SETUP_CREDITS);
        assert_ne!(header.session_id, 0);
        let (response, _) = SessionSetupResponse::decode(&body).unwrap();
        let token = NegotiationToken::parse(&response.security_buffer).unwrap();
        let (challenge, _) = ChallengeMessage::decode(token.mech_token().unwrap()).unwrap();
        (header.session_id, challenge)
    }

    fn leg2(challenge: &ChallengeMessage, password: &str) -> Vec<u8> {
        let msg = AuthenticateMessage::respond(challenge, "alice", password, "", "WS", [1; 8], 0).unwrap();
        NegTokenResp::response(msg.encode().unwrap()).encode()
    }

    #[tokio::test]
    async fn test_logon_attaches_anchors() {
        let tmp = TempDir::new().unwrap();
        let mut session = new_session(tmp.path());
        let (id, challenge) = challenge(&mut session).await;

        let frame = message(Smb2Command::SessionSetup, id, &setup(leg2(&challenge, "secret")));
        let (header, _) = single(&mut session, frame).await;
        assert_eq!(header.status, NtStatus::Success);
        assert_eq!(header.credits, 1);
        assert!(session.is_authenticated());
        assert_eq!(session.id(), id);
        assert_eq!(session.resources().anchors().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_password_disconnects() {
        let tmp = TempDir::new().unwrap();
        let mut session = new_session(tmp.path());
        let (id, challenge) = challenge(&mut session).await;

        let frame = message(Smb2Command::SessionSetup, id, &setup(leg2(&challenge, "guess")));
        let outcome = dispatch(&mut session, &frame).await.unwrap();
        assert!(outcome.disconnect);
        let replies = responses(&outcome.reply);
        assert_eq!(replies[0].0.status, NtStatus::LogonFailure);
        assert!(!session.is_authenticated());
        assert!(session.resources().anchors().is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_without_smb21() {
        let tmp = TempDir::new().unwrap();
        let mut session = new_session(tmp.path());
        let req = NegotiateRequest { dialects: vec![0x0202], ..negotiate_request() };
        let (header, _) = single(&mut session, message(Smb2Command::Negotiate, 0, &req)).await;
        assert_eq!(header.status, NtStatus::NotSupported);
        assert_eq!(session.dialect(), None);
    }

    #[test]
    fn test_legacy_negotiate_response() {
        let tmp = TempDir::new().unwrap();
        let session = new_session(tmp.path());
        let out = legacy_negotiate(&session).unwrap();
        let (header, used) = Smb2Header::decode(&out).unwrap();
        assert_eq!(header.credits, 1);
        assert_eq!(header.credit_charge, 0);
        assert!(header.is_response());
        let (response, _) = NegotiateResponse::decode(&out[used..]).unwrap();
        assert_eq!(response.dialect, Dialect::Wildcard);
        assert_eq!(response.reserved, 1);
        assert!(NegotiationToken::parse(&response.security_buffer).is_ok());
    }
}
