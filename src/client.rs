//! SMB2 client: negotiate, the two NTLMv2 SESSION_SETUP legs, and tree
//! connects. Requests are sent one at a time and each waits for its
//! response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{WireEnum, WireRecord};
use crate::error::ServerError;
use crate::ntlm::{AuthenticateMessage, ChallengeMessage, NegotiateMessage};
use crate::smb2::ack::{AckResponse, PlainRequest};
use crate::smb2::header::Smb2Header;
use crate::smb2::negotiate::{
    NegotiateRequest, NegotiateResponse, NEGOTIATE_SIGNING_ENABLED, NEGOTIATE_SIGNING_REQUIRED,
};
use crate::smb2::session::{SessionSetupRequest, SessionSetupResponse};
use crate::smb2::status::NtStatus;
use crate::smb2::tree::TreeConnectRequest;
use crate::smb2::{Dialect, Smb2Command};
use crate::spnego::{NegTokenInit, NegTokenResp, NegotiationToken};
use crate::transport;
use crate::vfs::filetime_now;

/// Dialects offered by the client.
const CLIENT_DIALECTS: [Dialect; 3] = [Dialect::Smb210, Dialect::Smb300, Dialect::Smb302];

/// Connection and credential settings.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub workstation: String,
    pub domain: String,
    pub user: String,
    pub password: String,
}

impl ClientOptions {
    pub fn validate(&self) -> std::io::Result<()> {
        if self.host.is_empty() {
            return Err(invalid("Missing required option: host"));
        }
        if self.port == 0 {
            return Err(invalid("Invalid or missing value: port"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

/// An authenticated client session.
pub struct Client {
    stream: TcpStream,
    message_id: AtomicU64,
    session_id: u64,
    dialect: Option<Dialect>,
    signing_required: bool,
    authenticated: bool,
    trees: HashMap<String, u32>,
    options: ClientOptions,
}

impl Client {
    /// Connect, negotiate, and log on.
    pub async fn connect(options: ClientOptions) -> Result<Client, ServerError> {
        options.validate()?;
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let mut client = Client {
            stream,
            message_id: AtomicU64::new(0),
            session_id: 0,
            dialect: None,
            signing_required: false,
            authenticated: false,
            trees: HashMap::new(),
            options,
        };

        debug!(host = %client.options.host, port = client.options.port, "Negotiating protocol");
        client.negotiate().await?;
        let challenge = client.session_setup_negotiate().await?;
        client.session_setup_authenticate(&challenge).await?;
        info!(user = %client.options.user, session_id = client.session_id, "Logged on");
        Ok(client)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn signing_required(&self) -> bool {
        self.signing_required
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Tree id of a connected share.
    pub fn tree_id(&self, name: &str) -> Option<u32> {
        self.trees.get(name).copied()
    }

    fn next_message_id(&self) -> u64 {
        self.message_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Send one request and return the response header and body, whatever
    /// its status.
    pub async fn call<R: WireRecord>(
        &mut self,
        command: Smb2Command,
        tree_id: u32,
        request: &R,
    ) -> Result<(Smb2Header, Vec<u8>), ServerError> {
        let header = Smb2Header::request(command.code(), self.next_message_id(), self.session_id, tree_id);
        let mut frame = header.encode()?;
        frame.extend_from_slice(&request.encode()?);
        transport::write_frame(&mut self.stream, &frame).await?;

        let reply = transport::read_frame(&mut self.stream).await?;
        let (response, used) = Smb2Header::decode(&reply)?;
        if response.message_id != header.message_id {
            return Err(ServerError::ProtocolViolation(format!(
                "response to message {} while waiting for {}",
                response.message_id, header.message_id
            )));
        }
        Ok((response, reply[used..].to_vec()))
    }

    /// Like [`Client::call`], failing on any status but success.
    async fn expect_success<R: WireRecord>(
        &mut self,
        command: Smb2Command,
        tree_id: u32,
        request: &R,
    ) -> Result<(Smb2Header, Vec<u8>), ServerError> {
        let (header, body) = self.call(command, tree_id, request).await?;
        if header.status != NtStatus::Success {
            return Err(ServerError::Resource(header.status));
        }
        Ok((header, body))
    }

    async fn negotiate(&mut self) -> Result<(), ServerError> {
        let request = NegotiateRequest {
            security_mode: NEGOTIATE_SIGNING_ENABLED,
            capabilities: 0,
            client_guid: [0; 16],
            dialects: CLIENT_DIALECTS.iter().map(|d| d.to_wire() as u16).collect(),
        };
        let (_, body) = self
            .expect_success(Smb2Command::Negotiate, 0, &request)
            .await
            .map_err(|e| ServerError::ProtocolViolation(format!("negotiate failed: {}", e)))?;
        let (response, _) = NegotiateResponse::decode(&body)?;

        match NegotiationToken::parse(&response.security_buffer)? {
            NegotiationToken::Init(init) if init.offers_ntlm() => {}
            _ => return Err(ServerError::ProtocolViolation("server does not support NTLMSSP".into())),
        }

        self.dialect = Some(response.dialect);
        self.signing_required = response.security_mode & NEGOTIATE_SIGNING_ENABLED != 0
            && response.security_mode & NEGOTIATE_SIGNING_REQUIRED != 0;
        debug!(dialect = ?response.dialect, signing_required = self.signing_required, "Negotiated");
        Ok(())
    }

    /// First leg: send the NTLM NEGOTIATE_MESSAGE, keep the session id the
    /// server assigns, and return its challenge.
    async fn session_setup_negotiate(&mut self) -> Result<ChallengeMessage, ServerError> {
        let negotiate = NegotiateMessage::new(&self.options.domain, &self.options.workstation).encode()?;
        let request = setup_request(NegTokenInit::ntlm(Some(negotiate)).encode());
        let (header, body) = self.call(Smb2Command::SessionSetup, 0, &request).await?;
        if header.status != NtStatus::MoreProcessingRequired {
            return Err(ServerError::AuthenticationFailure(format!(
                "first SESSION_SETUP answered {:?}",
                header.status
            )));
        }
        self.session_id = header.session_id;

        let (response, _) = SessionSetupResponse::decode(&body)?;
        let token = NegotiationToken::parse(&response.security_buffer)?;
        let blob = token
            .mech_token()
            .ok_or_else(|| ServerError::AuthenticationFailure("no NTLM challenge in reply".into()))?;
        Ok(ChallengeMessage::decode(blob)?.0)
    }

    /// Second leg: answer the challenge with an NTLMv2 response.
    async fn session_setup_authenticate(&mut self, challenge: &ChallengeMessage) -> Result<(), ServerError> {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let opts = &self.options;
        let auth = AuthenticateMessage::respond(
            challenge,
            &opts.user,
            &opts.password,
            &opts.domain,
            &opts.workstation,
            nonce,
            filetime_now(),
        )?;
        let request = setup_request(NegTokenResp::response(auth.encode()?).encode());
        let (header, _) = self.call(Smb2Command::SessionSetup, 0, &request).await?;
        if header.status != NtStatus::Success {
            return Err(ServerError::AuthenticationFailure(format!(
                "logon as '{}' answered {:?}",
                self.options.user, header.status
            )));
        }
        self.authenticated = true;
        Ok(())
    }

    /// Attach to share `name`, returning its tree id.
    pub async fn tree_connect(&mut self, name: &str) -> Result<u32, ServerError> {
        debug!(share = %name, "Sending TreeConnect");
        let request = TreeConnectRequest { flags: 0, path: format!("\\\\{}\\{}", self.options.host, name) };
        let (header, _) = self.expect_success(Smb2Command::TreeConnect, 0, &request).await?;
        self.trees.insert(name.to_string(), header.tree_id);
        Ok(header.tree_id)
    }

    pub async fn tree_disconnect(&mut self, name: &str) -> Result<(), ServerError> {
        let tree_id = self
            .tree_id(name)
            .ok_or_else(|| ServerError::ProtocolViolation(format!("no tree connected for '{}'", name)))?;
        debug!(share = %name, tree_id, "Sending TreeDisconnect");
        let (_, body) = self.expect_success(Smb2Command::TreeDisconnect, tree_id, &PlainRequest).await?;
        AckResponse::decode(&body)?;
        self.trees.remove(name);
        Ok(())
    }

    /// Disconnect every tree and close the connection.
    pub async fn close(mut self) -> Result<(), ServerError> {
        let names: Vec<String> = self.trees.keys().cloned().collect();
        for name in names {
            self.tree_disconnect(&name).await?;
        }
        debug!(session_id = self.session_id, "Session closed");
        Ok(())
    }
}

fn setup_request(security_buffer: Vec<u8>) -> SessionSetupRequest {
    SessionSetupRequest {
        flags: 0,
        security_mode: NEGOTIATE_SIGNING_ENABLED as u8,
        capabilities: 0,
        previous_session_id: 0,
        security_buffer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserDirectory;
    use crate::codec::SelfDescribing;
    use crate::dcerpc::{
        build_pdu, parse_pdu, BindBody, NetShareEnumAllRequest, NetShareEnumAllResponse, PduHeader,
        PduType, RequestBody, ResponseBody, OPNUM_NET_SHARE_ENUM_ALL,
    };
    use crate::resource::{Anchor, Guid, SRVSVC_PIPE};
    use crate::server::{handle_connection, ServerState};
    use crate::smb2::create::{CreateAction, CreateRequest, CreateResponse, GENERIC_READ};
    use crate::smb2::read::{ReadRequest, ReadResponse};
    use crate::smb2::write::WriteRequest;
    use crate::vfs::{LocalProvider, MemoryXattrStore};
    use bytes::BytesMut;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct Users {
        root: PathBuf,
    }

    impl UserDirectory for Users {
        fn password(&self, user: &str) -> Option<String> {
            (user == "alice").then(|| "secret".to_string())
        }

        fn anchors_for(&self, _user: &str) -> Vec<Anchor> {
            vec![
                Anchor::new(
                    "Public",
                    self.root.clone(),
                    Arc::new(LocalProvider::new(self.root.clone())),
                    Arc::new(MemoryXattrStore::new()),
                ),
                Anchor::named_pipe(),
            ]
        }
    }

    /// Serve one connection on a loopback port.
    async fn spawn_server(root: PathBuf) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::new("SMB", Arc::new(Users { root })));
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_connection(stream, state).await;
        });
        port
    }

    fn options(port: u16, password: &str) -> ClientOptions {
        ClientOptions {
            host: "127.0.0.1".into(),
            port,
            workstation: "WS".into(),
            domain: String::new(),
            user: "alice".into(),
            password: password.into(),
        }
    }

    #[test]
    fn test_validate_options() {
        assert!(options(445, "x").validate().is_ok());
        let err = ClientOptions { host: String::new(), ..options(445, "x") }.validate().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(options(0, "x").validate().is_err());
    }

    #[tokio::test]
    async fn test_logon_and_tree_connect() {
        let tmp = TempDir::new().unwrap();
        let port = spawn_server(tmp.path().to_path_buf()).await;

        let mut client = Client::connect(options(port, "secret")).await.unwrap();
        assert!(client.is_authenticated());
        assert_ne!(client.session_id(), 0);
        assert_eq!(client.dialect(), Some(Dialect::Smb210));
        assert!(!client.signing_required());

        let tree_id = client.tree_connect("Public").await.unwrap();
        assert_eq!(client.tree_id("Public"), Some(tree_id));
        let err = client.tree_connect("Missing").await.unwrap_err();
        assert!(matches!(err, ServerError::Resource(NtStatus::NetworkNameDeleted)));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let tmp = TempDir::new().unwrap();
        let port = spawn_server(tmp.path().to_path_buf()).await;
        match Client::connect(options(port, "guess")).await {
            Err(ServerError::AuthenticationFailure(_)) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("logon with a wrong password succeeded"),
        }
    }

    #[tokio::test]
    async fn test_share_enumeration_over_tcp() {
        let tmp = TempDir::new().unwrap();
        let port = spawn_server(tmp.path().to_path_buf()).await;
        let mut client = Client::connect(options(port, "secret")).await.unwrap();
        let ipc = client.tree_connect("IPC$").await.unwrap();

        let create = CreateRequest {
            requested_oplock_level: 0,
            impersonation_level: 2,
            desired_access: GENERIC_READ,
            file_attributes: 0,
            share_access: 3,
            create_disposition: 1,
            create_options: 0,
            name: SRVSVC_PIPE.to_string(),
            contexts: Vec::new(),
        };
        let (_, body) = client.expect_success(Smb2Command::Create, ipc, &create).await.unwrap();
        let pipe = Guid::from(CreateResponse::decode(&body).unwrap().0.file_id);
        assert_eq!(CreateResponse::decode(&body).unwrap().0.create_action, CreateAction::Opened);

        let read = ReadRequest {
            flags: 0,
            length: 4280,
            offset: 0,
            file_id: pipe.bytes(),
            minimum_count: 0,
            remaining_bytes: 0,
        };
        let write = |data: Vec<u8>| WriteRequest {
            length: data.len() as u32,
            offset: 0,
            file_id: pipe.bytes(),
            remaining_bytes: 0,
            flags: 0,
            data,
        };

        let bind = build_pdu(&PduHeader::new(PduType::Bind, 1), &BindBody::srvsvc().encode().unwrap()).unwrap();
        client.expect_success(Smb2Command::Write, ipc, &write(bind)).await.unwrap();
        let (_, body) = client.expect_success(Smb2Command::Read, ipc, &read).await.unwrap();
        let ack = ReadResponse::decode(&body).unwrap().0.data;
        assert_eq!(parse_pdu(&ack).unwrap().0.packet_type, PduType::BindAck);

        let mut stub = BytesMut::new();
        NetShareEnumAllRequest { server_unc: "\\\\127.0.0.1".into(), level: 1 }.encode_self(&mut stub);
        let call = RequestBody {
            alloc_hint: stub.len() as u32,
            context_id: 0,
            opnum: OPNUM_NET_SHARE_ENUM_ALL,
            stub: stub.to_vec(),
        };
        let pdu = build_pdu(&PduHeader::new(PduType::Request, 2), &call.encode().unwrap()).unwrap();
        client.expect_success(Smb2Command::Write, ipc, &write(pdu)).await.unwrap();
        let (_, body) = client.expect_success(Smb2Command::Read, ipc, &read).await.unwrap();
        let data = ReadResponse::decode(&body).unwrap().0.data;

        let (_, rpc_body) = parse_pdu(&data).unwrap();
        let (response, _) = ResponseBody::decode(rpc_body).unwrap();
        let (shares, _) = NetShareEnumAllResponse::decode(&response.stub).unwrap();
        let names: Vec<_> = shares.ctr.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Public", "IPC$"]);
        assert_eq!(shares.ctr.entries[1].comment, "IPC Service");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_command_is_not_implemented() {
        let tmp = TempDir::new().unwrap();
        let port = spawn_server(tmp.path().to_path_buf()).await;
        let mut client = Client::connect(options(port, "secret")).await.unwrap();
        let (header, _) = client.call(Smb2Command::Ioctl, 0, &PlainRequest).await.unwrap();
        assert_eq!(header.status, NtStatus::NotImplemented);
        let (header, _) = client.call(Smb2Command::Echo, 0, &PlainRequest).await.unwrap();
        assert_eq!(header.status, NtStatus::Success);
    }
}
