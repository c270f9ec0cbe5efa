//! SMB2 server: shared server state and the per-connection loop.
//!
//! Each TCP connection runs as an independent async task that owns its
//! [`Session`]: frames are read, dispatched in order, and answered on the
//! same stream. Nothing mutable is shared between connections.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::auth::UserDirectory;
use crate::dispatch::{self, Session};
use crate::error::ServerError;
use crate::smb2::header::{SMB1_MAGIC, SMB2_HEADER_SIZE};
use crate::transport;
use crate::vfs::filetime_now;

/// Shared, immutable server state (one per server process).
pub struct ServerState {
    pub server_name: String,
    pub server_guid: [u8; 16],
    /// FILETIME at which the server started.
    pub start_time: u64,
    pub users: Arc<dyn UserDirectory>,
}

impl ServerState {
    pub fn new(server_name: impl Into<String>, users: Arc<dyn UserDirectory>) -> Self {
        let mut guid = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut guid);
        ServerState {
            server_name: server_name.into(),
            server_guid: guid,
            start_time: filetime_now(),
            users,
        }
    }
}

/// Serve one connection until the peer hangs up or the session is torn
/// down. A session id mismatch or a failed logon ends the connection.
pub async fn handle_connection<S>(mut stream: S, state: Arc<ServerState>) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(state);
    let mut bridged = false;

    loop {
        let frame = match transport::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(session_id = session.id(), "Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if frame.len() < SMB2_HEADER_SIZE && !frame.starts_with(&SMB1_MAGIC) {
            warn!(len = frame.len(), "Frame shorter than an SMB2 header");
            return Ok(());
        }

        if frame.starts_with(&SMB1_MAGIC) {
            if bridged {
                warn!("Second SMB1 negotiate, dropping connection");
                return Ok(());
            }
            bridged = true;
            debug!("SMB1 negotiate, answering with the SMB2 wildcard dialect");
            transport::write_frame(&mut stream, &dispatch::legacy_negotiate(&session)?).await?;
            continue;
        }

        let outcome = match dispatch::dispatch(&mut session, &frame).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = session.id(), "Dropping connection: {}", e);
                return Ok(());
            }
        };
        transport::write_frame(&mut stream, &outcome.reply).await?;

        if outcome.disconnect {
            info!(session_id = session.id(), "Logon failed, closing connection");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireRecord;
    use crate::resource::Anchor;
    use crate::smb2::ack::PlainRequest;
    use crate::smb2::header::Smb2Header;
    use crate::smb2::negotiate::NegotiateResponse;
    use crate::smb2::status::NtStatus;
    use crate::smb2::{Dialect, Smb2Command};

    struct NoUsers;

    impl UserDirectory for NoUsers {
        fn password(&self, _user: &str) -> Option<String> {
            None
        }

        fn anchors_for(&self, _user: &str) -> Vec<Anchor> {
            Vec::new()
        }
    }

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState::new("SMB", Arc::new(NoUsers)))
    }

    fn smb1_negotiate() -> Vec<u8> {
        let mut frame = SMB1_MAGIC.to_vec();
        frame.extend_from_slice(&[0x72, 0, 0, 0, 0]);
        frame.extend_from_slice(b"\x02SMB 2.002\x00\x02SMB 2.???\x00");
        frame
    }

    #[tokio::test]
    async fn test_legacy_bridge_then_echo() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, state()));

        transport::write_frame(&mut client, &smb1_negotiate()).await.unwrap();
        let reply = transport::read_frame(&mut client).await.unwrap();
        let (header, used) = Smb2Header::decode(&reply).unwrap();
        assert_eq!(header.command, Smb2Command::Negotiate.code());
        let (negotiate, _) = NegotiateResponse::decode(&reply[used..]).unwrap();
        assert_eq!(negotiate.dialect, Dialect::Wildcard);

        let mut echo = Smb2Header::request(Smb2Command::Echo.code(), 1, 0, 0).encode().unwrap();
        echo.extend_from_slice(&PlainRequest.encode().unwrap());
        transport::write_frame(&mut client, &echo).await.unwrap();
        let reply = transport::read_frame(&mut client).await.unwrap();
        let (header, _) = Smb2Header::decode(&reply).unwrap();
        assert_eq!(header.status, NtStatus::Success);
        assert_eq!(header.message_id, 1);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_legacy_negotiate_drops() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, state()));

        transport::write_frame(&mut client, &smb1_negotiate()).await.unwrap();
        transport::read_frame(&mut client).await.unwrap();
        transport::write_frame(&mut client, &smb1_negotiate()).await.unwrap();

        task.await.unwrap().unwrap();
        assert!(transport::read_frame(&mut client).await.is_err());
    }

    #[tokio::test]
    async fn test_short_frame_drops() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(handle_connection(server, state()));
        transport::write_frame(&mut client, &[0xFE, b'S', b'M', b'B', 0]).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
