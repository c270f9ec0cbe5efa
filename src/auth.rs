//! NTLMv2 authentication for SMB2, server side.
//!
//! The SESSION_SETUP exchange is a two-leg SPNEGO negotiation:
//!   1. Client sends NegTokenInit carrying an NTLM NEGOTIATE_MESSAGE
//!   2. Server answers MORE_PROCESSING_REQUIRED with a CHALLENGE_MESSAGE
//!   3. Client sends NegTokenResp carrying an AUTHENTICATE_MESSAGE
//!   4. Server recomputes the NTLMv2 proof and accepts or rejects
//!
//! References:
//! - [MS-NLMP] NT LAN Manager Authentication Protocol
//! - [MS-SPNG] SPNEGO Extension

use crate::codec::WireRecord;
use crate::error::ServerError;
use crate::ntlm::{self, AuthenticateMessage, ChallengeMessage, NegotiateMessage, NTLMSSP_SIG};
use crate::resource::Anchor;
use crate::smb2;
use crate::spnego::{NegTokenResp, NegotiationToken};
use crate::vfs::filetime_now;
use rand::RngCore;
use tracing::{debug, warn};

/// Source of credentials and per-user shares, supplied by the host.
pub trait UserDirectory: Send + Sync {
    /// Plaintext password for `user`, if the user exists.
    fn password(&self, user: &str) -> Option<String>;

    /// Anchors `user` may attach to after logging on.
    fn anchors_for(&self, user: &str) -> Vec<Anchor>;
}

/// Authentication state machine, one per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No NEGOTIATE has been answered yet.
    Unauthenticated,
    /// Dialect agreed; waiting for the NTLM NEGOTIATE_MESSAGE.
    Negotiated,
    /// Server challenge sent; waiting for AUTHENTICATE_MESSAGE.
    ChallengeIssued {
        server_challenge: [u8; 8],
    },
    /// Authentication completed successfully.
    Authenticated {
        username: String,
        session_key: [u8; 16],
    },
    /// The handshake was rejected. Terminal.
    Failed,
}

/// Result of one SESSION_SETUP leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send the token with STATUS_MORE_PROCESSING_REQUIRED.
    Continue(Vec<u8>),
    /// Send the token with STATUS_SUCCESS.
    Complete { username: String, token: Vec<u8> },
}

pub struct Authenticator {
    state: AuthState,
    server_name: String,
}

impl Authenticator {
    pub fn new(server_name: impl Into<String>) -> Self {
        Authenticator { state: AuthState::Unauthenticated, server_name: server_name.into() }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Record that the dialect negotiation completed.
    pub fn negotiated(&mut self) {
        if self.state == AuthState::Unauthenticated {
            self.state = AuthState::Negotiated;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated { .. })
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            AuthState::Authenticated { username, .. } => Some(username),
            _ => None,
        }
    }

    /// Derived key; kept for a future signing implementation.
    pub fn session_key(&self) -> Option<&[u8; 16]> {
        match &self.state {
            AuthState::Authenticated { session_key, .. } => Some(session_key),
            _ => None,
        }
    }

    /// Process a SESSION_SETUP security buffer. Any error leaves the
    /// machine in [`AuthState::Failed`].
    pub fn step(&mut self, security_buffer: &[u8], users: &dyn UserDirectory) -> Result<AuthStep, ServerError> {
        debug!(input_len = security_buffer.len(), state = ?self.state, "NTLM: step");
        let result = match &self.state {
            AuthState::Negotiated => self.issue_challenge(security_buffer),
            AuthState::ChallengeIssued { server_challenge } => {
                let challenge = *server_challenge;
                self.verify(security_buffer, &challenge, users)
            }
            other => Err(ServerError::ProtocolViolation(format!("SESSION_SETUP in state {:?}", other))),
        };
        if let Err(e) = &result {
            warn!("NTLM: handshake failed: {}", e);
            self.state = AuthState::Failed;
        }
        result
    }

    fn issue_challenge(&mut self, security_buffer: &[u8]) -> Result<AuthStep, ServerError> {
        let token = unwrap_token(security_buffer, true)?;
        let negotiate = NegotiateMessage::parse(&token)?;
        if negotiate.requests_lm_key() {
            return Err(ServerError::AuthenticationFailure("client requested LM_KEY".into()));
        }

        let mut server_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut server_challenge);
        let challenge = ChallengeMessage::new(server_challenge, &self.server_name, filetime_now())?;

        debug!("NTLM: sending challenge");
        self.state = AuthState::ChallengeIssued { server_challenge };
        Ok(AuthStep::Continue(NegTokenResp::challenge(challenge.encode()?).encode()))
    }

    fn verify(
        &mut self,
        security_buffer: &[u8],
        server_challenge: &[u8; 8],
        users: &dyn UserDirectory,
    ) -> Result<AuthStep, ServerError> {
        let token = unwrap_token(security_buffer, false)?;
        let msg = AuthenticateMessage::parse(&token)?;
        let username = smb2::utf16le_to_string_strict(&msg.user)
            .ok_or_else(|| ServerError::AuthenticationFailure("user name is not UTF-16".into()))?;
        let domain = smb2::utf16le_to_string_strict(&msg.domain)
            .ok_or_else(|| ServerError::AuthenticationFailure("domain is not UTF-16".into()))?;

        let password = users
            .password(&username)
            .ok_or_else(|| ServerError::AuthenticationFailure(format!("unknown user '{}'", username)))?;
        if msg.nt_challenge_response.len() < 16 {
            return Err(ServerError::AuthenticationFailure("NT response too short for NTLMv2".into()));
        }
        let (proof, blob) = msg.nt_challenge_response.split_at(16);

        let key = ntlm::ntowf_v2(&password, &username, &domain);
        let expected = ntlm::nt_proof(&key, server_challenge, blob);
        if proof != expected {
            return Err(ServerError::AuthenticationFailure(format!("bad proof for '{}'", username)));
        }

        let session_key = ntlm::session_base_key(&key, &expected);
        debug!("NTLM: authenticated user '{}'", username);
        self.state = AuthState::Authenticated { username: username.clone(), session_key };
        Ok(AuthStep::Complete { username, token: NegTokenResp::accepted().encode() })
    }
}

/// Strip the SPNEGO wrapping from a security buffer. Bare NTLMSSP tokens
/// are accepted as-is.
fn unwrap_token(security_buffer: &[u8], first_leg: bool) -> Result<Vec<u8>, ServerError> {
    if security_buffer.starts_with(NTLMSSP_SIG) {
        return Ok(security_buffer.to_vec());
    }
    let token = NegotiationToken::parse(security_buffer)?;
    if let NegotiationToken::Init(init) = &token {
        if !init.offers_ntlm() {
            return Err(ServerError::AuthenticationFailure("NTLMSSP not offered".into()));
        }
    } else if first_leg {
        return Err(ServerError::ProtocolViolation("expected NegTokenInit".into()));
    }
    token
        .mech_token()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ServerError::AuthenticationFailure("no NTLM token in SPNEGO blob".into()))
}
