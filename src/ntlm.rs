//! NTLM messages and NTLMv2 cryptography.
//!
//! The three messages (NEGOTIATE, CHALLENGE, AUTHENTICATE) are codec
//! records: each variable field is described by a Len/MaxLen/Offset triple
//! relative to the start of the message.
//!
//! References:
//! - [MS-NLMP] NT LAN Manager Authentication Protocol, Sections 2.2 and 3.3.2

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use crate::codec::{self, CodecError, Field, Values, WireRecord};
use crate::smb2::string_to_utf16le;

type HmacMd5 = Hmac<Md5>;

/// NTLMSSP signature: `NTLMSSP\0`
pub const NTLMSSP_SIG: &[u8; 8] = b"NTLMSSP\0";

pub const MESSAGE_NEGOTIATE: u32 = 1;
pub const MESSAGE_CHALLENGE: u32 = 2;
pub const MESSAGE_AUTHENTICATE: u32 = 3;

// Negotiate flags (MS-NLMP 2.2.2.5)
pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_SIGN: u32 = 0x0000_0010;
pub const NEGOTIATE_LM_KEY: u32 = 0x0000_0080;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub const TARGET_TYPE_SERVER: u32 = 0x0002_0000;
pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;
pub const NEGOTIATE_56: u32 = 0x8000_0000;

/// Flags a client offers in its NEGOTIATE message.
pub const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// Flags the server answers with in its CHALLENGE message.
pub const SERVER_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | TARGET_TYPE_SERVER
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO;

// AV pair ids (MS-NLMP 2.2.2.1)
pub const MSV_AV_EOL: u16 = 0;
pub const MSV_AV_NB_COMPUTER_NAME: u16 = 1;
pub const MSV_AV_NB_DOMAIN_NAME: u16 = 2;
pub const MSV_AV_TIMESTAMP: u16 = 7;

/// Size of the NEGOTIATE fixed portion including the version field.
const NEGOTIATE_FIXED_LEN: usize = 40;
/// Size of the AUTHENTICATE fixed portion including version and MIC.
const AUTHENTICATE_FIXED_LEN: usize = 88;

fn check_signature(v: &Values, expected_type: u32) -> Result<(), CodecError> {
    if v.bytes("Signature")? != NTLMSSP_SIG {
        return Err(CodecError::Invalid("missing NTLMSSP signature".into()));
    }
    let message_type = v.u32("MessageType")?;
    if message_type != expected_type {
        return Err(CodecError::Invalid(format!(
            "NTLM message type {} (expected {})",
            message_type, expected_type
        )));
    }
    Ok(())
}

/// Some clients omit trailing optional fields (version, MIC); decode
/// against a zero-extended copy so the fixed portion is always present.
fn zero_extend(buf: &[u8], fixed: usize) -> std::borrow::Cow<'_, [u8]> {
    if buf.len() >= fixed {
        std::borrow::Cow::Borrowed(buf)
    } else {
        let mut padded = buf.to_vec();
        padded.resize(fixed, 0);
        std::borrow::Cow::Owned(padded)
    }
}

// ---- AV pairs ----

/// One attribute/value pair of a challenge's target info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPair {
    pub id: u16,
    pub value: Vec<u8>,
}

const AV_PAIR: &[Field] = &[
    codec::scalar("AvId", 2),
    codec::length_of("AvLen", "Value", 2),
    codec::bytes("Value"),
];

impl WireRecord for AvPair {
    const SCHEMA: &'static [Field] = AV_PAIR;

    fn store(&self) -> Values {
        Values::new().with("AvId", self.id).with("Value", self.value.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        Ok(AvPair { id: v.u16("AvId")?, value: v.bytes("Value")?.to_vec() })
    }
}

impl AvPair {
    pub fn timestamp(filetime: u64) -> Self {
        AvPair { id: MSV_AV_TIMESTAMP, value: filetime.to_le_bytes().to_vec() }
    }

    pub fn eol() -> Self {
        AvPair { id: MSV_AV_EOL, value: Vec::new() }
    }
}

pub fn encode_av_pairs(pairs: &[AvPair]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for pair in pairs {
        out.extend_from_slice(&pair.encode()?);
    }
    Ok(out)
}

/// Decode AV pairs up to and including the end-of-list pair.
pub fn decode_av_pairs(buf: &[u8]) -> Result<Vec<AvPair>, CodecError> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (pair, used) = AvPair::decode(&buf[pos..])?;
        pos += used;
        let done = pair.id == MSV_AV_EOL;
        pairs.push(pair);
        if done {
            break;
        }
    }
    Ok(pairs)
}

/// The timestamp pair's value, if present.
pub fn av_timestamp(pairs: &[AvPair]) -> Option<u64> {
    pairs
        .iter()
        .find(|p| p.id == MSV_AV_TIMESTAMP)
        .and_then(|p| p.value.as_slice().try_into().ok())
        .map(u64::from_le_bytes)
}

// ---- NEGOTIATE_MESSAGE ----

/// MS-NLMP 2.2.1.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateMessage {
    pub flags: u32,
    pub domain: Vec<u8>,
    pub workstation: Vec<u8>,
}

const NEGOTIATE_MESSAGE: &[Field] = &[
    codec::fixed("Signature", 8),
    codec::scalar("MessageType", 4),
    codec::scalar("NegotiateFlags", 4),
    codec::length_of("DomainNameLen", "DomainName", 2),
    codec::length_of("DomainNameMaxLen", "DomainName", 2),
    codec::offset_of("DomainNameBufferOffset", "DomainName", 4),
    codec::length_of("WorkstationLen", "Workstation", 2),
    codec::length_of("WorkstationMaxLen", "Workstation", 2),
    codec::offset_of("WorkstationBufferOffset", "Workstation", 4),
    codec::fixed("Version", 8),
    codec::bytes("DomainName"),
    codec::bytes("Workstation"),
];

impl WireRecord for NegotiateMessage {
    const SCHEMA: &'static [Field] = NEGOTIATE_MESSAGE;

    fn store(&self) -> Values {
        Values::new()
            .with("Signature", *NTLMSSP_SIG)
            .with("MessageType", MESSAGE_NEGOTIATE)
            .with("NegotiateFlags", self.flags)
            .with("DomainName", self.domain.clone())
            .with("Workstation", self.workstation.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_signature(v, MESSAGE_NEGOTIATE)?;
        Ok(NegotiateMessage {
            flags: v.u32("NegotiateFlags")?,
            domain: v.bytes("DomainName")?.to_vec(),
            workstation: v.bytes("Workstation")?.to_vec(),
        })
    }
}

impl NegotiateMessage {
    pub fn new(domain: &str, workstation: &str) -> Self {
        NegotiateMessage {
            flags: CLIENT_FLAGS,
            domain: domain.as_bytes().to_vec(),
            workstation: workstation.as_bytes().to_vec(),
        }
    }

    /// Parse a NEGOTIATE message, tolerating one without a version field.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&zero_extend(buf, NEGOTIATE_FIXED_LEN)).map(|(m, _)| m)
    }

    pub fn requests_lm_key(&self) -> bool {
        (self.flags & NEGOTIATE_LM_KEY) != 0
    }
}

// ---- CHALLENGE_MESSAGE ----

/// MS-NLMP 2.2.1.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_name: Vec<u8>,
    /// Encoded AV pairs.
    pub target_info: Vec<u8>,
}

const CHALLENGE_MESSAGE: &[Field] = &[
    codec::fixed("Signature", 8),
    codec::scalar("MessageType", 4),
    codec::length_of("TargetNameLen", "TargetName", 2),
    codec::length_of("TargetNameMaxLen", "TargetName", 2),
    codec::offset_of("TargetNameBufferOffset", "TargetName", 4),
    codec::scalar("NegotiateFlags", 4),
    codec::fixed("ServerChallenge", 8),
    codec::fixed("Reserved", 8),
    codec::length_of("TargetInfoLen", "TargetInfo", 2),
    codec::length_of("TargetInfoMaxLen", "TargetInfo", 2),
    codec::offset_of("TargetInfoBufferOffset", "TargetInfo", 4),
    codec::fixed("Version", 8),
    codec::bytes("TargetName"),
    codec::bytes("TargetInfo"),
];

impl WireRecord for ChallengeMessage {
    const SCHEMA: &'static [Field] = CHALLENGE_MESSAGE;

    fn store(&self) -> Values {
        Values::new()
            .with("Signature", *NTLMSSP_SIG)
            .with("MessageType", MESSAGE_CHALLENGE)
            .with("NegotiateFlags", self.flags)
            .with("ServerChallenge", self.server_challenge)
            .with("TargetName", self.target_name.clone())
            .with("TargetInfo", self.target_info.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_signature(v, MESSAGE_CHALLENGE)?;
        Ok(ChallengeMessage {
            flags: v.u32("NegotiateFlags")?,
            server_challenge: v.array("ServerChallenge")?,
            target_name: v.bytes("TargetName")?.to_vec(),
            target_info: v.bytes("TargetInfo")?.to_vec(),
        })
    }
}

impl ChallengeMessage {
    /// A server challenge whose target info carries a timestamp and the
    /// end-of-list marker.
    pub fn new(server_challenge: [u8; 8], target_name: &str, timestamp: u64) -> Result<Self, CodecError> {
        Ok(ChallengeMessage {
            flags: SERVER_FLAGS,
            server_challenge,
            target_name: string_to_utf16le(target_name),
            target_info: encode_av_pairs(&[AvPair::timestamp(timestamp), AvPair::eol()])?,
        })
    }

    pub fn av_pairs(&self) -> Result<Vec<AvPair>, CodecError> {
        decode_av_pairs(&self.target_info)
    }
}

// ---- AUTHENTICATE_MESSAGE ----

/// MS-NLMP 2.2.1.3. Names are raw UTF-16LE as sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub flags: u32,
    pub lm_challenge_response: Vec<u8>,
    pub nt_challenge_response: Vec<u8>,
    pub domain: Vec<u8>,
    pub user: Vec<u8>,
    pub workstation: Vec<u8>,
    pub encrypted_session_key: Vec<u8>,
}

const AUTHENTICATE_MESSAGE: &[Field] = &[
    codec::fixed("Signature", 8),
    codec::scalar("MessageType", 4),
    codec::length_of("LmChallengeResponseLen", "LmChallengeResponse", 2),
    codec::length_of("LmChallengeResponseMaxLen", "LmChallengeResponse", 2),
    codec::offset_of("LmChallengeResponseBufferOffset", "LmChallengeResponse", 4),
    codec::length_of("NtChallengeResponseLen", "NtChallengeResponse", 2),
    codec::length_of("NtChallengeResponseMaxLen", "NtChallengeResponse", 2),
    codec::offset_of("NtChallengeResponseBufferOffset", "NtChallengeResponse", 4),
    codec::length_of("DomainNameLen", "DomainName", 2),
    codec::length_of("DomainNameMaxLen", "DomainName", 2),
    codec::offset_of("DomainNameBufferOffset", "DomainName", 4),
    codec::length_of("UserNameLen", "UserName", 2),
    codec::length_of("UserNameMaxLen", "UserName", 2),
    codec::offset_of("UserNameBufferOffset", "UserName", 4),
    codec::length_of("WorkstationLen", "Workstation", 2),
    codec::length_of("WorkstationMaxLen", "Workstation", 2),
    codec::offset_of("WorkstationBufferOffset", "Workstation", 4),
    codec::length_of("EncryptedRandomSessionKeyLen", "EncryptedRandomSessionKey", 2),
    codec::length_of("EncryptedRandomSessionKeyMaxLen", "EncryptedRandomSessionKey", 2),
    codec::offset_of("EncryptedRandomSessionKeyBufferOffset", "EncryptedRandomSessionKey", 4),
    codec::scalar("NegotiateFlags", 4),
    codec::fixed("Version", 8),
    codec::fixed("MIC", 16),
    codec::bytes("DomainName"),
    codec::bytes("UserName"),
    codec::bytes("Workstation"),
    codec::bytes("LmChallengeResponse"),
    codec::bytes("NtChallengeResponse"),
    codec::bytes("EncryptedRandomSessionKey"),
];

impl WireRecord for AuthenticateMessage {
    const SCHEMA: &'static [Field] = AUTHENTICATE_MESSAGE;

    fn store(&self) -> Values {
        Values::new()
            .with("Signature", *NTLMSSP_SIG)
            .with("MessageType", MESSAGE_AUTHENTICATE)
            .with("NegotiateFlags", self.flags)
            .with("DomainName", self.domain.clone())
            .with("UserName", self.user.clone())
            .with("Workstation", self.workstation.clone())
            .with("LmChallengeResponse", self.lm_challenge_response.clone())
            .with("NtChallengeResponse", self.nt_challenge_response.clone())
            .with("EncryptedRandomSessionKey", self.encrypted_session_key.clone())
    }

    fn load(v: &Values) -> Result<Self, CodecError> {
        check_signature(v, MESSAGE_AUTHENTICATE)?;
        Ok(AuthenticateMessage {
            flags: v.u32("NegotiateFlags")?,
            lm_challenge_response: v.bytes("LmChallengeResponse")?.to_vec(),
            nt_challenge_response: v.bytes("NtChallengeResponse")?.to_vec(),
            domain: v.bytes("DomainName")?.to_vec(),
            user: v.bytes("UserName")?.to_vec(),
            workstation: v.bytes("Workstation")?.to_vec(),
            encrypted_session_key: v.bytes("EncryptedRandomSessionKey")?.to_vec(),
        })
    }
}

impl AuthenticateMessage {
    /// Parse an AUTHENTICATE message, tolerating one without version or MIC.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&zero_extend(buf, AUTHENTICATE_FIXED_LEN)).map(|(m, _)| m)
    }

    /// Answer `challenge` with an NTLMv2 response.
    pub fn respond(
        challenge: &ChallengeMessage,
        user: &str,
        password: &str,
        domain: &str,
        workstation: &str,
        client_nonce: [u8; 8],
        now: u64,
    ) -> Result<Self, CodecError> {
        let pairs = challenge.av_pairs()?;
        let timestamp = av_timestamp(&pairs).unwrap_or(now);
        let blob = client_challenge_blob(timestamp, &client_nonce, &challenge.target_info);
        let key = ntowf_v2(password, user, domain);
        let proof = nt_proof(&key, &challenge.server_challenge, &blob);

        let mut nt_response = proof.to_vec();
        nt_response.extend_from_slice(&blob);
        Ok(AuthenticateMessage {
            flags: challenge.flags & CLIENT_FLAGS,
            // LMv2 is replaced by zeros when a timestamp is present.
            lm_challenge_response: vec![0u8; 24],
            nt_challenge_response: nt_response,
            domain: string_to_utf16le(domain),
            user: string_to_utf16le(user),
            workstation: string_to_utf16le(workstation),
            encrypted_session_key: Vec::new(),
        })
    }
}

// ---- NTLMv2 primitives ----

/// HMAC-MD5 keyed by a 16-byte hash.
pub fn hmac_md5(key: &[u8; 16], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC accepts any key size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// NTOWFv1 = MD4(UTF16LE(password)).
pub fn ntowf_v1(password: &str) -> [u8; 16] {
    Md4::digest(string_to_utf16le(password)).into()
}

/// NTOWFv2 = HMAC-MD5(NTOWFv1, UTF16LE(uppercase(user) + domain)).
pub fn ntowf_v2(password: &str, user: &str, domain: &str) -> [u8; 16] {
    let identity = string_to_utf16le(&(user.to_uppercase() + domain));
    hmac_md5(&ntowf_v1(password), &[&identity])
}

/// The client challenge structure hashed into the proof:
/// `01 01 00*6 || timestamp || nonce || 00*4 || target info || 00*4`.
pub fn client_challenge_blob(timestamp: u64, client_nonce: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_nonce);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);
    blob
}

/// NTProofStr = HMAC-MD5(NTOWFv2, serverChallenge || blob).
pub fn nt_proof(ntowf_v2: &[u8; 16], server_challenge: &[u8; 8], blob: &[u8]) -> [u8; 16] {
    hmac_md5(ntowf_v2, &[server_challenge, blob])
}

/// Session base key = HMAC-MD5(NTOWFv2, NTProofStr).
pub fn session_base_key(ntowf_v2: &[u8; 16], proof: &[u8; 16]) -> [u8; 16] {
    hmac_md5(ntowf_v2, &[proof])
}
