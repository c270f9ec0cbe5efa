//! SPNEGO (RFC 4178) wrapping of NTLMSSP tokens.
//!
//! Only the handful of DER constructs SPNEGO needs are built and parsed
//! here: NegTokenInit inside the GSS-API application wrapper, and
//! NegTokenResp.
//!
//! References:
//! - [MS-SPNG] SPNEGO Extension
//! - RFC 4178 Section 4.2

use crate::error::ServerError;

/// DER contents of OID 1.3.6.1.5.5.2 (SPNEGO).
pub const SPNEGO_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
/// DER contents of OID 1.3.6.1.4.1.311.2.2.10 (NTLMSSP).
pub const NTLMSSP_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

const TAG_APPLICATION_0: u8 = 0x60;
const TAG_ENUMERATED: u8 = 0x0a;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

const fn context(n: u8) -> u8 {
    0xa0 | n
}

pub const ACCEPT_COMPLETED: u8 = 0;
pub const ACCEPT_INCOMPLETE: u8 = 1;
pub const REJECT: u8 = 2;

/// First token of a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegTokenInit {
    /// DER contents of each offered mechanism OID.
    pub mech_types: Vec<Vec<u8>>,
    pub mech_token: Option<Vec<u8>>,
}

/// Every subsequent token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegTokenResp {
    pub neg_state: Option<u8>,
    pub supported_mech: Option<Vec<u8>>,
    pub response_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationToken {
    Init(NegTokenInit),
    Resp(NegTokenResp),
}

impl NegTokenInit {
    /// Offer NTLMSSP, optionally carrying its first token.
    pub fn ntlm(mech_token: Option<Vec<u8>>) -> Self {
        NegTokenInit { mech_types: vec![NTLMSSP_OID.to_vec()], mech_token }
    }

    pub fn offers_ntlm(&self) -> bool {
        self.mech_types.iter().any(|oid| oid == NTLMSSP_OID)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut mechs = Vec::new();
        for oid in &self.mech_types {
            push_tlv(&mut mechs, TAG_OID, oid);
        }
        let mut fields = Vec::new();
        push_tlv(&mut fields, context(0), &tlv(TAG_SEQUENCE, &mechs));
        if let Some(token) = &self.mech_token {
            push_tlv(&mut fields, context(2), &tlv(TAG_OCTET_STRING, token));
        }

        let mut inner = tlv(TAG_OID, SPNEGO_OID);
        push_tlv(&mut inner, context(0), &tlv(TAG_SEQUENCE, &fields));
        tlv(TAG_APPLICATION_0, &inner)
    }
}

impl NegTokenResp {
    /// Server's reply carrying the NTLM challenge.
    pub fn challenge(token: Vec<u8>) -> Self {
        NegTokenResp {
            neg_state: Some(ACCEPT_INCOMPLETE),
            supported_mech: Some(NTLMSSP_OID.to_vec()),
            response_token: Some(token),
        }
    }

    /// Server's final reply.
    pub fn accepted() -> Self {
        NegTokenResp { neg_state: Some(ACCEPT_COMPLETED), ..Default::default() }
    }

    /// Client's second leg carrying the NTLM AUTHENTICATE message.
    pub fn response(token: Vec<u8>) -> Self {
        NegTokenResp { response_token: Some(token), ..Default::default() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if let Some(state) = self.neg_state {
            push_tlv(&mut fields, context(0), &tlv(TAG_ENUMERATED, &[state]));
        }
        if let Some(oid) = &self.supported_mech {
            push_tlv(&mut fields, context(1), &tlv(TAG_OID, oid));
        }
        if let Some(token) = &self.response_token {
            push_tlv(&mut fields, context(2), &tlv(TAG_OCTET_STRING, token));
        }
        tlv(context(1), &tlv(TAG_SEQUENCE, &fields))
    }
}

impl NegotiationToken {
    pub fn parse(buf: &[u8]) -> Result<Self, ServerError> {
        let (tag, body, _) = read_tlv(buf)?;
        match tag {
            TAG_APPLICATION_0 => {
                let (tag, oid, rest) = read_tlv(body)?;
                if tag != TAG_OID {
                    return Err(malformed("expected GSS-API mechanism OID"));
                }
                check_oid(oid)?;
                if oid != SPNEGO_OID {
                    return Err(malformed("GSS-API token is not SPNEGO"));
                }
                let (tag, choice, _) = read_tlv(rest)?;
                if tag != context(0) {
                    return Err(malformed("expected NegTokenInit"));
                }
                parse_init(choice).map(NegotiationToken::Init)
            }
            t if t == context(0) => parse_init(body).map(NegotiationToken::Init),
            t if t == context(1) => parse_resp(body).map(NegotiationToken::Resp),
            other => Err(malformed(&format!("unexpected SPNEGO tag {:#04x}", other))),
        }
    }

    /// The embedded mechanism token, if any.
    pub fn mech_token(&self) -> Option<&[u8]> {
        match self {
            NegotiationToken::Init(init) => init.mech_token.as_deref(),
            NegotiationToken::Resp(resp) => resp.response_token.as_deref(),
        }
    }
}

fn parse_init(choice: &[u8]) -> Result<NegTokenInit, ServerError> {
    let (tag, mut seq, _) = read_tlv(choice)?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("NegTokenInit is not a SEQUENCE"));
    }
    let mut init = NegTokenInit::default();
    while !seq.is_empty() {
        let (tag, value, rest) = read_tlv(seq)?;
        seq = rest;
        match tag {
            t if t == context(0) => {
                let (tag, mut list, _) = read_tlv(value)?;
                if tag != TAG_SEQUENCE {
                    return Err(malformed("mechTypes is not a SEQUENCE"));
                }
                while !list.is_empty() {
                    let (tag, oid, rest) = read_tlv(list)?;
                    if tag != TAG_OID {
                        return Err(malformed("mechTypes entry is not an OID"));
                    }
                    check_oid(oid)?;
                    init.mech_types.push(oid.to_vec());
                    list = rest;
                }
            }
            t if t == context(2) => init.mech_token = Some(octet_string(value)?.to_vec()),
            // reqFlags, negHints and mechListMIC are not used
            _ => {}
        }
    }
    Ok(init)
}

fn parse_resp(choice: &[u8]) -> Result<NegTokenResp, ServerError> {
    let (tag, mut seq, _) = read_tlv(choice)?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("NegTokenResp is not a SEQUENCE"));
    }
    let mut resp = NegTokenResp::default();
    while !seq.is_empty() {
        let (tag, value, rest) = read_tlv(seq)?;
        seq = rest;
        match tag {
            t if t == context(0) => {
                let (tag, state, _) = read_tlv(value)?;
                if tag != TAG_ENUMERATED || state.len() != 1 {
                    return Err(malformed("negState is not a one-byte ENUMERATED"));
                }
                resp.neg_state = Some(state[0]);
            }
            t if t == context(1) => {
                let (tag, oid, _) = read_tlv(value)?;
                if tag != TAG_OID {
                    return Err(malformed("supportedMech is not an OID"));
                }
                check_oid(oid)?;
                resp.supported_mech = Some(oid.to_vec());
            }
            t if t == context(2) => resp.response_token = Some(octet_string(value)?.to_vec()),
            _ => {}
        }
    }
    Ok(resp)
}

fn octet_string(value: &[u8]) -> Result<&[u8], ServerError> {
    let (tag, body, _) = read_tlv(value)?;
    if tag != TAG_OCTET_STRING {
        return Err(malformed("expected OCTET STRING"));
    }
    Ok(body)
}

fn malformed(msg: &str) -> ServerError {
    ServerError::ProtocolViolation(format!("SPNEGO: {}", msg))
}

/// Decode OID contents into arcs. Each arc is base-128 with the high bit
/// marking continuation; the first byte packs the first two arcs.
pub fn decode_oid(content: &[u8]) -> Option<Vec<u64>> {
    let (&first, rest) = content.split_first()?;
    let mut arcs = vec![u64::from(first / 40), u64::from(first % 40)];
    let mut acc: u64 = 0;
    let mut pending = false;
    for &b in rest {
        if acc > (u64::MAX >> 7) {
            return None;
        }
        acc = (acc << 7) | u64::from(b & 0x7f);
        pending = b & 0x80 != 0;
        if !pending {
            arcs.push(acc);
            acc = 0;
        }
    }
    if pending {
        return None;
    }
    Some(arcs)
}

pub fn oid_to_string(content: &[u8]) -> Option<String> {
    decode_oid(content).map(|arcs| arcs.iter().map(u64::to_string).collect::<Vec<_>>().join("."))
}

fn check_oid(content: &[u8]) -> Result<(), ServerError> {
    decode_oid(content).map(|_| ()).ok_or_else(|| malformed("malformed OID"))
}

/// Read one DER TLV, returning `(tag, value, rest)`.
fn read_tlv(buf: &[u8]) -> Result<(u8, &[u8], &[u8]), ServerError> {
    let (&tag, rest) = buf.split_first().ok_or_else(|| malformed("truncated tag"))?;
    let (&first, rest) = rest.split_first().ok_or_else(|| malformed("truncated length"))?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return Err(malformed("unsupported length encoding"));
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return Err(malformed("value runs past end of token"));
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 6);
    push_tlv(&mut out, tag, value);
    out
}

fn push_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    push_der_length(buf, value.len());
    buf.extend_from_slice(value);
}

/// Push a DER length encoding into a buffer.
fn push_der_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else if len < 0x100 {
        buf.push(0x81);
        buf.push(len as u8);
    } else if len < 0x10000 {
        buf.push(0x82);
        buf.push((len >> 8) as u8);
        buf.push(len as u8);
    } else {
        buf.push(0x83);
        buf.push((len >> 16) as u8);
        buf.push((len >> 8) as u8);
        buf.push(len as u8);
    }
}
