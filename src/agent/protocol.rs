//! SSH agent wire protocol
//!
//! Frames are `[u32 length][u8 type][payload]`. Only identity listing and
//! signing are served; every other request type is answered with a single
//! `SSH_AGENT_FAILURE` byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ssh::SshError;

// ═══════════════════════════════════════════════════════════════════════════
// Message numbers
// ═══════════════════════════════════════════════════════════════════════════

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Sign request flags
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 256 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    RequestIdentities,
    SignRequest {
        /// Key blob without its wire length prefix
        key_blob: Bytes,
        data: Bytes,
        flags: u32,
    },
    Unknown(u8),
}

impl AgentRequest {
    /// Decode a frame body (type byte + payload).
    pub fn decode(body: &[u8]) -> Result<Self, SshError> {
        let mut buf = body;
        let kind = get_u8(&mut buf)?;
        match kind {
            SSH_AGENTC_REQUEST_IDENTITIES => Ok(AgentRequest::RequestIdentities),
            SSH_AGENTC_SIGN_REQUEST => {
                let key_blob = get_string(&mut buf)?;
                let data = get_string(&mut buf)?;
                // Old clients omit the flags word.
                let flags = if buf.remaining() >= 4 { buf.get_u32() } else { 0 };
                Ok(AgentRequest::SignRequest {
                    key_blob,
                    data,
                    flags,
                })
            }
            other => Ok(AgentRequest::Unknown(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            AgentRequest::RequestIdentities => buf.put_u8(SSH_AGENTC_REQUEST_IDENTITIES),
            AgentRequest::SignRequest {
                key_blob,
                data,
                flags,
            } => {
                buf.put_u8(SSH_AGENTC_SIGN_REQUEST);
                put_string(&mut buf, key_blob);
                put_string(&mut buf, data);
                buf.put_u32(*flags);
            }
            AgentRequest::Unknown(kind) => buf.put_u8(*kind),
        }
        buf.freeze()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════════════════════

/// One listed identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Bytes,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Identities(Vec<Identity>),
    /// Encoded signature blob (`string algorithm, string signature`)
    Signature(Bytes),
    Failure,
}

impl AgentResponse {
    /// Encode the frame body (type byte + payload).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            AgentResponse::Identities(identities) => {
                buf.put_u8(SSH_AGENT_IDENTITIES_ANSWER);
                buf.put_u32(identities.len() as u32);
                for identity in identities {
                    put_string(&mut buf, &identity.key_blob);
                    put_string(&mut buf, identity.name.as_bytes());
                }
            }
            AgentResponse::Signature(signature) => {
                buf.put_u8(SSH_AGENT_SIGN_RESPONSE);
                put_string(&mut buf, signature);
            }
            AgentResponse::Failure => buf.put_u8(SSH_AGENT_FAILURE),
        }
        buf.freeze()
    }

    pub fn decode(body: &[u8]) -> Result<Self, SshError> {
        let mut buf = body;
        match get_u8(&mut buf)? {
            SSH_AGENT_IDENTITIES_ANSWER => {
                let count = get_u32(&mut buf)?;
                let mut identities = Vec::new();
                for _ in 0..count {
                    let key_blob = get_string(&mut buf)?;
                    let name = String::from_utf8_lossy(&get_string(&mut buf)?).into_owned();
                    identities.push(Identity { key_blob, name });
                }
                Ok(AgentResponse::Identities(identities))
            }
            SSH_AGENT_SIGN_RESPONSE => Ok(AgentResponse::Signature(get_string(&mut buf)?)),
            SSH_AGENT_FAILURE => Ok(AgentResponse::Failure),
            other => Err(SshError::AgentError(format!(
                "unexpected agent response type {}",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Framing helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Prefix `body` with its big-endian length.
pub fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    put_string(&mut buf, body);
    buf.freeze()
}

/// Length of a frame from its 4-byte header.
pub fn frame_len(header: [u8; 4]) -> Result<usize, SshError> {
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(SshError::AgentError(format!("invalid agent frame length {}", len)));
    }
    Ok(len)
}

pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, SshError> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, SshError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_string(buf: &mut &[u8]) -> Result<Bytes, SshError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}

fn truncated() -> SshError {
    SshError::AgentError("truncated agent message".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_answer_layout() {
        let body = AgentResponse::Identities(vec![
            Identity {
                key_blob: Bytes::from_static(b"KEY1"),
                name: "id_a".into(),
            },
            Identity {
                key_blob: Bytes::from_static(b"K2"),
                name: "b".into(),
            },
        ])
        .encode();

        let expected: &[u8] = &[
            12, 0, 0, 0, 2, //
            0, 0, 0, 4, b'K', b'E', b'Y', b'1', 0, 0, 0, 4, b'i', b'd', b'_', b'a', //
            0, 0, 0, 2, b'K', b'2', 0, 0, 0, 1, b'b',
        ];
        assert_eq!(&body[..], expected);
    }

    #[test]
    fn test_sign_request_decode() {
        let mut buf = BytesMut::new();
        buf.put_u8(SSH_AGENTC_SIGN_REQUEST);
        put_string(&mut buf, b"blob");
        put_string(&mut buf, b"session-data");
        buf.put_u32(SSH_AGENT_RSA_SHA2_512);

        assert_eq!(
            AgentRequest::decode(&buf).unwrap(),
            AgentRequest::SignRequest {
                key_blob: Bytes::from_static(b"blob"),
                data: Bytes::from_static(b"session-data"),
                flags: SSH_AGENT_RSA_SHA2_512,
            }
        );
    }

    #[test]
    fn test_truncated_sign_request_is_rejected() {
        let body = [SSH_AGENTC_SIGN_REQUEST, 0, 0, 0, 9, b'x'];
        assert!(matches!(
            AgentRequest::decode(&body),
            Err(SshError::AgentError(_))
        ));
        assert!(AgentRequest::decode(&[]).is_err());
    }

    #[test]
    fn test_unknown_type_and_failure_byte() {
        assert_eq!(AgentRequest::decode(&[17]).unwrap(), AgentRequest::Unknown(17));
        assert_eq!(&AgentResponse::Failure.encode()[..], &[0x05]);
        assert_eq!(
            &AgentResponse::Signature(Bytes::from_static(b"sig")).encode()[..],
            &[14, 0, 0, 0, 3, b's', b'i', b'g']
        );
    }

    #[test]
    fn test_frame_len_bounds() {
        assert_eq!(frame_len([0, 0, 0, 5]).unwrap(), 5);
        assert!(frame_len([0, 0, 0, 0]).is_err());
        assert!(frame_len([0xff, 0, 0, 0]).is_err());
        assert_eq!(&frame(b"ab")[..], &[0, 0, 0, 2, b'a', b'b']);
    }
}
