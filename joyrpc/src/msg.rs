use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, ErrorKind, Result};

/// Leading frame magic, `JRPC` in ASCII.
pub(crate) const MAGIC: u32 = 0x4A52_5043;

/// Hard parser cap; frames above this are a protocol violation regardless of
/// the per-channel payload setting.
pub(crate) const MAX_FRAME_SIZE: usize = 64 << 20;

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        const IsReq = 1;
        const IsRsp = 2;
        const Heartbeat = 4;
        const UseMessagePack = 8;
        const IsError = 16;
    }
}

/// Frame metadata: direction, routing target, and session attachments.
///
/// The meta section is JSON on the wire regardless of the payload codec, so
/// any peer can route a frame without negotiating serialization first.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    pub msgid: u64,
    pub flags: MsgFlags,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, String>,
}

impl MsgMeta {
    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn is_rsp(&self) -> bool {
        self.flags.contains(MsgFlags::IsRsp)
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.flags.contains(MsgFlags::Heartbeat)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.flags.contains(MsgFlags::IsError)
    }
}

/// Opaque message body.
#[derive(Debug, Default, Clone)]
pub enum Payload {
    #[default]
    Empty,
    Normal(Bytes),
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Normal(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Normal(bytes) => bytes,
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            Payload::Empty
        } else {
            Payload::Normal(value)
        }
    }
}

impl From<Payload> for Bytes {
    fn from(value: Payload) -> Self {
        match value {
            Payload::Empty => Bytes::new(),
            Payload::Normal(bytes) => bytes,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Payload,
}

impl Message {
    #[must_use]
    pub fn new(meta: MsgMeta, payload: Payload) -> Self {
        Self { meta, payload }
    }

    /// Parses a frame body (everything after the 8-byte header).
    ///
    /// # Errors
    ///
    /// Fails with `Serialization` when the meta section is truncated or not
    /// valid JSON.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        const S: usize = std::mem::size_of::<u32>();

        let len = bytes.len();
        if len < S {
            return Err(Error::new(
                ErrorKind::Serialization,
                format!("invalid frame length: {len}"),
            ));
        }
        let meta_len = u32::from_be_bytes(bytes[..S].try_into().unwrap_or_default()) as usize;
        let offset = S + meta_len;
        if offset > len {
            return Err(Error::new(
                ErrorKind::Serialization,
                format!("invalid meta length: {meta_len}, frame length: {len}"),
            ));
        }

        let meta: MsgMeta = serde_json::from_slice(&bytes[S..offset])?;
        Ok(Message {
            meta,
            payload: bytes.slice(offset..).into(),
        })
    }
}

/// Encodes a full frame: magic, body length, meta section, payload.
///
/// # Errors
///
/// Fails with `Serialization` when the meta section cannot be encoded or the
/// frame would exceed the hard parser cap.
pub(crate) fn encode_frame(meta: &MsgMeta, payload: &[u8]) -> Result<Bytes> {
    let meta_bytes = serde_json::to_vec(meta)?;
    let body_len = std::mem::size_of::<u32>() + meta_bytes.len() + payload.len();
    if body_len >= MAX_FRAME_SIZE {
        return Err(Error::new(
            ErrorKind::Serialization,
            format!("frame is too long: {body_len}"),
        ));
    }

    let body_len = u32::try_from(body_len).map_err(|e| {
        Error::new(ErrorKind::Serialization, e.to_string())
    })?;
    let meta_len = u32::try_from(meta_bytes.len()).map_err(|e| {
        Error::new(ErrorKind::Serialization, e.to_string())
    })?;

    let mut buffer = BytesMut::with_capacity(8 + body_len as usize);
    buffer.extend_from_slice(&MAGIC.to_be_bytes());
    buffer.extend_from_slice(&body_len.to_be_bytes());
    buffer.extend_from_slice(&meta_len.to_be_bytes());
    buffer.extend_from_slice(&meta_bytes);
    buffer.extend_from_slice(payload);
    Ok(buffer.freeze())
}

/// Extracts the next complete frame body from the receive buffer, or `None`
/// when more bytes are needed.
///
/// # Errors
///
/// Fails with `Serialization` on a bad magic or an over-cap length; the
/// caller is expected to close the connection.
pub(crate) fn split_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    const S: usize = std::mem::size_of::<u64>();
    if buffer.len() < S {
        return Ok(None);
    }
    let header = u64::from_be_bytes(buffer[..S].try_into().unwrap_or_default());
    if (header >> 32) as u32 != MAGIC {
        return Err(Error::new(
            ErrorKind::Serialization,
            format!("invalid frame header: {header:016X}"),
        ));
    }

    let len = (header & u64::from(u32::MAX)) as usize;
    if S + len >= MAX_FRAME_SIZE {
        return Err(Error::new(
            ErrorKind::Serialization,
            format!("frame is too long: {len}"),
        ));
    }

    if buffer.len() < S + len {
        Ok(None)
    } else {
        buffer.advance(S);
        Ok(Some(buffer.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MsgMeta {
        MsgMeta {
            msgid: 7,
            flags: MsgFlags::IsReq,
            service: "io.joyrpc.Echo".into(),
            alias: "prod".into(),
            method: "echo".into(),
            attachments: [("trace.id".to_string(), "abc".to_string())].into(),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(&meta(), b"\"abc\"").unwrap();
        let mut buffer = BytesMut::from(&frame[..]);

        let body = split_frame(&mut buffer).unwrap().unwrap();
        assert!(buffer.is_empty());

        let msg = Message::parse(body).unwrap();
        assert_eq!(msg.meta, meta());
        assert_eq!(msg.payload.as_slice(), b"\"abc\"");
    }

    #[test]
    fn test_split_frame_needs_more_bytes() {
        let frame = encode_frame(&meta(), b"\"abc\"").unwrap();
        let mut buffer = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(split_frame(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(split_frame(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn test_split_frame_rejects_bad_magic() {
        let mut buffer = BytesMut::from(&[0u8; 16][..]);
        assert!(split_frame(&mut buffer).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_meta() {
        let frame = encode_frame(&meta(), b"").unwrap();
        let mut buffer = BytesMut::from(&frame[..]);
        let body = split_frame(&mut buffer).unwrap().unwrap();

        let truncated = body.slice(..body.len() - 2);
        assert!(Message::parse(truncated).is_err());
    }

    #[test]
    fn test_heartbeat_flags_are_distinct() {
        let ping = MsgMeta {
            msgid: 1,
            flags: MsgFlags::Heartbeat | MsgFlags::IsReq,
            ..MsgMeta::default()
        };
        assert!(ping.is_heartbeat());
        assert!(ping.is_req());
        assert!(!ping.is_rsp());
    }
}
