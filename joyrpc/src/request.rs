use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    codec::Codec,
    error::{Error, Result},
    msg::{Message, MsgFlags, MsgMeta, Payload},
};

/// One outbound call: routing target, encoded arguments, and deadline.
///
/// Arguments are encoded at construction so the interceptor chain sees a
/// stable byte view and transforms attachments rather than typed values.
#[derive(Clone, Debug)]
pub struct Request {
    pub service: String,
    pub alias: String,
    pub method: String,
    pub attachments: BTreeMap<String, String>,
    pub payload: Bytes,
    pub codec: Codec,
    pub timeout: Duration,
}

impl Request {
    /// # Errors
    ///
    /// Fails with `Serialization` when the arguments cannot be encoded.
    pub fn new<P: Serialize>(
        service: &str,
        alias: &str,
        method: &str,
        codec: Codec,
        args: &P,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            service: service.to_string(),
            alias: alias.to_string(),
            method: method.to_string(),
            attachments: BTreeMap::new(),
            payload: codec.encode(args)?,
            codec,
            timeout,
        })
    }

    /// Frame metadata for this request.
    #[must_use]
    pub fn to_meta(&self) -> MsgMeta {
        MsgMeta {
            msgid: 0,
            flags: MsgFlags::IsReq | self.codec.flags(),
            service: self.service.clone(),
            alias: self.alias.clone(),
            method: self.method.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// Outcome of one call as seen by the interceptor chain: either a payload to
/// decode or the error that ended the call. Filters observe both.
#[derive(Debug)]
pub struct Response {
    pub result: Result<Payload>,
    pub attachments: BTreeMap<String, String>,
    pub codec: Codec,
}

impl Response {
    #[must_use]
    pub fn ok(payload: Payload, codec: Codec) -> Self {
        Self {
            result: Ok(payload),
            attachments: BTreeMap::new(),
            codec,
        }
    }

    #[must_use]
    pub fn error(error: Error) -> Self {
        Self {
            result: Err(error),
            attachments: BTreeMap::new(),
            codec: Codec::Json,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Interprets a response frame. A frame flagged as an error carries an
    /// encoded [`Error`] as its payload.
    #[must_use]
    pub fn from_message(msg: Message) -> Self {
        let codec = Codec::from_flags(msg.meta.flags);
        let result = if msg.meta.is_error() {
            match codec.decode::<Error>(&msg.payload) {
                Ok(error) => Err(error),
                Err(decode_error) => Err(decode_error),
            }
        } else {
            Ok(msg.payload)
        };
        Self {
            result,
            attachments: msg.meta.attachments,
            codec,
        }
    }

    /// Decodes the payload, or surfaces the call error.
    ///
    /// # Errors
    pub fn decode<R: DeserializeOwned>(self) -> Result<R> {
        let payload = self.result?;
        self.codec.decode(&payload)
    }
}
