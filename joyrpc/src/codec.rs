use serde::{Serialize, de::DeserializeOwned};

use bytes::Bytes;

use crate::{
    error::Result,
    msg::MsgFlags,
};

/// Payload serialization format, selected per message by a frame flag.
///
/// The codec applies to the payload only; the meta section is always JSON so
/// routing never depends on this choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    Json,
    #[default]
    MessagePack,
}

impl Codec {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MessagePack => "msgpack",
        }
    }

    /// Flag bits announcing this codec on the wire.
    #[must_use]
    pub fn flags(self) -> MsgFlags {
        match self {
            Codec::Json => MsgFlags::empty(),
            Codec::MessagePack => MsgFlags::UseMessagePack,
        }
    }

    /// Codec announced by an incoming frame.
    #[must_use]
    pub fn from_flags(flags: MsgFlags) -> Self {
        if flags.contains(MsgFlags::UseMessagePack) {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    /// # Errors
    pub fn encode<P: Serialize>(self, payload: &P) -> Result<Bytes> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(payload)?.into()),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(payload)?.into()),
        }
    }

    /// # Errors
    pub fn decode<P: DeserializeOwned>(self, bytes: &[u8]) -> Result<P> {
        if bytes.is_empty() {
            // an empty payload decodes as null, so unit replies need no body.
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_roundtrip_both_codecs() {
        let sample = Sample {
            name: "echo".into(),
            count: 3,
        };
        for codec in [Codec::Json, Codec::MessagePack] {
            let bytes = codec.encode(&sample).unwrap();
            let back: Sample = codec.decode(&bytes).unwrap();
            assert_eq!(back, sample);
        }
    }

    #[test]
    fn test_flags_roundtrip() {
        for codec in [Codec::Json, Codec::MessagePack] {
            assert_eq!(Codec::from_flags(codec.flags()), codec);
        }
    }

    #[test]
    fn test_empty_payload_decodes_as_unit() {
        let value: () = Codec::Json.decode(&[]).unwrap();
        let _ = value;
        let value: Option<u32> = Codec::MessagePack.decode(&[]).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let result: Result<Sample> = Codec::Json.decode(b"{");
        assert_eq!(
            result.unwrap_err().kind,
            crate::error::ErrorKind::Serialization
        );
    }
}
