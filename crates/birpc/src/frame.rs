//! Message headers and bodies.
//!
//! A peer multiplexes two frame kinds on one stream. The discriminator is the
//! method field: a non-empty method means request, an empty method means
//! response. `seq == 0` on a request marks a notification, which never
//! receives a response.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Header of a request frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Sequence number; 0 designates a notification.
    pub seq: u64,
    /// Method name; non-empty.
    pub method: String,
}

/// Header of a response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the request this answers.
    pub seq: u64,
    /// Error message from the remote handler; empty denotes success.
    pub error: String,
}

/// Wire encodings a codec family can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Self-describing binary (MessagePack).
    MsgPack,
    /// JSON envelope, one object per line.
    Json,
}

/// One message body, still in wire form.
///
/// Bodies cross the codec boundary as encoded bytes plus their format, so
/// handler adapters registered once can serve connections of either codec
/// family. The party that knows the concrete type calls [`Body::decode`];
/// discarding a body is just dropping it, which for both codec families has
/// already consumed the body's framing.
#[derive(Debug, Clone)]
pub struct Body {
    format: WireFormat,
    bytes: Vec<u8>,
}

impl Body {
    /// Serialize `value` into a body of the given wire format.
    pub fn encode<T: Serialize + ?Sized>(format: WireFormat, value: &T) -> Result<Body, CodecError> {
        let bytes = match format {
            WireFormat::MsgPack => {
                rmp_serde::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?
            }
            WireFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?
            }
        };
        Ok(Body { format, bytes })
    }

    /// Deserialize this body into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self.format {
            WireFormat::MsgPack => {
                rmp_serde::from_slice(&self.bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            WireFormat::Json => {
                serde_json::from_slice(&self.bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }

    /// The unit body: MessagePack nil / JSON null. Used where a frame needs a
    /// body but there is no reply value, e.g. unknown-method responses.
    pub fn unit(format: WireFormat) -> Body {
        let bytes = match format {
            WireFormat::MsgPack => vec![0xc0],
            WireFormat::Json => b"null".to_vec(),
        };
        Body { format, bytes }
    }

    /// Wire format of this body.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub(crate) fn from_bytes(format: WireFormat, bytes: Vec<u8>) -> Body {
        Body { format, bytes }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
