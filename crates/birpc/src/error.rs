//! Error types for the peer engine and codecs.

use std::fmt;
use std::sync::Arc;

/// Errors produced by a codec while framing or (de)serializing messages.
#[derive(Debug)]
pub enum CodecError {
    /// Clean end of stream at a message boundary.
    Eof,
    /// I/O failure on the underlying stream.
    Io(std::io::Error),
    /// Failed to serialize a header or body.
    Encode(String),
    /// Failed to deserialize a header or body.
    Decode(String),
    /// A frame that violates the message contract.
    InvalidMessage(String),
    /// The codec was closed locally.
    Closed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "end of stream"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            Self::Closed => write!(f, "codec closed"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors surfaced to callers of the peer engine.
///
/// Errors that fan out to every pending call during shutdown are `Clone`;
/// codec failures are shared through an `Arc` for the same reason.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// The engine is closing or closed.
    Shutdown,
    /// The connection went away before the call completed.
    Disconnected,
    /// The caller's cancellation fired before the call completed.
    Canceled,
    /// The remote handler returned an error; the message is the peer's string.
    Remote(String),
    /// The codec or transport failed.
    Codec(Arc<CodecError>),
    /// The response body could not be decoded into the reply type.
    BodyRead(Arc<CodecError>),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "connection is shut down"),
            Self::Disconnected => write!(f, "unexpected EOF"),
            Self::Canceled => write!(f, "call canceled"),
            // Remote errors print bare: callers pattern-match on strings like
            // "birpc: can't find method <name>".
            Self::Remote(msg) => write!(f, "{msg}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::BodyRead(e) => write!(f, "reading body: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) | Self::BodyRead(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        Self::Codec(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_bare_message() {
        let err = RpcError::Remote("birpc: can't find method foo".into());
        assert_eq!(err.to_string(), "birpc: can't find method foo");
    }

    #[test]
    fn shutdown_and_eof_messages() {
        assert_eq!(RpcError::Shutdown.to_string(), "connection is shut down");
        assert_eq!(RpcError::Disconnected.to_string(), "unexpected EOF");
    }
}
