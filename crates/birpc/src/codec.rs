//! The codec seam between the peer engine and the wire.
//!
//! A codec frames requests and responses on a byte stream. The engine is the
//! only caller: one reader task drives the `read_*` methods in header/body
//! order, and writers are serialized externally by the engine's send lock.
//! Codecs still guard their halves internally so the trait can be used on
//! `&self` (the same interior-mutex layout as a stream transport).

use futures::future::BoxFuture;

use crate::error::CodecError;
use crate::frame::{Body, Request, Response, WireFormat};

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Frames peer messages on a bidirectional byte stream.
///
/// Methods return boxed futures so the trait stays object-safe; the engine
/// holds codecs as `Arc<dyn Codec>`.
pub trait Codec: Send + Sync + 'static {
    /// Wire format of the bodies this codec produces and consumes.
    fn format(&self) -> WireFormat;

    /// Read the next frame header, populating exactly one of the two slots.
    /// The other slot is left in its default state; a non-empty method means
    /// the frame is a request. Returns `CodecError::Eof` at a clean end of
    /// stream.
    fn read_header<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), CodecError>>;

    /// Read the body of the request whose header was just returned. Must be
    /// called exactly once per request frame, even when the request will not
    /// be dispatched: dropping the returned [`Body`] is the discard path and
    /// keeps the stream in sync.
    fn read_request_body(&self) -> BoxFuture<'_, Result<Body, CodecError>>;

    /// Read the body of the response whose header was just returned. As with
    /// requests, dropping the returned [`Body`] discards it.
    fn read_response_body(&self) -> BoxFuture<'_, Result<Body, CodecError>>;

    /// Write one complete request frame. `body` must carry this codec's wire
    /// format. Atomic relative to other writes on this codec.
    fn write_request<'a>(
        &'a self,
        req: &'a Request,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>>;

    /// Write one complete response frame.
    fn write_response<'a>(
        &'a self,
        resp: &'a Response,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>>;

    /// Close the codec. Idempotent; subsequent reads yield `Eof` and writes
    /// fail with `Closed`.
    fn close(&self) -> BoxFuture<'_, Result<(), CodecError>>;
}

fn check_format(expected: WireFormat, body: &Body) -> Result<(), CodecError> {
    if body.format() == expected {
        Ok(())
    } else {
        Err(CodecError::Encode(format!(
            "body encoded as {:?}, codec speaks {:?}",
            body.format(),
            expected
        )))
    }
}
