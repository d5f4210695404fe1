//! MessagePack codec: the self-describing binary family.
//!
//! # Wire format
//!
//! Every message is two records in declared order: a header record, then a
//! body record. Each record is a `u32` little-endian length prefix followed by
//! one MessagePack value. The header value is the triple
//! `(seq: u64, method: str, error: str)`; a response has an empty method and a
//! notification has `seq == 0`.

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{check_format, Codec};
use crate::error::CodecError;
use crate::frame::{Body, Request, Response, WireFormat};

/// Upper bound on a single record. Anything larger is a protocol violation.
const MAX_RECORD_LEN: usize = 64 << 20;

/// Codec speaking length-prefixed MessagePack records.
///
/// Works over any `AsyncRead + AsyncWrite` stream; the stream is split so
/// reads and writes proceed concurrently.
pub struct MsgPackCodec<R, W> {
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    closed: CancellationToken,
}

impl<S> MsgPackCodec<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a codec by splitting the given stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        MsgPackCodec {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

impl MsgPackCodec<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>> {
    /// Create a connected pair of codecs for testing, backed by
    /// `tokio::io::duplex`.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }
}

async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Eof
        } else {
            CodecError::Io(e)
        }
    })?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(CodecError::InvalidMessage(format!(
            "record of {len} bytes exceeds max {MAX_RECORD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(CodecError::Io)?;
    Ok(buf)
}

fn encode_header(seq: u64, method: &str, error: &str) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(&(seq, method, error)).map_err(|e| CodecError::Encode(e.to_string()))
}

fn frame_records(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + header.len() + body.len());
    frame.extend_from_slice(&(header.len() as u32).to_le_bytes());
    frame.extend_from_slice(header);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

impl<R, W> MsgPackCodec<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn write_frame(&self, frame: Vec<u8>) -> Result<(), CodecError> {
        if self.closed.is_cancelled() {
            return Err(CodecError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl<R, W> Codec for MsgPackCodec<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn format(&self) -> WireFormat {
        WireFormat::MsgPack
    }

    fn read_header<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            let record = {
                let mut reader = self.reader.lock().await;
                tokio::select! {
                    _ = self.closed.cancelled() => return Err(CodecError::Eof),
                    r = read_record(&mut *reader) => r?,
                }
            };
            let (seq, method, error): (u64, String, String) =
                rmp_serde::from_slice(&record).map_err(|e| CodecError::Decode(e.to_string()))?;
            if method.is_empty() {
                resp.seq = seq;
                resp.error = error;
            } else {
                req.seq = seq;
                req.method = method;
            }
            Ok(())
        })
    }

    fn read_request_body(&self) -> BoxFuture<'_, Result<Body, CodecError>> {
        Box::pin(async move {
            let mut reader = self.reader.lock().await;
            let record = read_record(&mut *reader).await?;
            Ok(Body::from_bytes(WireFormat::MsgPack, record))
        })
    }

    fn read_response_body(&self) -> BoxFuture<'_, Result<Body, CodecError>> {
        self.read_request_body()
    }

    fn write_request<'a>(
        &'a self,
        req: &'a Request,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            check_format(WireFormat::MsgPack, body)?;
            let header = encode_header(req.seq, &req.method, "")?;
            self.write_frame(frame_records(&header, body.bytes())).await
        })
    }

    fn write_response<'a>(
        &'a self,
        resp: &'a Response,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            check_format(WireFormat::MsgPack, body)?;
            let header = encode_header(resp.seq, "", &resp.error)?;
            self.write_frame(frame_records(&header, body.bytes())).await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CodecError>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(());
            }
            self.closed.cancel();
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrip() {
        let (a, b) = MsgPackCodec::pair();

        let req = Request {
            seq: 7,
            method: "add".into(),
        };
        let body = Body::encode(WireFormat::MsgPack, &(1i64, 2i64)).unwrap();
        a.write_request(&req, &body).await.unwrap();

        let mut got_req = Request::default();
        let mut got_resp = Response::default();
        b.read_header(&mut got_req, &mut got_resp).await.unwrap();
        assert_eq!(got_req, req);
        assert_eq!(got_resp, Response::default());

        let got_body = b.read_request_body().await.unwrap();
        let args: (i64, i64) = got_body.decode().unwrap();
        assert_eq!(args, (1, 2));
    }

    #[tokio::test]
    async fn response_roundtrip_with_error() {
        let (a, b) = MsgPackCodec::pair();

        let resp = Response {
            seq: 3,
            error: "birpc: can't find method foo".into(),
        };
        a.write_response(&resp, &Body::unit(WireFormat::MsgPack))
            .await
            .unwrap();

        let mut got_req = Request::default();
        let mut got_resp = Response::default();
        b.read_header(&mut got_req, &mut got_resp).await.unwrap();
        assert_eq!(got_req, Request::default());
        assert_eq!(got_resp, resp);

        // The body record is still on the wire; discarding keeps framing.
        let _ = b.read_response_body().await.unwrap();
    }

    #[tokio::test]
    async fn notification_has_seq_zero() {
        let (a, b) = MsgPackCodec::pair();

        let req = Request {
            seq: 0,
            method: "set".into(),
        };
        let body = Body::encode(WireFormat::MsgPack, &6i64).unwrap();
        a.write_request(&req, &body).await.unwrap();

        let mut got_req = Request::default();
        let mut got_resp = Response::default();
        b.read_header(&mut got_req, &mut got_resp).await.unwrap();
        assert_eq!(got_req.seq, 0);
        assert_eq!(got_req.method, "set");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_writes() {
        let (a, _b) = MsgPackCodec::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();

        let req = Request {
            seq: 1,
            method: "x".into(),
        };
        let err = a
            .write_request(&req, &Body::unit(WireFormat::MsgPack))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }

    #[tokio::test]
    async fn reads_after_close_yield_eof() {
        let (a, _b) = MsgPackCodec::pair();
        a.close().await.unwrap();

        let mut req = Request::default();
        let mut resp = Response::default();
        let err = a.read_header(&mut req, &mut resp).await.unwrap_err();
        assert!(matches!(err, CodecError::Eof));
    }

    #[tokio::test]
    async fn peer_drop_yields_eof() {
        let (a, b) = MsgPackCodec::pair();
        drop(a);

        let mut req = Request::default();
        let mut resp = Response::default();
        let err = b.read_header(&mut req, &mut resp).await.unwrap_err();
        assert!(matches!(err, CodecError::Eof));
    }

    #[tokio::test]
    async fn json_body_is_rejected() {
        let (a, _b) = MsgPackCodec::pair();
        let req = Request {
            seq: 1,
            method: "x".into(),
        };
        let err = a
            .write_request(&req, &Body::unit(WireFormat::Json))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)));
    }
}
