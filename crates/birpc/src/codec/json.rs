//! JSON codec: one envelope object per line.
//!
//! Request: `{"method": "...", "params": <any>, "id": <number|null>}`, where a
//! null or absent id marks a notification. Response: `{"result": <any>,
//! "error": <string|null>, "id": <number>}`. Params and results are kept as
//! raw JSON until a handler or caller decodes them into its declared type, so
//! pre-encoded arguments pass through untouched.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{check_format, Codec};
use crate::error::CodecError;
use crate::frame::{Body, Request, Response, WireFormat};

/// Codec speaking newline-delimited JSON envelopes.
pub struct JsonCodec<R, W> {
    reader: AsyncMutex<JsonReader<R>>,
    writer: AsyncMutex<W>,
    closed: CancellationToken,
}

struct JsonReader<R> {
    lines: BufReader<R>,
    /// Raw body of the message whose header was last returned, consumed by
    /// exactly one `read_*_body` call.
    pending: Option<PendingBody>,
}

enum PendingBody {
    Params(Option<Box<RawValue>>),
    Result(Option<Box<RawValue>>),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Box<RawValue>>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    method: &'a str,
    params: &'a RawValue,
    id: Option<u64>,
}

#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    result: &'a RawValue,
    error: Option<&'a str>,
    id: u64,
}

impl<S> JsonCodec<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a codec by splitting the given stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        JsonCodec {
            reader: AsyncMutex::new(JsonReader {
                lines: BufReader::new(reader),
                pending: None,
            }),
            writer: AsyncMutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

impl JsonCodec<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>> {
    /// Create a connected pair of codecs for testing, backed by
    /// `tokio::io::duplex`.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }
}

fn raw_view(body: &Body) -> Result<&RawValue, CodecError> {
    serde_json::from_slice(body.bytes()).map_err(|e| CodecError::Encode(e.to_string()))
}

impl<R, W> JsonCodec<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn write_line(&self, mut line: Vec<u8>) -> Result<(), CodecError> {
        if self.closed.is_cancelled() {
            return Err(CodecError::Closed);
        }
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl<R, W> Codec for JsonCodec<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn format(&self) -> WireFormat {
        WireFormat::Json
    }

    fn read_header<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            let mut reader = self.reader.lock().await;
            let mut line = String::new();
            let n = tokio::select! {
                _ = self.closed.cancelled() => return Err(CodecError::Eof),
                r = reader.lines.read_line(&mut line) => r?,
            };
            if n == 0 {
                return Err(CodecError::Eof);
            }
            let env: Envelope =
                serde_json::from_str(&line).map_err(|e| CodecError::Decode(e.to_string()))?;
            match env.method {
                Some(method) if !method.is_empty() => {
                    req.seq = env.id.unwrap_or(0);
                    req.method = method;
                    reader.pending = Some(PendingBody::Params(env.params));
                }
                _ => {
                    resp.seq = env.id.ok_or_else(|| {
                        CodecError::InvalidMessage("response without an id".into())
                    })?;
                    resp.error = env.error.unwrap_or_default();
                    reader.pending = Some(PendingBody::Result(env.result));
                }
            }
            Ok(())
        })
    }

    fn read_request_body(&self) -> BoxFuture<'_, Result<Body, CodecError>> {
        Box::pin(async move {
            let mut reader = self.reader.lock().await;
            match reader.pending.take() {
                Some(PendingBody::Params(params)) => {
                    let bytes = match params {
                        // Null params decode as a single nil argument.
                        Some(raw) if raw.get() != "null" => raw.get().as_bytes().to_vec(),
                        _ => b"[null]".to_vec(),
                    };
                    Ok(Body::from_bytes(WireFormat::Json, bytes))
                }
                _ => Err(CodecError::InvalidMessage(
                    "no request body pending".into(),
                )),
            }
        })
    }

    fn read_response_body(&self) -> BoxFuture<'_, Result<Body, CodecError>> {
        Box::pin(async move {
            let mut reader = self.reader.lock().await;
            match reader.pending.take() {
                Some(PendingBody::Result(result)) => {
                    let bytes = match result {
                        Some(raw) => raw.get().as_bytes().to_vec(),
                        None => b"null".to_vec(),
                    };
                    Ok(Body::from_bytes(WireFormat::Json, bytes))
                }
                _ => Err(CodecError::InvalidMessage(
                    "no response body pending".into(),
                )),
            }
        })
    }

    fn write_request<'a>(
        &'a self,
        req: &'a Request,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            check_format(WireFormat::Json, body)?;
            let env = RequestEnvelope {
                method: &req.method,
                params: raw_view(body)?,
                id: if req.seq == 0 { None } else { Some(req.seq) },
            };
            let line = serde_json::to_vec(&env).map_err(|e| CodecError::Encode(e.to_string()))?;
            self.write_line(line).await
        })
    }

    fn write_response<'a>(
        &'a self,
        resp: &'a Response,
        body: &'a Body,
    ) -> BoxFuture<'a, Result<(), CodecError>> {
        Box::pin(async move {
            check_format(WireFormat::Json, body)?;
            let env = ResponseEnvelope {
                result: raw_view(body)?,
                error: if resp.error.is_empty() {
                    None
                } else {
                    Some(&resp.error)
                },
                id: resp.seq,
            };
            let line = serde_json::to_vec(&env).map_err(|e| CodecError::Encode(e.to_string()))?;
            self.write_line(line).await
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
