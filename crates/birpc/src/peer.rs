//! Peer: one endpoint of a bidirectional RPC connection.
//!
//! A peer owns the codec and binds two independent streams onto it: a
//! monotonically numbered outbound call stream, and a handler-dispatch stream
//! for inbound requests. Only `Peer::run` reads from the codec; all frame
//! routing happens off the read loop.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │             Peer             │
//!                 ├──────────────────────────────┤
//!                 │  codec: Arc<dyn Codec>       │
//!                 │  outbound: seq -> Call       │
//!                 │  inbound:  seq -> CancelTok  │
//!                 │  registry: Arc<Registry>     │
//!                 └──────────────┬───────────────┘
//!                                │
//!                           read loop
//!                                │
//!              ┌─────────────────┴─────────────────┐
//!              │                                   │
//!      request? (method != "")            response? (method == "")
//!              │                                   │
//!   ┌──────────▼──────────┐            ┌───────────▼───────────┐
//!   │ decode args, spawn  │            │ remove pending entry, │
//!   │ handler, respond    │            │ complete the Call     │
//!   └─────────────────────┘            └───────────────────────┘
//! ```
//!
//! Senders (`call`, `go`, `notify`, response emission) serialize on one send
//! lock; it is held only across a single codec write, never while waiting on
//! user code. The outbound pending table and the shutdown/closing flags share
//! a second, briefly-held lock. The terminal shutdown sweep takes send lock
//! then table lock, the same order as the send path.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as SendLock};
use tokio_util::sync::CancellationToken;

use crate::call::{Call, DoneSender, Outbound};
use crate::codec::{Codec, MsgPackCodec};
use crate::error::{CodecError, RpcError};
use crate::frame::{Body, Request, Response, WireFormat};
use crate::registry::{Outcome, Registry};
use crate::state::State;

/// Name of the built-in cancellation method. The `_goRPC_.` namespace is
/// reserved for engine methods; user registrations there are not forbidden
/// but invite collision, and this exact name is always resolved by the
/// engine first.
pub const CANCEL_METHOD: &str = "_goRPC_.Cancel";

/// Argument of the built-in cancel service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelArgs {
    pub seq: u64,
}

/// Per-dispatch bundle handed to handlers: the peer (for callbacks to the
/// originating side) and the cancellation token for this dispatch.
#[derive(Clone)]
pub struct Context {
    peer: Arc<Peer>,
    cancel: CancellationToken,
}

impl Context {
    /// The peer this request arrived on. Calls made through it go back to
    /// the originating side, so handlers can invoke the caller recursively.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Cancellation token for this dispatch, tripped by the remote's cancel
    /// service. Handlers should return promptly once it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// One endpoint of a bidirectional RPC connection.
pub struct Peer {
    codec: Arc<dyn Codec>,
    format: WireFormat,
    /// Send serializer: exactly one writer holds it per codec write.
    send: SendLock<()>,
    /// Outbound pending table plus shutdown/closing flags.
    outbound: Mutex<Outbound>,
    /// Inbound pending table: running dispatches by sequence number.
    inbound: Mutex<HashMap<u64, CancellationToken>>,
    registry: Arc<Registry>,
    state: Arc<State>,
    disconnect: CancellationToken,
    blocking: AtomicBool,
    server: bool,
}

impl Peer {
    /// Create a peer over a byte stream with the default MessagePack codec.
    pub fn new<S>(stream: S) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Peer::with_codec(MsgPackCodec::new(stream))
    }

    /// Create a peer over an explicit codec.
    pub fn with_codec<C: Codec>(codec: C) -> Arc<Peer> {
        Peer::build(
            Arc::new(codec),
            Arc::new(Registry::new()),
            Arc::new(State::new()),
            false,
        )
    }

    pub(crate) fn serve<C: Codec>(
        codec: C,
        registry: Arc<Registry>,
        state: Arc<State>,
    ) -> Arc<Peer> {
        Peer::build(Arc::new(codec), registry, state, true)
    }

    fn build(
        codec: Arc<dyn Codec>,
        registry: Arc<Registry>,
        state: Arc<State>,
        server: bool,
    ) -> Arc<Peer> {
        let format = codec.format();
        Arc::new(Peer {
            codec,
            format,
            send: SendLock::new(()),
            outbound: Mutex::new(Outbound::new()),
            inbound: Mutex::new(HashMap::new()),
            registry,
            state,
            disconnect: CancellationToken::new(),
            blocking: AtomicBool::new(false),
            server,
        })
    }

    /// Register a handler on this peer's registry. For a served peer the
    /// registry is the server's, shared by every connection it serves.
    ///
    /// # Panics
    ///
    /// Panics on duplicate names and on registration after first use; see
    /// [`Registry::handle`].
    pub fn handle<A, R, E, F, Fut>(&self, method: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: std::fmt::Display,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, E>> + Send + 'static,
    {
        self.registry.handle(method, f);
    }

    /// In blocking mode, inbound requests run inline on the read loop in
    /// arrival order; a slow handler stalls subsequent requests on this
    /// connection. Off by default: each dispatch runs in its own task.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// State slot bound to this peer for its whole lifetime.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Token cancelled exactly once, after every pending outbound call has
    /// been completed during teardown.
    pub fn disconnect_notify(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    /// Invoke `method` and wait for its reply, or for `cancel` to fire.
    ///
    /// On cancellation the pending entry is removed, a best-effort
    /// `_goRPC_.Cancel` is sent to the peer if the request was already on the
    /// wire, and `RpcError::Canceled` is returned.
    pub async fn call<A, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        args: &A,
    ) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        // Room for this call's strobe plus the internal cancel call's.
        let (tx, mut rx) = mpsc::channel(2);
        let call = self.go(method, args, Some(tx.clone())).await;

        tokio::select! {
            done = rx.recv() => {
                let done = done.expect("done channel open while sender is held");
                match done.result().expect("strobed call carries a result") {
                    Ok(body) => body.decode().map_err(|e| RpcError::BodyRead(Arc::new(e))),
                    Err(e) => Err(e.clone()),
                }
            }
            _ = cancel.cancelled() => {
                let (seq, was_pending) = {
                    let mut outbound = self.outbound.lock();
                    let seq = call.seq();
                    let was_pending = outbound.remove(seq).is_some();
                    if seq == 0 {
                        // Not sent yet; the stamp vetoes a racing send.
                        call.mark_cancelled_before_send();
                    }
                    (seq, was_pending)
                };
                if seq != 0 && was_pending {
                    let _ = self.go(CANCEL_METHOD, &CancelArgs { seq }, Some(tx)).await;
                }
                Err(RpcError::Canceled)
            }
        }
    }

    /// Start a call without waiting for its reply. The returned [`Call`] is
    /// strobed on `done` exactly once when it completes; when `done` is
    /// absent a channel with capacity 10 is allocated and parked on the
    /// call, so the caller can still await completion with [`Call::wait`].
    pub async fn go<A>(&self, method: &str, args: &A, done: Option<DoneSender>) -> Arc<Call>
    where
        A: Serialize + ?Sized,
    {
        let call = Arc::new(Call::new(method, done));
        match Body::encode(self.format, args) {
            Ok(body) => self.send_call(&call, body).await,
            Err(e) => call.complete(Err(e.into())),
        }
        call
    }

    /// Send a one-way request with sequence number zero. The remote never
    /// responds and no pending entry is created.
    pub async fn notify<A>(&self, method: &str, args: &A) -> Result<(), RpcError>
    where
        A: Serialize + ?Sized,
    {
        let body = Body::encode(self.format, args)?;
        let _send = self.send.lock().await;
        {
            let outbound = self.outbound.lock();
            if outbound.shutdown || outbound.closing {
                return Err(RpcError::Shutdown);
            }
        }
        let req = Request {
            seq: 0,
            method: method.to_string(),
        };
        self.codec.write_request(&req, &body).await?;
        Ok(())
    }

    /// Assign a sequence number, insert into the pending table, and write the
    /// request. Write failure removes the entry and completes the call.
    async fn send_call(&self, call: &Arc<Call>, body: Body) {
        let _send = self.send.lock().await;
        let seq = {
            let mut outbound = self.outbound.lock();
            if outbound.shutdown || outbound.closing {
                drop(outbound);
                call.complete(Err(RpcError::Shutdown));
                return;
            }
            if call.seq() != 0 {
                // Canceled before the send lock was acquired.
                drop(outbound);
                call.complete(Err(RpcError::Canceled));
                return;
            }
            outbound.register(call)
        };
        let req = Request {
            seq,
            method: call.method().to_string(),
        };
        if let Err(e) = self.codec.write_request(&req, &body).await {
            let removed = self.outbound.lock().remove(seq);
            if let Some(call) = removed {
                call.complete(Err(e.into()));
            }
        }
    }

    /// Begin closing: further sends reject with `Shutdown` and the read loop
    /// unwinds. Idempotent; a second close returns `Shutdown`.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut outbound = self.outbound.lock();
            if outbound.shutdown || outbound.closing {
                return Err(RpcError::Shutdown);
            }
            outbound.closing = true;
        }
        self.codec.close().await?;
        Ok(())
    }

    /// Run the read loop. Must be running before any call can complete; the
    /// usual shape is `tokio::spawn(peer.clone().run())`.
    ///
    /// On exit every pending outbound call is completed with the terminal
    /// error, then the disconnect token fires.
    pub async fn run(self: Arc<Self>) {
        let err = self.read_loop().await;

        let _send = self.send.lock().await;
        let (calls, final_err, closing) = {
            let mut outbound = self.outbound.lock();
            outbound.shutdown = true;
            let closing = outbound.closing;
            let final_err = match err {
                CodecError::Eof if closing => RpcError::Shutdown,
                CodecError::Eof => RpcError::Disconnected,
                other => RpcError::Codec(Arc::new(other)),
            };
            (outbound.drain(), final_err, closing)
        };
        if let RpcError::Codec(e) = &final_err {
            if !closing && !self.server {
                tracing::debug!(error = %e, "peer protocol error");
            }
        }
        for call in calls {
            call.complete(Err(final_err.clone()));
        }
        drop(_send);

        self.disconnect.cancel();
        if !closing {
            if let Err(e) = self.codec.close().await {
                tracing::debug!(error = %e, "error closing codec");
            }
        }
    }

    async fn read_loop(self: &Arc<Self>) -> CodecError {
        loop {
            let mut req = Request::default();
            let mut resp = Response::default();
            if let Err(e) = self.codec.read_header(&mut req, &mut resp).await {
                return e;
            }
            let result = if !req.method.is_empty() {
                self.read_request(req).await
            } else {
                self.read_response(resp).await
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "error reading message");
                return e;
            }
        }
    }

    async fn read_request(self: &Arc<Self>, req: Request) -> Result<(), CodecError> {
        if req.method == CANCEL_METHOD {
            return self.cancel_dispatch(req.seq).await;
        }

        let Some(handler) = self.registry.lookup(&req.method) else {
            // Drain the body so framed codecs stay in sync.
            let _ = self.codec.read_request_body().await?;
            if req.seq == 0 {
                tracing::debug!(method = %req.method, "dropping notification for unknown method");
                return Ok(());
            }
            let resp = Response {
                seq: req.seq,
                error: format!("birpc: can't find method {}", req.method),
            };
            let _send = self.send.lock().await;
            return self.codec.write_response(&resp, &Body::unit(self.format)).await;
        };

        let body = self.codec.read_request_body().await?;
        let args = (handler.decode)(&body)?;

        let token = CancellationToken::new();
        if req.seq != 0 {
            self.inbound.lock().insert(req.seq, token.clone());
        }
        let ctx = Context {
            peer: self.clone(),
            cancel: token,
        };
        let outcome = (handler.invoke)(ctx, args, self.format);

        if self.blocking.load(Ordering::Relaxed) {
            self.finish_dispatch(req.seq, outcome).await;
        } else {
            let peer = self.clone();
            let seq = req.seq;
            tokio::spawn(async move {
                peer.finish_dispatch(seq, outcome).await;
            });
        }
        Ok(())
    }

    /// Built-in `_goRPC_.Cancel`: trip the cancel token of the inbound
    /// dispatch named by the argument. Runs inline; it never blocks.
    async fn cancel_dispatch(&self, seq: u64) -> Result<(), CodecError> {
        let args: CancelArgs = self.codec.read_request_body().await?.decode()?;
        if let Some(token) = self.inbound.lock().remove(&args.seq) {
            token.cancel();
        }
        if seq == 0 {
            return Ok(());
        }
        let resp = Response {
            seq,
            error: String::new(),
        };
        let _send = self.send.lock().await;
        self.codec.write_response(&resp, &Body::unit(self.format)).await
    }

    /// Await the handler and emit the response frame. Notifications drop the
    /// reply. The reply value is serialized even when the handler errored; if
    /// that serialization fails for an error-carrying response, the response
    /// is logged and dropped.
    async fn finish_dispatch(&self, seq: u64, outcome: BoxFuture<'static, Outcome>) {
        let outcome = match AssertUnwindSafe(outcome).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::warn!(seq, message = %message, "handler panicked");
                Outcome {
                    error: format!("birpc: handler panicked: {message}"),
                    body: Ok(Body::unit(self.format)),
                }
            }
        };

        if seq != 0 {
            let Outcome { error, body } = outcome;
            match body {
                Ok(body) => {
                    if let Err(e) = self.respond(seq, error, &body).await {
                        tracing::debug!(seq, error = %e, "error writing response");
                    }
                }
                Err(encode_err) if error.is_empty() => {
                    let error = format!("birpc: encoding reply: {encode_err}");
                    if let Err(e) = self.respond(seq, error, &Body::unit(self.format)).await {
                        tracing::debug!(seq, error = %e, "error writing response");
                    }
                }
                Err(encode_err) => {
                    tracing::debug!(seq, error = %encode_err, "dropping error response: reply failed to encode");
                }
            }
            self.inbound.lock().remove(&seq);
        }
    }

    async fn respond(&self, seq: u64, error: String, body: &Body) -> Result<(), CodecError> {
        let resp = Response { seq, error };
        let _send = self.send.lock().await;
        self.codec.write_response(&resp, body).await
    }

    async fn read_response(&self, resp: Response) -> Result<(), CodecError> {
        let call = self.outbound.lock().remove(resp.seq);
        match call {
            None => {
                // No pending call: either a partially failed send already
                // removed it, or this answers a cancelled call. Drain the
                // body; there is no one to give it to.
                self.codec
                    .read_response_body()
                    .await
                    .map_err(|e| CodecError::Decode(format!("reading error body: {e}")))?;
            }
            Some(call) if !resp.error.is_empty() => {
                let drained = self.codec.read_response_body().await;
                call.complete(Err(RpcError::Remote(resp.error)));
                drained.map_err(|e| CodecError::Decode(format!("reading error body: {e}")))?;
            }
            Some(call) => match self.codec.read_response_body().await {
                Ok(body) => call.complete(Ok(body)),
                Err(e) => {
                    let e = Arc::new(e);
                    call.complete(Err(RpcError::BodyRead(e.clone())));
                    return Err(CodecError::Decode(format!("reading body: {e}")));
                }
            },
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
