//! Shared end-to-end scenarios for the birpc peer engine.
//!
//! Scenarios are generic over a [`CodecFactory`] so the same suite runs
//! against every codec family. Integration tests per family look like:
//!
//! ```ignore
//! struct MsgPackFactory;
//!
//! impl CodecFactory for MsgPackFactory {
//!     type Codec = MsgPackCodec<...>;
//!     async fn connect_pair() -> (Self::Codec, Self::Codec) {
//!         MsgPackCodec::pair()
//!     }
//! }
//!
//! #[tokio::test]
//! async fn call_with_nested_callback() {
//!     birpc_testkit::run_call_with_nested_callback::<MsgPackFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use birpc::{CancellationToken, Codec, Context, Peer, RpcError, Server, State};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Produces connected codec pairs of one family.
pub trait CodecFactory {
    type Codec: Codec;

    fn connect_pair() -> impl Future<Output = (Self::Codec, Self::Codec)> + Send;
}

/// Two-operand argument used by the arithmetic scenarios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

/// Reply of the arithmetic scenarios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply(pub i64);

/// Install a tracing subscriber honoring `RUST_LOG`, once per process. Safe
/// to call from every scenario; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serve `server` on one end of a fresh codec pair and hand back a client
/// peer on the other end. The client's read loop is not yet running, so the
/// caller can still register handlers on it.
pub async fn connect<F: CodecFactory>(server: Arc<Server>) -> (Arc<Peer>, JoinHandle<()>) {
    init_tracing();
    let (client_codec, server_codec) = F::connect_pair().await;
    let server_task = tokio::spawn(async move {
        server.serve_codec(server_codec).await;
    });
    (Peer::with_codec(client_codec), server_task)
}

fn arithmetic_server() -> Arc<Server> {
    let server = Arc::new(Server::new());
    server.handle("add", |ctx: Context, args: Args| async move {
        // Call back into the peer that invoked us, while still handling
        // its request.
        let nested: Reply = ctx
            .peer()
            .call(ctx.cancellation(), "mult", &Args { a: 2, b: 3 })
            .await?;
        assert_eq!(nested.0, 6);
        Ok::<Reply, RpcError>(Reply(args.a + args.b))
    });
    server
}

fn register_mult(client: &Peer) {
    client.handle("mult", |_ctx: Context, args: Args| async move {
        Ok::<Reply, RpcError>(Reply(args.a * args.b))
    });
}

/// S1: `add` whose handler calls the client's `mult` before replying.
pub async fn run_call_with_nested_callback<F: CodecFactory>() {
    let (client, _server_task) = connect::<F>(arithmetic_server()).await;
    register_mult(&client);
    tokio::spawn(client.clone().run());

    let reply: Reply = timeout(
        Duration::from_secs(5),
        client.call(&CancellationToken::new(), "add", &Args { a: 1, b: 2 }),
    )
    .await
    .expect("call timed out")
    .expect("add failed");
    assert_eq!(reply.0, 3);
}

/// S2: a notification reaches the handler and never gets a response.
pub async fn run_notification<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    let (number_tx, mut number_rx) = mpsc::channel::<i64>(1);
    server.handle("set", move |_ctx: Context, i: i64| {
        let number_tx = number_tx.clone();
        async move {
            number_tx.send(i).await.ok();
            Ok::<(), RpcError>(())
        }
    });
    server.handle("echo", |_ctx: Context, n: i64| async move { Ok::<i64, RpcError>(n) });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    client.notify("set", &6i64).await.expect("notify failed");
    let got = timeout(Duration::from_secs(1), number_rx.recv())
        .await
        .expect("no notification within 1s")
        .unwrap();
    assert_eq!(got, 6);

    // The stream is still in sync afterwards.
    let echoed: i64 = client
        .call(&CancellationToken::new(), "echo", &5i64)
        .await
        .expect("echo after notify");
    assert_eq!(echoed, 5);
}

/// S3: an unknown method yields exactly the wire-contract error string.
pub async fn run_unknown_method<F: CodecFactory>() {
    let (client, _server_task) = connect::<F>(Arc::new(Server::new())).await;
    tokio::spawn(client.clone().run());

    let err = client
        .call::<_, Reply>(&CancellationToken::new(), "foo", &1i64)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "birpc: can't find method foo");
}

/// S4: blocking mode still completes calls, including the nested callback
/// served inline on the client's read loop.
pub async fn run_blocking_mode<F: CodecFactory>() {
    let (client, _server_task) = connect::<F>(arithmetic_server()).await;
    register_mult(&client);
    client.set_blocking(true);
    tokio::spawn(client.clone().run());

    let reply: Reply = timeout(
        Duration::from_secs(5),
        client.call(&CancellationToken::new(), "add", &Args { a: 1, b: 2 }),
    )
    .await
    .expect("call timed out")
    .expect("add failed");
    assert_eq!(reply.0, 3);
}

/// `go` without a done channel allocates one and parks it on the call; the
/// caller awaits completion through the call itself and decodes the reply.
pub async fn run_go_with_default_channel<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    server.handle("echo", |_ctx: Context, n: i64| async move { Ok::<i64, RpcError>(n) });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    let call = client.go("echo", &7i64, None).await;
    let got: i64 = timeout(Duration::from_secs(5), call.wait())
        .await
        .expect("wait timed out")
        .expect("echo failed");
    assert_eq!(got, 7);
    assert!(matches!(call.reply::<i64>(), Some(Ok(7))));
}

/// Correlation: concurrent calls with distinct arguments each get their own
/// reply, regardless of interleaving.
pub async fn run_concurrent_correlation<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    server.handle("echo", |_ctx: Context, n: i64| async move { Ok::<i64, RpcError>(n) });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    let mut tasks = Vec::new();
    for n in 0..32i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let got: i64 = client
                .call(&CancellationToken::new(), "echo", &n)
                .await
                .expect("echo failed");
            assert_eq!(got, n);
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("correlation timed out")
            .unwrap();
    }
}

/// Shutdown drain: closing mid-flight strobes every outstanding call with a
/// shutdown error exactly once, before the disconnect signal fires.
pub async fn run_shutdown_drain<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    server.handle("linger", |_ctx: Context, _n: i64| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), RpcError>(())
    });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    let (done_tx, mut done_rx) = mpsc::channel(8);
    let mut calls = Vec::new();
    for n in 0..4i64 {
        calls.push(client.go("linger", &n, Some(done_tx.clone())).await);
    }

    let disconnected = client.disconnect_notify();
    client.close().await.expect("close failed");
    timeout(Duration::from_secs(1), disconnected.cancelled())
        .await
        .expect("disconnect signal did not fire");

    // By the time the disconnect token fires, every strobe must already be
    // buffered.
    let mut seen: Vec<Arc<birpc::Call>> = Vec::new();
    for _ in 0..calls.len() {
        let call = done_rx.try_recv().expect("missing strobe after disconnect");
        assert!(matches!(call.result(), Some(Err(RpcError::Shutdown))));
        assert!(!seen.iter().any(|c| Arc::ptr_eq(c, &call)));
        seen.push(call);
    }
    assert!(done_rx.try_recv().is_err());

    // A second close reports shutdown.
    assert!(matches!(client.close().await, Err(RpcError::Shutdown)));
}

/// Cancel round-trip: cancelling a long-running call is observed by the
/// server-side handler's context within a bounded delay.
pub async fn run_cancel_roundtrip<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    let (entered_tx, mut entered_rx) = mpsc::channel::<()>(1);
    let (observed_tx, mut observed_rx) = mpsc::channel::<()>(1);
    server.handle("linger", move |ctx: Context, _n: i64| {
        let entered_tx = entered_tx.clone();
        let observed_tx = observed_tx.clone();
        async move {
            entered_tx.send(()).await.ok();
            tokio::select! {
                _ = ctx.cancelled() => {
                    assert!(ctx.is_cancelled());
                    observed_tx.send(()).await.ok();
                    Ok::<(), RpcError>(())
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    Err(RpcError::Remote("handler was not cancelled".into()))
                }
            }
        }
    });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    let cancel = CancellationToken::new();
    let call_task = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.call::<_, ()>(&cancel, "linger", &1i64).await })
    };

    timeout(Duration::from_secs(1), entered_rx.recv())
        .await
        .expect("handler never started")
        .unwrap();
    cancel.cancel();

    let err = timeout(Duration::from_secs(1), call_task)
        .await
        .expect("call did not return after cancel")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::Canceled));

    timeout(Duration::from_secs(1), observed_rx.recv())
        .await
        .expect("server handler never observed cancellation")
        .unwrap();
}

/// The state slot bound via `serve_codec_with_state` is visible to handlers
/// for the peer's lifetime.
pub async fn run_state_slot<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    server.handle("whoami", |ctx: Context, _n: i64| async move {
        let name = ctx
            .peer()
            .state()
            .get::<String>("name")
            .map(|s| (*s).clone())
            .unwrap_or_default();
        Ok::<String, RpcError>(name)
    });

    let (client_codec, server_codec) = F::connect_pair().await;
    let state = Arc::new(State::new());
    state.set("name", "peer-42".to_string());
    tokio::spawn(async move {
        server.serve_codec_with_state(server_codec, state).await;
    });

    let client = Peer::with_codec(client_codec);
    tokio::spawn(client.clone().run());

    let got: String = client
        .call(&CancellationToken::new(), "whoami", &0i64)
        .await
        .expect("whoami failed");
    assert_eq!(got, "peer-42");
}

/// Connect and disconnect events are published around the peer's read loop.
pub async fn run_lifecycle_events<F: CodecFactory>() {
    let server = Arc::new(Server::new());
    let (events_tx, mut events_rx) = mpsc::channel::<&'static str>(4);
    let tx = events_tx.clone();
    server.on_connect(move |_peer| {
        let tx = tx.clone();
        async move {
            tx.send("connect").await.ok();
        }
    });
    let tx = events_tx;
    server.on_disconnect(move |_peer| {
        let tx = tx.clone();
        async move {
            tx.send("disconnect").await.ok();
        }
    });

    let (client, _server_task) = connect::<F>(server).await;
    tokio::spawn(client.clone().run());

    let first = timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("no connect event")
        .unwrap();
    assert_eq!(first, "connect");

    client.close().await.ok();
    let second = timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("no disconnect event")
        .unwrap();
    assert_eq!(second, "disconnect");
}
