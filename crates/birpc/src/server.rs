//! Server: pairs a listener with the peer engine.
//!
//! A server owns a handler registry and a lifecycle hub. Each accepted
//! connection gets its own peer engine sharing the server's registry, so
//! registration happens once and serves every connection. Sharing is
//! read-only after the first dispatch.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::codec::{Codec, MsgPackCodec};
use crate::hub::{EventKind, Hub};
use crate::peer::{Context, Peer};
use crate::registry::Registry;
use crate::state::State;

/// Responds to RPC requests made by remote peers, and can call back into
/// them through the peer handed to `on_connect` subscribers and handlers.
#[derive(Default)]
pub struct Server {
    registry: Arc<Registry>,
    hub: Hub,
}

impl Server {
    pub fn new() -> Server {
        Server::default()
    }

    /// Register a handler served on every connection.
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

    /// Subscribe to connection events. Each invocation runs in its own task,
    /// before the connection's read loop starts.
    pub fn on_connect<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Peer>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hub.subscribe(EventKind::Connected, f);
    }

    /// Subscribe to disconnection events, published after a connection's read
    /// loop exits.
    pub fn on_disconnect<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Peer>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hub.subscribe(EventKind::Disconnected, f);
    }

    /// Accept connections and serve each in its own task. Blocks until the
    /// listener fails; the usual shape is `tokio::spawn(server.accept(lis))`.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, addr)) => {
                    tracing::debug!(%addr, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(conn).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Serve a single connection with the default MessagePack codec. Blocks
    /// until the remote hangs up.
    pub async fn serve_conn<S>(&self, conn: S)
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        self.serve_codec(MsgPackCodec::new(conn)).await;
    }

    /// Serve a single connection over an explicit codec.
    pub async fn serve_codec<C: Codec>(&self, codec: C) {
        self.serve_codec_with_state(codec, Arc::new(State::new()))
            .await;
    }

    /// Like `serve_codec`, but binds `state` to the connection's peer so it
    /// persists across calls on that connection.
    pub async fn serve_codec_with_state<C: Codec>(&self, codec: C, state: Arc<State>) {
        let peer = Peer::serve(codec, self.registry.clone(), state);
        self.hub.publish(EventKind::Connected, &peer);
        peer.clone().run().await;
        self.hub.publish(EventKind::Disconnected, &peer);
    }
}
