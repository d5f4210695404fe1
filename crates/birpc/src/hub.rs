//! Connection lifecycle event bus.
//!
//! The server publishes a connected event before a peer's read loop starts and
//! a disconnected event after it exits. Every subscriber runs in its own task,
//! so a slow subscriber cannot wedge the accept loop.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EventKind {
    Connected,
    Disconnected,
}

type Subscriber = Arc<dyn Fn(Arc<Peer>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hub {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
}

impl Hub {
    pub(crate) fn subscribe<F, Fut>(&self, kind: EventKind, f: F)
    where
        F: Fn(Arc<Peer>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let subscriber: Subscriber = Arc::new(move |peer| Box::pin(f(peer)));
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    pub(crate) fn publish(&self, kind: EventKind, peer: &Arc<Peer>) {
        let subscribers = match self.subscribers.lock().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for subscriber in subscribers {
            tokio::spawn(subscriber(peer.clone()));
        }
    }
}
