//! Outbound call bookkeeping.
//!
//! A [`Call`] is one outbound request awaiting its response. The engine keeps
//! a shared reference in the outbound pending table, keyed by sequence number,
//! until the call reaches a terminal state: response arrival, send failure,
//! cancellation, or engine shutdown. Completion strobes the call's done
//! channel exactly once with the call itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::frame::Body;

/// Completion channel for [`Call`]s. Strobes are delivered with `try_send`;
/// the channel must have room for every call that may complete on it, or
/// strobes are dropped.
pub type DoneSender = mpsc::Sender<Arc<Call>>;

/// Sequence number a cancelled-before-send call is stamped with, so a racing
/// send refuses to transmit it.
const SEQ_CANCELLED: u64 = 1;

/// An in-flight outbound request.
pub struct Call {
    method: String,
    seq: AtomicU64,
    result: OnceLock<Result<Body, RpcError>>,
    done: DoneSender,
    /// Receiving side of the done channel, present only when the engine
    /// allocated the channel itself. Consumed by [`Call::wait`].
    done_rx: Mutex<Option<mpsc::Receiver<Arc<Call>>>>,
}

impl Call {
    /// Create a call. When `done` is absent a channel with capacity 10 is
    /// allocated and its receiver parked on the call for [`Call::wait`].
    pub(crate) fn new(method: &str, done: Option<DoneSender>) -> Call {
        let (done, done_rx) = match done {
            Some(done) => (done, None),
            None => {
                let (tx, rx) = mpsc::channel(10);
                (tx, Some(rx))
            }
        };
        Call {
            method: method.to_string(),
            seq: AtomicU64::new(0),
            result: OnceLock::new(),
            done,
            done_rx: Mutex::new(done_rx),
        }
    }

    /// The method this call invokes.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Sequence number used to send; zero until the request was transmitted.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Terminal result, once the call has been strobed.
    pub fn result(&self) -> Option<&Result<Body, RpcError>> {
        self.result.get()
    }

    /// Decode the reply into a concrete type. `None` until the call is done.
    pub fn reply<R: DeserializeOwned>(&self) -> Option<Result<R, RpcError>> {
        let result = self.result.get()?;
        Some(match result {
            Ok(body) => body
                .decode()
                .map_err(|e| RpcError::BodyRead(Arc::new(e))),
            Err(e) => Err(e.clone()),
        })
    }

    /// Wait for the call to complete and decode its reply.
    ///
    /// Available when the engine allocated the done channel (`go` with
    /// `done: None`); with a caller-supplied channel the caller holds the
    /// receiving side and awaits the strobe there instead.
    ///
    /// # Panics
    ///
    /// Panics on an incomplete call without a receiver to wait on: a
    /// caller-supplied done channel, or a second concurrent `wait`. Both are
    /// programming errors.
    pub async fn wait<R: DeserializeOwned>(&self) -> Result<R, RpcError> {
        if self.result.get().is_none() {
            let rx = self.done_rx.lock().take();
            match rx {
                Some(mut rx) => {
                    // The call itself holds the sending side, so the strobe
                    // is the only message this can yield.
                    let _ = rx.recv().await;
                }
                None => panic!("birpc: wait on a call without a done receiver"),
            }
        }
        self.reply().expect("completed call carries a result")
    }

    /// Complete the call. The first caller wins; later completions are no-ops,
    /// so removal from the pending table is terminal.
    pub(crate) fn complete(self: &Arc<Self>, result: Result<Body, RpcError>) {
        if self.result.set(result).is_err() {
            return;
        }
        if let Err(e) = self.done.try_send(self.clone()) {
            tracing::debug!(
                method = %self.method,
                error = %e,
                "discarding call strobe: done channel has no capacity"
            );
        }
    }

    pub(crate) fn mark_cancelled_before_send(&self) {
        let _ = self
            .seq
            .compare_exchange(0, SEQ_CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }

    fn assign_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }
}

/// The outbound pending table plus the engine's lifecycle flags, guarded by
/// one lock since the send path checks both together.
pub(crate) struct Outbound {
    next_seq: u64,
    pending: HashMap<u64, Arc<Call>>,
    pub(crate) shutdown: bool,
    pub(crate) closing: bool,
}

impl Outbound {
    pub(crate) fn new() -> Outbound {
        Outbound {
            // 0 is reserved for notifications.
            next_seq: 1,
            pending: HashMap::new(),
            shutdown: false,
            closing: false,
        }
    }

    /// Assign the next sequence number and insert the call. Sequence numbers
    /// are never reused within one peer lifetime.
    pub(crate) fn register(&mut self, call: &Arc<Call>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        call.assign_seq(seq);
        self.pending.insert(seq, call.clone());
        seq
    }

    pub(crate) fn remove(&mut self, seq: u64) -> Option<Arc<Call>> {
        self.pending.remove(&seq)
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Call>> {
        self.pending.drain().map(|(_, call)| call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WireFormat;

    #[tokio::test]
    async fn complete_strobes_exactly_once() {
        let (tx, mut rx) = mpsc::channel(10);
        let call = Arc::new(Call::new("echo", Some(tx)));

        call.complete(Ok(Body::unit(WireFormat::MsgPack)));
        call.complete(Err(RpcError::Shutdown));

        let strobed = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&strobed, &call));
        assert!(matches!(call.result(), Some(Ok(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_done_channel_drops_the_strobe() {
        let (tx, mut rx) = mpsc::channel(1);
        let filler = Arc::new(Call::new("filler", Some(tx.clone())));
        filler.complete(Err(RpcError::Shutdown));

        let call = Arc::new(Call::new("echo", Some(tx)));
        call.complete(Err(RpcError::Shutdown));

        // Only the filler made it; the second strobe was discarded, but the
        // call still carries its result.
        let first = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&first, &filler));
        assert!(rx.try_recv().is_err());
        assert!(call.result().is_some());
    }

    #[tokio::test]
    async fn wait_on_default_channel_decodes_the_reply() {
        let call = Arc::new(Call::new("echo", None));
        let completer = call.clone();
        tokio::spawn(async move {
            completer.complete(Ok(Body::encode(WireFormat::MsgPack, &7i64).unwrap()));
        });

        let got: i64 = call.wait().await.unwrap();
        assert_eq!(got, 7);
        assert!(matches!(call.reply::<i64>(), Some(Ok(7))));
    }

    #[test]
    fn cancelled_before_send_stamps_seq() {
        let call = Call::new("echo", None);
        assert_eq!(call.seq(), 0);
        call.mark_cancelled_before_send();
        assert_eq!(call.seq(), SEQ_CANCELLED);
    }

    #[test]
    fn sequences_are_strictly_monotonic() {
        let mut outbound = Outbound::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut last = 0;
        for _ in 0..5 {
            let call = Arc::new(Call::new("echo", Some(tx.clone())));
            let seq = outbound.register(&call);
            assert!(seq > last);
            assert_eq!(call.seq(), seq);
            last = seq;
        }
        assert!(outbound.remove(2).is_some());
        assert!(outbound.remove(2).is_none());
    }
}
