#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod call;
mod codec;
mod error;
mod frame;
mod hub;
mod peer;
mod registry;
mod server;
mod state;

pub use call::{Call, DoneSender};
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use error::{CodecError, RpcError};
pub use frame::{Body, Request, Response, WireFormat};
pub use peer::{CancelArgs, Context, Peer, CANCEL_METHOD};
pub use registry::Registry;
pub use server::Server;
pub use state::State;

// Re-export so callers don't need a direct tokio-util dependency for `call`.
pub use tokio_util::sync::CancellationToken;
