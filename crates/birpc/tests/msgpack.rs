//! End-to-end scenarios over the MessagePack codec.

use birpc::MsgPackCodec;
use birpc_testkit::CodecFactory;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

struct MsgPackFactory;

impl CodecFactory for MsgPackFactory {
    type Codec = MsgPackCodec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn connect_pair() -> (Self::Codec, Self::Codec) {
        MsgPackCodec::pair()
    }
}

#[tokio::test]
async fn call_with_nested_callback() {
    birpc_testkit::run_call_with_nested_callback::<MsgPackFactory>().await;
}

#[tokio::test]
async fn notification() {
    birpc_testkit::run_notification::<MsgPackFactory>().await;
}

#[tokio::test]
async fn unknown_method() {
    birpc_testkit::run_unknown_method::<MsgPackFactory>().await;
}

#[tokio::test]
async fn blocking_mode() {
    birpc_testkit::run_blocking_mode::<MsgPackFactory>().await;
}

#[tokio::test]
async fn go_with_default_channel() {
    birpc_testkit::run_go_with_default_channel::<MsgPackFactory>().await;
}

#[tokio::test]
async fn concurrent_correlation() {
    birpc_testkit::run_concurrent_correlation::<MsgPackFactory>().await;
}

#[tokio::test]
async fn shutdown_drain() {
    birpc_testkit::run_shutdown_drain::<MsgPackFactory>().await;
}

#[tokio::test]
async fn cancel_roundtrip() {
    birpc_testkit::run_cancel_roundtrip::<MsgPackFactory>().await;
}

#[tokio::test]
async fn state_slot() {
    birpc_testkit::run_state_slot::<MsgPackFactory>().await;
}

#[tokio::test]
async fn lifecycle_events() {
    birpc_testkit::run_lifecycle_events::<MsgPackFactory>().await;
}
