//! End-to-end scenarios over the JSON codec, including the argument shapes
//! only JSON supports: positional arrays, raw pre-encoded params, and null
//! params decoded as a single nil argument.

use std::sync::Arc;

use birpc::{CancellationToken, Context, JsonCodec, RpcError, Server};
use birpc_testkit::CodecFactory;
use serde_json::value::RawValue;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

struct JsonFactory;

impl CodecFactory for JsonFactory {
    type Codec = JsonCodec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn connect_pair() -> (Self::Codec, Self::Codec) {
        JsonCodec::pair()
    }
}

#[tokio::test]
async fn call_with_nested_callback() {
    birpc_testkit::run_call_with_nested_callback::<JsonFactory>().await;
}

#[tokio::test]
async fn notification() {
    birpc_testkit::run_notification::<JsonFactory>().await;
}

#[tokio::test]
async fn unknown_method() {
    birpc_testkit::run_unknown_method::<JsonFactory>().await;
}

#[tokio::test]
async fn blocking_mode() {
    birpc_testkit::run_blocking_mode::<JsonFactory>().await;
}

#[tokio::test]
async fn go_with_default_channel() {
    birpc_testkit::run_go_with_default_channel::<JsonFactory>().await;
}

#[tokio::test]
async fn concurrent_correlation() {
    birpc_testkit::run_concurrent_correlation::<JsonFactory>().await;
}

#[tokio::test]
async fn shutdown_drain() {
    birpc_testkit::run_shutdown_drain::<JsonFactory>().await;
}

#[tokio::test]
async fn cancel_roundtrip() {
    birpc_testkit::run_cancel_roundtrip::<JsonFactory>().await;
}

#[tokio::test]
async fn state_slot() {
    birpc_testkit::run_state_slot::<JsonFactory>().await;
}

#[tokio::test]
async fn lifecycle_events() {
    birpc_testkit::run_lifecycle_events::<JsonFactory>().await;
}

#[tokio::test]
async fn positional_args() {
    let server = Arc::new(Server::new());
    server.handle(
        "addPos",
        |_ctx: Context, args: Vec<serde_json::Value>| async move {
            let sum = args.iter().filter_map(|v| v.as_f64()).sum::<f64>();
            Ok::<f64, RpcError>(sum)
        },
    );

    let (client, _server_task) = birpc_testkit::connect::<JsonFactory>(server).await;
    tokio::spawn(client.clone().run());

    let result: f64 = client
        .call(&CancellationToken::new(), "addPos", &serde_json::json!([1, 2]))
        .await
        .expect("addPos failed");
    assert_eq!(result, 3.0);
}

#[tokio::test]
async fn raw_args_pass_through_for_lazy_decoding() {
    let server = Arc::new(Server::new());
    server.handle(
        "rawArgs",
        |_ctx: Context, args: Vec<Box<RawValue>>| async move {
            let mut reply = Vec::new();
            for raw in &args {
                let s: String = serde_json::from_str(raw.get())
                    .map_err(|e| RpcError::Remote(e.to_string()))?;
                reply.push(s);
            }
            Ok::<Vec<String>, RpcError>(reply)
        },
    );

    let (client, _server_task) = birpc_testkit::connect::<JsonFactory>(server).await;
    tokio::spawn(client.clone().run());

    // Pre-encoded params go over the wire verbatim.
    let raw: Box<RawValue> = serde_json::from_str(r#"["arg1", "arg2"]"#).unwrap();
    let reply: Vec<String> = client
        .call(&CancellationToken::new(), "rawArgs", &raw)
        .await
        .expect("rawArgs failed");
    assert_eq!(reply, ["arg1", "arg2"]);
}

#[tokio::test]
async fn typed_args() {
    let server = Arc::new(Server::new());
    server.handle("typedArgs", |_ctx: Context, args: Vec<i64>| async move {
        Ok::<Vec<String>, RpcError>(args.iter().map(|n| n.to_string()).collect())
    });

    let (client, _server_task) = birpc_testkit::connect::<JsonFactory>(server).await;
    tokio::spawn(client.clone().run());

    let reply: Vec<String> = client
        .call(&CancellationToken::new(), "typedArgs", &vec![1i64, 2])
        .await
        .expect("typedArgs failed");
    assert_eq!(reply, ["1", "2"]);
}

#[tokio::test]
async fn nil_args_decode_as_single_nil_element() {
    let server = Arc::new(Server::new());
    server.handle(
        "nilArgs",
        |_ctx: Context, args: Vec<serde_json::Value>| async move {
            let mut reply = Vec::new();
            for v in &args {
                if v.is_null() {
                    reply.push("nil".to_string());
                }
            }
            Ok::<Vec<String>, RpcError>(reply)
        },
    );

    let (client, _server_task) = birpc_testkit::connect::<JsonFactory>(server).await;
    tokio::spawn(client.clone().run());

    let reply: Vec<String> = client
        .call(&CancellationToken::new(), "nilArgs", &serde_json::Value::Null)
        .await
        .expect("nilArgs failed");
    assert_eq!(reply, ["nil"]);
}
