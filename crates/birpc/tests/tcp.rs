//! The accept-loop path over a real TCP listener, mirroring how a deployed
//! server and client pair up: one engine per accepted connection, all sharing
//! the server's registry.

use std::sync::Arc;
use std::time::Duration;

use birpc::{CancellationToken, Context, Peer, RpcError, Server};
use birpc_testkit::{Args, Reply};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn tcp_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(Server::new());
    server.handle("add", |ctx: Context, args: Args| async move {
        let nested: Reply = ctx
            .peer()
            .call(ctx.cancellation(), "mult", &Args { a: 2, b: 3 })
            .await?;
        assert_eq!(nested.0, 6);
        Ok::<Reply, RpcError>(Reply(args.a + args.b))
    });
    let (number_tx, mut number_rx) = mpsc::channel::<i64>(1);
    server.handle("set", move |_ctx: Context, i: i64| {
        let number_tx = number_tx.clone();
        async move {
            number_tx.send(i).await.ok();
            Ok::<(), RpcError>(())
        }
    });
    tokio::spawn(server.clone().accept(listener));

    let conn = TcpStream::connect(addr).await.unwrap();
    let client = Peer::new(conn);
    client.handle("mult", |_ctx: Context, args: Args| async move {
        Ok::<Reply, RpcError>(Reply(args.a * args.b))
    });
    tokio::spawn(client.clone().run());

    // Call with a nested callback into this client.
    let reply: Reply = timeout(
        Duration::from_secs(5),
        client.call(&CancellationToken::new(), "add", &Args { a: 1, b: 2 }),
    )
    .await
    .expect("call timed out")
    .expect("add failed");
    assert_eq!(reply.0, 3);

    // Notification.
    client.notify("set", &6i64).await.expect("notify failed");
    let got = timeout(Duration::from_secs(1), number_rx.recv())
        .await
        .expect("did not get notification")
        .unwrap();
    assert_eq!(got, 6);

    // Blocked request handling.
    client.set_blocking(true);
    let reply: Reply = timeout(
        Duration::from_secs(5),
        client.call(&CancellationToken::new(), "add", &Args { a: 1, b: 2 }),
    )
    .await
    .expect("call timed out")
    .expect("add failed");
    assert_eq!(reply.0, 3);

    // Undefined method.
    let err = client
        .call::<_, Reply>(&CancellationToken::new(), "foo", &1i64)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "birpc: can't find method foo");

    client.close().await.expect("close failed");
}

#[tokio::test]
async fn tcp_serves_multiple_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(Server::new());
    server.handle("echo", |_ctx: Context, n: i64| async move { Ok::<i64, RpcError>(n) });
    tokio::spawn(server.clone().accept(listener));

    for n in 0..3i64 {
        let conn = TcpStream::connect(addr).await.unwrap();
        let client = Peer::new(conn);
        tokio::spawn(client.clone().run());

        let got: i64 = timeout(
            Duration::from_secs(5),
            client.call(&CancellationToken::new(), "echo", &n),
        )
        .await
        .expect("call timed out")
        .expect("echo failed");
        assert_eq!(got, n);

        client.close().await.ok();
    }
}
