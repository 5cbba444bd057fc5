//! End-to-end tests over real TCP sockets and in-memory duplex streams.

use std::net::SocketAddr;
use std::time::Duration;

use seamrpc::{Client, CodecKind, Handshake, Header, RpcError, Server, ServiceRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Route crate logs through the test harness so failures come with context.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn demo_registry() -> ServiceRegistry {
    init_tracing();
    let mut registry = ServiceRegistry::new();
    registry.register("Foo.Sum", |args: String| async move {
        let n = args.strip_prefix("req:").unwrap_or(&args).to_string();
        Ok(format!("resp:{n}"))
    });
    registry.register("Foo.Reverse", |args: String| async move {
        Ok(args.chars().rev().collect::<String>())
    });
    registry.register("Foo.Sleep", |ms: u64| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    });
    registry.register("Foo.Fail", |_args: String| async move {
        Err::<String, _>(RpcError::Application("boom".into()))
    });
    registry
}

async fn spawn_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(demo_registry());
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

#[tokio::test]
async fn test_end_to_end_sum() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    let call = client.send_call("Foo.Sum", "req:0").await.unwrap();
    assert_eq!(call.seq(), 0);
    let reply: String = call.wait().await.unwrap();
    assert_eq!(reply, "resp:0");
}

#[tokio::test]
async fn test_many_concurrent_calls() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let msg = format!("msg{i}");
            let reply: String = client.call("Foo.Reverse", &msg).await.unwrap();
            assert_eq!(reply, msg.chars().rev().collect::<String>());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_long_lived_connection_sequential_requests() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    // One connection, many requests back to back. Each finished handler is
    // reaped before the next request is read, so the connection serves an
    // unbounded request count without retaining per-request state.
    for i in 0..200u32 {
        let reply: String = client.call("Foo.Sum", &format!("req:{i}")).await.unwrap();
        assert_eq!(reply, format!("resp:{i}"));
    }

    // Still responsive once the batch is over.
    let reply: String = client.call("Foo.Reverse", "abc").await.unwrap();
    assert_eq!(reply, "cba");
}

#[tokio::test]
async fn test_out_of_order_completion() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    // The slowest handler is issued first; each reply must still land in the
    // call with the matching sequence number.
    let slow = client.send_call("Foo.Sleep", &120u64).await.unwrap();
    let mid = client.send_call("Foo.Sleep", &60u64).await.unwrap();
    let fast = client.send_call("Foo.Sleep", &10u64).await.unwrap();

    assert_eq!(fast.wait::<u64>().await.unwrap(), 10);
    assert_eq!(mid.wait::<u64>().await.unwrap(), 60);
    assert_eq!(slow.wait::<u64>().await.unwrap(), 120);
}

#[tokio::test]
async fn test_remote_handler_error() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    let err = client
        .call::<str, String>("Foo.Fail", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Application(msg) if msg.contains("boom")));

    // An application error leaves the connection usable.
    let reply: String = client.call("Foo.Sum", "req:1").await.unwrap();
    assert_eq!(reply, "resp:1");
}

#[tokio::test]
async fn test_unknown_method() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    let err = client
        .call::<str, String>("Nope.Nothing", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Application(msg) if msg.contains("method not found")));
}

#[tokio::test]
async fn test_argument_decode_failure_keeps_connection() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    // Foo.Sum expects a string argument; send an integer instead.
    let err = client.call::<u32, String>("Foo.Sum", &7).await.unwrap_err();
    assert!(matches!(&err, RpcError::Application(msg) if msg.contains("decode")));

    let reply: String = client.call("Foo.Sum", "req:2").await.unwrap();
    assert_eq!(reply, "resp:2");
}

/// Write a raw handshake line and count the bytes the server sends back.
async fn bytes_after_handshake(addr: SocketAddr, line: &[u8]) -> usize {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(line).await.unwrap();

    let mut total = 0;
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
    total
}

#[tokio::test]
async fn test_bad_magic_closes_without_frames() {
    let addr = spawn_tcp_server().await;
    let received = bytes_after_handshake(
        addr,
        b"{\"MagicNumber\":1,\"CodecType\":\"application/msgpack\"}\n",
    )
    .await;
    assert_eq!(received, 0);
}

#[tokio::test]
async fn test_unknown_codec_tag_closes_without_frames() {
    let addr = spawn_tcp_server().await;
    let received = bytes_after_handshake(
        addr,
        b"{\"MagicNumber\":3927900,\"CodecType\":\"encoding/gob\"}\n",
    )
    .await;
    assert_eq!(received, 0);
}

#[tokio::test]
async fn test_json_codec_end_to_end() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect_with(addr, CodecKind::Json).await.unwrap();

    let reply: String = client.call("Foo.Sum", "req:9").await.unwrap();
    assert_eq!(reply, "resp:9");
}

#[tokio::test]
async fn test_call_timeout_leaves_connection_usable() {
    let addr = spawn_tcp_server().await;
    let client = Client::connect(addr).await.unwrap();

    let err = client
        .call_with_timeout::<u64, u64>("Foo.Sleep", &500, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    let reply: String = client.call("Foo.Sum", "req:3").await.unwrap();
    assert_eq!(reply, "resp:3");
}

#[tokio::test]
async fn test_duplex_connection() {
    let server = Server::new(demo_registry());
    let (local, remote) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move { server.serve_connection(remote).await });

    let client = Client::handshake(local, CodecKind::MessagePack).await.unwrap();
    let reply: String = client.call("Foo.Sum", "req:4").await.unwrap();
    assert_eq!(reply, "resp:4");
}

#[tokio::test]
async fn test_concurrent_handlers_write_whole_frames() {
    let server = Server::new(demo_registry());
    let (local, remote) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move { server.serve_connection(remote).await });

    // Drive the wire by hand so every response frame is inspected exactly as
    // it appears on the stream.
    let kind = CodecKind::MessagePack;
    let mut stream = local;
    Handshake::new(kind).write_to(&mut stream).await.unwrap();
    let (mut reader, mut writer) = kind.split(stream);

    // Handlers finish in reverse request order.
    for (seq, ms) in [(0u64, 120u64), (1, 60), (2, 10)] {
        writer
            .write(&Header::request("Foo.Sleep", seq), &ms)
            .await
            .unwrap();
    }

    let mut got = Vec::new();
    for _ in 0..3 {
        let header = reader.read_header().await.unwrap();
        assert!(!header.is_error());
        let ms: u64 = reader.read_body().await.unwrap();
        assert_eq!(header.service_method, "Foo.Sleep");
        got.push((header.seq, ms));
    }

    // Completion order, not request order, and every frame is well-formed.
    assert_eq!(got, vec![(2, 10), (1, 60), (0, 120)]);
}

#[tokio::test]
async fn test_server_drops_mid_call_terminates_pending() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A "server" that completes the handshake and then hangs up.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let _ = stream.try_read(&mut buf);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);
    });

    let client = Client::connect(addr).await.unwrap();
    let call = client.send_call("Foo.Sum", "req:0").await.unwrap();

    let err = call.wait::<String>().await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected(_)));
    assert!(!client.is_available());
}
