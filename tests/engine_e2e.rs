use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use stonelink::{
    rpc_code, Connection, EngineConfig, EngineError, LineCodec, Manager, MuxMode, Packet,
    RpcPacker, LINE_ID,
};

fn server_config(mode: MuxMode) -> EngineConfig {
    EngineConfig {
        name: "server".into(),
        mode,
        address: "127.0.0.1:0".into(),
        ..EngineConfig::default()
    }
}

fn client_config(mode: MuxMode) -> EngineConfig {
    EngineConfig {
        name: "client".into(),
        mode,
        ..EngineConfig::default()
    }
}

async fn start_add_server(mode: MuxMode) -> (Arc<Manager>, String) {
    let server = Manager::new(server_config(mode));
    server.registry().register("add", |args| {
        let a = args.unpack_i64();
        let b = args.unpack_i64();
        let mut result = RpcPacker::new();
        result.pack_int(a + b);
        Ok(result)
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

async fn call_round_trip(mode: MuxMode) {
    let (server, addr) = start_add_server(mode).await;

    let client = Manager::new(client_config(mode));
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let mut args = RpcPacker::new();
    args.pack_int(2).pack_int(40);
    let mut reply = timeout(Duration::from_secs(5), conn.call("add", &args))
        .await
        .expect("call timed out")
        .unwrap();
    assert_eq!(reply.unpack_i64(), 42);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_call_round_trip_readiness() {
    call_round_trip(MuxMode::Epoll).await;
}

#[tokio::test]
async fn test_call_round_trip_sweep() {
    call_round_trip(MuxMode::Select).await;
}

#[tokio::test]
async fn test_call_round_trip_completion() {
    call_round_trip(MuxMode::IoUring).await;
}

#[tokio::test]
async fn test_unknown_function_answers_error_code() {
    let (server, addr) = start_add_server(MuxMode::Epoll).await;
    let client = Manager::new(client_config(MuxMode::Epoll));
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let args = RpcPacker::new();
    let err = timeout(Duration::from_secs(5), conn.call("missing", &args))
        .await
        .expect("call timed out")
        .unwrap_err();
    match err {
        EngineError::Rpc { code, .. } => assert_eq!(code, rpc_code::FUNCTION_NOT_FOUND),
        other => panic!("expected rpc error, got {:?}", other),
    }
    // the connection survives an rpc-level failure
    let mut args = RpcPacker::new();
    args.pack_int(1).pack_int(1);
    let mut reply = conn.call("add", &args).await.unwrap();
    assert_eq!(reply.unpack_i64(), 2);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_notify_reaches_the_server_without_a_response() {
    let server = Manager::new(server_config(MuxMode::Epoll));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.registry().register("note", move |args| {
        let _ = seen_tx.send(args.unpack_str());
        Ok(RpcPacker::new())
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let client = Manager::new(client_config(MuxMode::Epoll));
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let mut args = RpcPacker::new();
    args.pack_str("fire and forget");
    conn.send_call_notify("note", &args).unwrap();

    let seen = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("notify never arrived")
        .unwrap();
    assert_eq!(seen, "fire and forget");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_line_codec_echo() {
    let server = Manager::new(server_config(MuxMode::Epoll));
    server.set_codec(Arc::new(LineCodec));
    server.set_dispatcher(Arc::new(|conn: &Arc<Connection>, packet: Packet| {
        let mut echo = Packet::new(LINE_ID);
        echo.write_bytes(packet.payload()).unwrap();
        echo.seal();
        conn.send(&echo).is_ok()
    }));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let client = Manager::new(client_config(MuxMode::Epoll));
    client.set_codec(Arc::new(LineCodec));
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    client.set_dispatcher(Arc::new(move |_conn: &Arc<Connection>, packet: Packet| {
        let _ = echo_tx.send(packet.payload().to_vec());
        true
    }));
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let mut line = Packet::new(LINE_ID);
    line.write_bytes(b"hello").unwrap();
    line.seal();
    conn.send(&line).unwrap();

    let echoed = timeout(Duration::from_secs(5), echo_rx.recv())
        .await
        .expect("echo never arrived")
        .unwrap();
    assert_eq!(echoed, b"hello");

    let stats = client.stats();
    assert!(stats.sent_bytes >= 6);
    assert!(stats.recv_bytes >= 6);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_call_times_out_against_a_mute_peer() {
    // a listener that accepts and never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            sockets.push(stream);
        }
    });

    let mut config = client_config(MuxMode::Epoll);
    config.call_timeout_ms = 200;
    let client = Manager::new(config);
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let mut args = RpcPacker::new();
    args.pack_int(1);
    let err = conn.call("slow", &args).await.unwrap_err();
    assert!(matches!(err, EngineError::CallTimeout(_)));

    client.stop().await;
    hold.abort();
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending_calls() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let client = Manager::new(client_config(MuxMode::Epoll));
    client.start().await.unwrap();
    let conn = client.connect(&addr).await.unwrap();

    let (stream, _) = listener.accept().await.unwrap();

    let args = RpcPacker::new();
    let rx = conn.send_call("never", &args).unwrap();
    // give the request time to flush, then slam the door
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);
    drop(listener);

    let result = timeout(Duration::from_secs(5), rx)
        .await
        .expect("pending call never resolved");
    match result {
        Ok(Err(EngineError::ConnectionClosed(_))) => {}
        Err(_) => {} // sender dropped with the connection, same outcome
        other => panic!("expected a closed-connection failure, got {:?}", other),
    }

    client.stop().await;
}

#[tokio::test]
async fn test_completion_serves_calls_past_idle_connections() {
    let (server, addr) = start_add_server(MuxMode::IoUring).await;
    let client = Manager::new(client_config(MuxMode::IoUring));
    client.start().await.unwrap();

    // idle peers waiting on receive must not starve later traffic
    let mut idle = Vec::new();
    for _ in 0..4 {
        idle.push(client.connect(&addr).await.unwrap());
    }
    let conn = client.connect(&addr).await.unwrap();

    let mut args = RpcPacker::new();
    args.pack_int(2).pack_int(40);
    let mut reply = timeout(Duration::from_secs(5), conn.call("add", &args))
        .await
        .expect("call starved behind idle connections")
        .unwrap();
    assert_eq!(reply.unpack_i64(), 42);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_completion_stop_returns_with_idle_connections() {
    let (server, addr) = start_add_server(MuxMode::IoUring).await;
    let client = Manager::new(client_config(MuxMode::IoUring));
    client.start().await.unwrap();
    // a connection that never sends keeps a receive operation parked
    let _conn = client.connect(&addr).await.unwrap();

    timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("client stop hung on a parked receive");
    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("server stop hung on a parked receive");
}

#[tokio::test]
async fn test_racing_name_claims_leave_one_winner() {
    let (server, addr) = start_add_server(MuxMode::Epoll).await;
    let client = Manager::new(client_config(MuxMode::Epoll));
    client.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(client.connect(&addr).await.unwrap().id());
    }

    let mut claims = Vec::new();
    for id in ids.clone() {
        let client = client.clone();
        claims.push(tokio::spawn(async move {
            client.set_name(id, "shared").is_ok()
        }));
    }
    let mut wins = 0;
    for claim in claims {
        if claim.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    let winner = client.find_by_name("shared").unwrap().id();

    // removing every loser must not disturb the winner's index entry
    for id in ids {
        if id != winner {
            client.remove(id);
        }
    }
    assert_eq!(client.find_by_name("shared").unwrap().id(), winner);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_named_connections() {
    let (server, addr) = start_add_server(MuxMode::Epoll).await;
    let client = Manager::new(client_config(MuxMode::Epoll));
    client.start().await.unwrap();

    let first = client.connect(&addr).await.unwrap();
    let second = client.connect(&addr).await.unwrap();

    client.set_name(first.id(), "primary").unwrap();
    assert_eq!(
        client.find_by_name("primary").unwrap().id(),
        first.id()
    );
    // a taken name is refused
    assert!(client.set_name(second.id(), "primary").is_err());
    // rename moves the index entry
    client.set_name(first.id(), "main").unwrap();
    assert!(client.find_by_name("primary").is_none());
    assert_eq!(client.find_by_name("main").unwrap().id(), first.id());

    // removal clears the index
    client.remove(first.id());
    assert!(client.find_by_name("main").is_none());

    client.stop().await;
    server.stop().await;
}
