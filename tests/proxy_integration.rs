use std::time::Duration;

use relaymesh::{cluster_srv, cluster_to, srv, to, ConnOptions, DiscOptions, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Binds an ephemeral port, returning its address as a string and releasing
/// the listener immediately so the proxy under test can rebind it.
async fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Spawns a TCP server on `addr` that replies "pong" to any input, and keeps
/// running until the returned task is dropped/aborted.
fn spawn_ping_pong_server(addr: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = TcpListener::bind(&addr).await.unwrap();
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) if &buf[..n] == b"ping" => {
                            if sock.write_all(b"pong").await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => break,
                    }
                }
            });
        }
    })
}

/// Spawns a TCP server on an ephemeral port that ignores the bytes it
/// receives and always replies with `marker`, so a test can tell which
/// upstream handled a connection. Returns the bound address.
async fn spawn_marker_server(marker: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if sock.read(&mut buf).await.unwrap_or(0) > 0 {
                    let _ = sock.write_all(marker.as_bytes()).await;
                }
            });
        }
    });
    addr
}

/// A minimal long-poll discovery registry stub: serves one canned
/// `{"index":_,"nodes":[...]}` body per accepted connection, drawn in order
/// from `bodies` and repeating the last one once exhausted. Every connection
/// after the first is answered only after a short delay, so a test has a
/// predictable window to observe the initial snapshot before a later one
/// lands, and so a watch loop polling it doesn't spin unbounded. Good enough
/// to drive `discovery::obtain`/`discovery::watch` end to end without caring
/// what request path/query they actually send.
async fn spawn_discovery_stub(bodies: Vec<(u64, Vec<String>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut next = 0usize;
        let mut conn_count = 0u32;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            conn_count += 1;
            if conn_count > 1 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }

            let (index, nodes) = if next < bodies.len() {
                let body = bodies[next].clone();
                next += 1;
                body
            } else {
                bodies.last().cloned().expect("bodies must not be empty")
            };

            let mut discard = [0u8; 1024];
            let _ = sock.read(&mut discard).await;

            let nodes_json = nodes
                .iter()
                .map(|n| format!("\"{n}\""))
                .collect::<Vec<_>>()
                .join(",");
            let body = format!("{{\"index\":{index},\"nodes\":[{nodes_json}]}}");
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    addr
}

#[tokio::test]
async fn static_forward_single_upstream() {
    let upstream_addr = free_addr().await;
    let _upstream = spawn_ping_pong_server(upstream_addr.clone());

    let listen_addr = free_addr().await;
    let root = CancellationToken::new();

    let opts = ConnOptions {
        transport: Transport::Tcp,
        from: Some(listen_addr.clone()),
        to: vec![upstream_addr],
        read_timeout_secs: Some(5),
        write_timeout_secs: Some(5),
        ..Default::default()
    };

    let proxy_root = root.clone();
    let handle = tokio::spawn(async move { to(proxy_root, opts).await });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(&listen_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"pong");

    root.cancel();
    let result = timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();
    assert!(result.is_end_of_proxy());
}

#[tokio::test]
async fn empty_upstream_refuses_without_dial() {
    let listen_addr = free_addr().await;
    let root = CancellationToken::new();

    let opts = ConnOptions {
        transport: Transport::Tcp,
        from: Some(listen_addr.clone()),
        to: vec![],
        ..Default::default()
    };

    let proxy_root = root.clone();
    let handle = tokio::spawn(async move { to(proxy_root, opts).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(&listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "client must observe immediate close, no dial attempt");

    root.cancel();
    let result = timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();
    assert!(result.is_end_of_proxy());
}

#[tokio::test]
async fn cluster_pairing_skips_excess_listeners() {
    let upstream1 = free_addr().await;
    let upstream2 = free_addr().await;
    let _u1 = spawn_ping_pong_server(upstream1.clone());
    let _u2 = spawn_ping_pong_server(upstream2.clone());

    let listen1 = free_addr().await;
    let listen2 = free_addr().await;
    let listen3 = free_addr().await; // has no matching upstream, must be skipped

    let root = CancellationToken::new();
    let opts = ConnOptions {
        transport: Transport::Tcp,
        from_range: vec![listen1.clone(), listen2.clone(), listen3.clone()],
        to: vec![upstream1, upstream2],
        read_timeout_secs: Some(5),
        write_timeout_secs: Some(5),
        ..Default::default()
    };

    let cluster_root = root.clone();
    let handle = tokio::spawn(async move { cluster_to(cluster_root, opts).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    for listen in [&listen1, &listen2] {
        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    assert!(
        TcpStream::connect(&listen3).await.is_err(),
        "listen3 has no paired upstream and must not be bound"
    );

    root.cancel();
    let result = timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();
    assert!(result.is_end_of_proxy());
}

#[tokio::test]
async fn discovery_forward_single_listener() {
    let upstream_addr = free_addr().await;
    let _upstream = spawn_ping_pong_server(upstream_addr.clone());

    let stub_addr = spawn_discovery_stub(vec![(1, vec![upstream_addr])]).await;
    let listen_addr = free_addr().await;
    let root = CancellationToken::new();

    let opts = ConnOptions {
        transport: Transport::Tcp,
        from: Some(listen_addr.clone()),
        discovery: Some(DiscOptions {
            service: "test".into(),
            endpoints: vec![format!("http://{stub_addr}")],
            after_index: 0,
        }),
        read_timeout_secs: Some(5),
        write_timeout_secs: Some(5),
        ..Default::default()
    };

    let proxy_root = root.clone();
    let handle = tokio::spawn(async move { srv(proxy_root, opts).await });

    // Give the listener time to bind and the initial `obtain()` to resolve.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(&listen_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"pong");

    root.cancel();
    let result = timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();
    assert!(result.is_end_of_proxy());
}

#[tokio::test]
async fn cluster_srv_recycles_cohort_on_membership_change() {
    let addr_a1 = spawn_marker_server("A1").await;
    let addr_a2 = spawn_marker_server("A2").await;
    let addr_b1 = spawn_marker_server("B1").await;
    let addr_b2 = spawn_marker_server("B2").await;

    // First poll (the initial `obtain()`) hands back the A pair; the next
    // poll (the background watch loop's first request) hands back the B
    // pair, simulating a membership change shortly after startup.
    let stub_addr = spawn_discovery_stub(vec![
        (1, vec![addr_a1, addr_a2]),
        (2, vec![addr_b1, addr_b2]),
    ])
    .await;

    let listen1 = free_addr().await;
    let listen2 = free_addr().await;
    let root = CancellationToken::new();

    let opts = ConnOptions {
        transport: Transport::Tcp,
        from_range: vec![listen1.clone(), listen2.clone()],
        discovery: Some(DiscOptions {
            service: "test".into(),
            endpoints: vec![format!("http://{stub_addr}")],
            after_index: 0,
        }),
        read_timeout_secs: Some(5),
        write_timeout_secs: Some(5),
        ..Default::default()
    };

    let cluster_root = root.clone();
    let handle = tokio::spawn(async move { cluster_srv(cluster_root, opts).await });

    // Give the initial cohort time to spawn off the first discovery snapshot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (listen, marker) in [(&listen1, "A1"), (&listen2, "A2")] {
        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], marker.as_bytes());
    }

    // Give the watch loop's next poll time to land and the epoch to recycle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for (listen, marker) in [(&listen1, "B1"), (&listen2, "B2")] {
        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], marker.as_bytes());
    }

    root.cancel();
    let result = timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();
    assert!(result.is_end_of_proxy());
}
