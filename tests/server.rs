use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use turbosocks::{ConfigOptions, Server, ServerError, Status, TcpServer};

/// Upper bound for stop/run to settle: one accept deadline plus slack
const ACCEPT_GRACE: Duration = Duration::from_secs(2);

/// free_port finds a loopback port that is not currently bound
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server(max_connections: i64) -> Arc<TcpServer> {
    let config = ConfigOptions {
        host: Some("127.0.0.1".into()),
        port: Some(free_port() as i64),
        max_connections: Some(max_connections),
        local_read_timeout_ms: Some(10_000),
        ..Default::default()
    }
    .validate()
    .unwrap();

    Arc::new(TcpServer::new(config))
}

/// start spawns run and waits until the server is accepting
async fn start(server: &Arc<TcpServer>) -> (JoinHandle<Result<(), ServerError>>, SocketAddr) {
    let handle = {
        let server = Arc::clone(server);
        tokio::spawn(async move { server.run().await })
    };

    timeout(Duration::from_secs(5), async {
        loop {
            if let (Status::Running, Some(addr)) = (server.status(), server.local_addr()) {
                return (handle, addr);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server did not start")
}

async fn wait_for_live(server: &TcpServer, live: usize) {
    timeout(Duration::from_secs(5), async {
        while server.statistics().live_connections != live {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("live connection count never settled");
}

/// echo_server accepts any number of connections and echoes each one
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn greet(proxy: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
    client
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = greet(proxy).await;

    let SocketAddr::V4(target) = target else {
        panic!("test targets are IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    client
}

async fn echo(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn proxies_ipv4_and_domain_targets() {
    let target = echo_server().await;
    let server = server(16);
    let (handle, proxy) = start(&server).await;

    let mut client = open_tunnel(proxy, target).await;
    echo(&mut client, b"hello socks5").await;

    let mut client = greet(proxy).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&target.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);
    echo(&mut client, b"domain works").await;

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_handshake_releases_the_slot() {
    let server = server(16);
    let (handle, proxy) = start(&server).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    wait_for_live(&server, 0).await;
    assert_eq!(server.statistics().total_connections, 1);

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ceiling_drops_excess_connections() {
    let server = server(2);
    let (handle, proxy) = start(&server).await;

    // two clients parked after the handshake keep both slots busy
    let _first = greet(proxy).await;
    let _second = greet(proxy).await;
    wait_for_live(&server, 2).await;

    let mut third = TcpStream::connect(proxy).await.unwrap();
    let _ = third.write_all(&[0x05, 0x01, 0x00]).await;
    let mut buf = [0u8; 2];
    let read = timeout(Duration::from_secs(5), third.read(&mut buf))
        .await
        .expect("excess connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)), "excess connection got a reply");

    let stats = server.statistics();
    assert_eq!(stats.live_connections, 2);
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.rejected_connections, 1);

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_ends_run_and_keeps_open_tunnels() {
    let target = echo_server().await;
    let server = server(16);
    let (handle, proxy) = start(&server).await;

    let mut tunnel = open_tunnel(proxy, target).await;
    echo(&mut tunnel, b"before stop").await;

    timeout(ACCEPT_GRACE, server.stop())
        .await
        .expect("stop did not return")
        .unwrap();
    timeout(ACCEPT_GRACE, handle)
        .await
        .expect("run did not return")
        .unwrap()
        .unwrap();
    assert_eq!(server.status(), Status::Stopped);
    assert_eq!(server.local_addr(), None);

    // no new connections are admitted
    assert!(TcpStream::connect(proxy).await.is_err());

    // the open tunnel drains on its own
    echo(&mut tunnel, b"after stop").await;
    assert_eq!(server.statistics().live_connections, 1);

    drop(tunnel);
    wait_for_live(&server, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn double_run_and_double_stop_are_errors() {
    let server = server(16);
    let (handle, _) = start(&server).await;

    assert!(matches!(server.run().await, Err(ServerError::AlreadyRunning)));
    assert_eq!(server.status(), Status::Running);

    server.stop().await.unwrap();
    assert!(matches!(server.stop().await, Err(ServerError::AlreadyStopped)));
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_before_run_is_an_error() {
    let server = server(16);
    assert!(matches!(server.stop().await, Err(ServerError::AlreadyStopped)));
    assert_eq!(server.statistics().start_time, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_failure_leaves_server_stopped() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ConfigOptions {
        host: Some("127.0.0.1".into()),
        port: Some(occupied.local_addr().unwrap().port() as i64),
        ..Default::default()
    }
    .validate()
    .unwrap();
    let server = TcpServer::new(config);

    assert!(matches!(server.run().await, Err(ServerError::Bind { .. })));
    assert_eq!(server.status(), Status::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_can_restart_after_stop() {
    let server = server(16);

    let (handle, _) = start(&server).await;
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();

    let (handle, proxy) = start(&server).await;
    drop(greet(proxy).await);
    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();

    assert!(server.statistics().total_connections >= 1);
}

#[tokio::test]
async fn server_trait_reports_transport() {
    let server = server(16);
    assert_eq!(Server::proto(server.as_ref()), "tcp");
    assert!(server.address().starts_with("127.0.0.1:"));
}
