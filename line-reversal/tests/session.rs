use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use line_reversal::Listener;

const TIMEOUT: Duration = Duration::from_secs(1);

async fn spawn_server() -> SocketAddr {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr();
    tokio::spawn(line_reversal::run(listener));

    addr
}

async fn client(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 1024];
    let len = timeout(TIMEOUT, socket.recv(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf[..len].to_vec()
}

/// The ack for a data message and the reversed line race; accept both
/// orders.
async fn recv_pair(socket: &UdpSocket) -> Vec<Vec<u8>> {
    let mut messages = vec![recv(socket).await, recv(socket).await];
    messages.sort();
    messages
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(200), socket.recv(&mut buf))
            .await
            .is_err(),
        "expected no datagram"
    );
}

#[tokio::test]
async fn session_lifecycle() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/12345/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/12345/0/");

    socket.send(b"/data/12345/0/hello\n/").await.unwrap();
    let mut expected: Vec<Vec<u8>> =
        vec![b"/ack/12345/6/".to_vec(), b"/data/12345/0/olleh\n/".to_vec()];
    expected.sort();
    assert_eq!(recv_pair(&socket).await, expected);

    socket.send(b"/ack/12345/6/").await.unwrap();
    socket.send(b"/close/12345/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/close/12345/");
}

#[tokio::test]
async fn data_beyond_the_frontier_is_not_applied() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/99/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/99/0/");

    socket.send(b"/data/99/10/XYZ/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/99/0/");

    // The stream really is still empty.
    socket.send(b"/data/99/0/abc\n/").await.unwrap();
    let mut expected: Vec<Vec<u8>> =
        vec![b"/ack/99/4/".to_vec(), b"/data/99/0/cba\n/".to_vec()];
    expected.sort();
    assert_eq!(recv_pair(&socket).await, expected);
}

#[tokio::test]
async fn duplicate_data_is_acked_but_not_reapplied() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/7/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/7/0/");

    socket.send(b"/data/7/0/hi\n/").await.unwrap();
    let mut expected: Vec<Vec<u8>> =
        vec![b"/ack/7/3/".to_vec(), b"/data/7/0/ih\n/".to_vec()];
    expected.sort();
    assert_eq!(recv_pair(&socket).await, expected);
    socket.send(b"/ack/7/3/").await.unwrap();

    socket.send(b"/data/7/0/hi\n/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/7/3/");
    expect_silence(&socket).await;
}

#[tokio::test]
async fn reconnect_acks_the_current_frontier() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/31337/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/31337/0/");

    socket.send(b"/data/31337/0/ping\n/").await.unwrap();
    let _ = recv_pair(&socket).await;
    socket.send(b"/ack/31337/5/").await.unwrap();

    socket.send(b"/connect/31337/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/31337/5/");
}

#[tokio::test]
async fn operations_on_unknown_sessions_are_closed() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/data/404/0/hello\n/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/close/404/");

    socket.send(b"/ack/404/3/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/close/404/");

    socket.send(b"/close/404/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/close/404/");
}

#[tokio::test]
async fn malformed_datagrams_are_dropped_silently() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/1/extra/").await.unwrap();
    socket.send(b"hello there").await.unwrap();
    socket.send(b"/data/1/abc/x/").await.unwrap();
    // Session id past 2^31 - 1.
    socket.send(b"/connect/2147483648/").await.unwrap();
    expect_silence(&socket).await;

    // A well-formed connect still works afterwards.
    socket.send(b"/connect/2147483647/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/2147483647/0/");
}

#[tokio::test]
async fn escaped_slashes_survive_the_round_trip() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/77/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/77/0/");

    socket.send(b"/data/77/0/foo\\/bar\n/").await.unwrap();
    let mut expected: Vec<Vec<u8>> = vec![
        b"/ack/77/8/".to_vec(),
        b"/data/77/0/rab\\/oof\n/".to_vec(),
    ];
    expected.sort();
    assert_eq!(recv_pair(&socket).await, expected);
}

#[tokio::test]
async fn unacked_data_is_retransmitted() {
    let server = spawn_server().await;
    let socket = client(server).await;

    socket.send(b"/connect/55/").await.unwrap();
    assert_eq!(recv(&socket).await, b"/ack/55/0/");

    socket.send(b"/data/55/0/abc\n/").await.unwrap();
    let first = recv_pair(&socket).await;
    assert!(first.contains(&b"/data/55/0/cba\n/".to_vec()));

    // Withhold the ack; the same data frame comes back within the
    // retransmission window.
    let mut buf = [0u8; 1024];
    let len = timeout(Duration::from_secs(4), socket.recv(&mut buf))
        .await
        .expect("expected a retransmission")
        .unwrap();
    assert_eq!(&buf[..len], b"/data/55/0/cba\n/");
}
