use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddr, TcpStream as StdTcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout, Instant},
};

use repeater_socket::{RelayError, RelaySocket};

/// A relay running on its own thread, stopped on drop.
struct Relay {
    socket: RelaySocket,
    driver: Option<JoinHandle<Result<(), RelayError>>>,
}

impl Relay {
    fn start(ports: usize) -> Self {
        let mut socket = RelaySocket::bind(Ipv4Addr::LOCALHOST.into(), vec![0; ports]).unwrap();
        let driver = socket.spawn().unwrap();

        Self { socket, driver: Some(driver) }
    }

    fn addr(&self, index: usize) -> SocketAddr {
        self.socket.local_addrs()[index]
    }

    fn members(&self, index: usize) -> usize {
        self.socket.members(self.addr(index).port()).unwrap()
    }

    /// Waits until the domain of listener `index` has exactly `count` members.
    async fn wait_members(&self, index: usize, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.members(index) != count {
            assert!(
                Instant::now() < deadline,
                "expected {count} members on listener {index}, got {}",
                self.members(index)
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn stop(mut self) -> Result<(), RelayError> {
        self.socket.shutdown_handle().shutdown().unwrap();
        self.driver.take().unwrap().join().unwrap()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = self.socket.shutdown_handle().shutdown();
            let _ = driver.join();
        }
    }
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(res.is_err(), "unexpected data: {res:?}");
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

#[tokio::test]
async fn relay_same_port_only() {
    let _ = tracing_subscriber::fmt::try_init();

    // Stands in for `9000 9001-9002`.
    let relay = Relay::start(3);

    let mut c1 = TcpStream::connect(relay.addr(0)).await.unwrap();
    let mut c2 = TcpStream::connect(relay.addr(0)).await.unwrap();
    let mut c3 = TcpStream::connect(relay.addr(1)).await.unwrap();
    relay.wait_members(0, 2).await;
    relay.wait_members(1, 1).await;
    assert_eq!(relay.members(2), 0);

    c1.write_all(b"hello").await.unwrap();

    assert_eq!(read_exactly(&mut c2, 5).await, b"hello");
    assert_silent(&mut c3).await;
    assert_silent(&mut c1).await;

    assert_eq!(relay.socket.stats().bytes_rx(), 5);
    assert_eq!(relay.socket.stats().bytes_tx(), 5);
}

#[tokio::test]
async fn relay_to_all_peers() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(1);

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(relay.addr(0)).await.unwrap());
    }
    relay.wait_members(0, 5).await;

    clients[2].write_all(b"fan-out").await.unwrap();

    for (i, client) in clients.iter_mut().enumerate() {
        if i == 2 {
            assert_silent(client).await;
        } else {
            assert_eq!(read_exactly(client, 7).await, b"fan-out");
        }
    }
}

#[tokio::test]
async fn relay_large_payload_verbatim() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(1);

    let mut sender = TcpStream::connect(relay.addr(0)).await.unwrap();
    let mut rx1 = TcpStream::connect(relay.addr(0)).await.unwrap();
    let mut rx2 = TcpStream::connect(relay.addr(0)).await.unwrap();
    relay.wait_members(0, 3).await;

    // Spans many receive chunks.
    let mut payload = vec![0u8; 32 * 1024];
    rand::thread_rng().fill(&mut payload[..]);

    for chunk in payload.chunks(1500) {
        sender.write_all(chunk).await.unwrap();
    }

    let (got1, got2) =
        tokio::join!(read_exactly(&mut rx1, payload.len()), read_exactly(&mut rx2, payload.len()));

    assert_eq!(got1, payload);
    assert_eq!(got2, payload);
}

#[tokio::test]
async fn relay_evicts_closed_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(1);

    let mut c1 = TcpStream::connect(relay.addr(0)).await.unwrap();
    let c2 = TcpStream::connect(relay.addr(0)).await.unwrap();
    relay.wait_members(0, 2).await;

    // Force-close with a reset.
    c2.set_linger(Some(Duration::ZERO)).unwrap();
    drop(c2);

    c1.write_all(b"ping").await.unwrap();
    relay.wait_members(0, 1).await;

    // The sender is unaffected and keeps relaying to new peers.
    let mut c3 = TcpStream::connect(relay.addr(0)).await.unwrap();
    relay.wait_members(0, 2).await;

    c1.write_all(b"pong").await.unwrap();
    assert_eq!(read_exactly(&mut c3, 4).await, b"pong");
    assert_eq!(relay.socket.stats().active_clients(), 2);
}

#[tokio::test]
async fn relay_tracks_membership() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(2);

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(relay.addr(0)).await.unwrap());
    }
    let other = TcpStream::connect(relay.addr(1)).await.unwrap();
    relay.wait_members(0, 5).await;
    relay.wait_members(1, 1).await;

    clients.truncate(2);
    relay.wait_members(0, 2).await;

    // Churn with at most one extra client at a time.
    for _ in 0..20 {
        let client = TcpStream::connect(relay.addr(0)).await.unwrap();
        relay.wait_members(0, 3).await;
        drop(client);
        relay.wait_members(0, 2).await;
    }

    clients.clear();
    drop(other);
    relay.wait_members(0, 0).await;
    relay.wait_members(1, 0).await;
    assert_eq!(relay.socket.stats().active_clients(), 0);
}

#[tokio::test]
async fn relay_shutdown() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(1);
    let _client = TcpStream::connect(relay.addr(0)).await.unwrap();
    relay.wait_members(0, 1).await;

    assert!(relay.stop().is_ok());
}

#[tokio::test]
async fn relay_flood_does_not_starve_other_ports() {
    let _ = tracing_subscriber::fmt::try_init();

    let relay = Relay::start(2);

    let stop = Arc::new(AtomicBool::new(false));
    let mut flooders = Vec::new();
    for _ in 0..4 {
        let mut stream = StdTcpStream::connect(relay.addr(0)).unwrap();
        let stop = Arc::clone(&stop);
        flooders.push(thread::spawn(move || {
            let buf = vec![0x5A; 256 * 1024];
            while !stop.load(Ordering::Relaxed) {
                if stream.write_all(&buf).is_err() {
                    break;
                }
            }
        }));
    }
    relay.wait_members(0, 4).await;

    // Let the flood build up before touching the other port.
    let deadline = Instant::now() + Duration::from_secs(5);
    while relay.socket.stats().bytes_rx() < 1024 * 1024 {
        assert!(Instant::now() < deadline, "flood never reached the relay");
        sleep(Duration::from_millis(10)).await;
    }

    let mut b1 = TcpStream::connect(relay.addr(1)).await.unwrap();
    let mut b2 = TcpStream::connect(relay.addr(1)).await.unwrap();
    relay.wait_members(1, 2).await;

    b1.write_all(b"still here").await.unwrap();
    assert_eq!(read_exactly(&mut b2, 10).await, b"still here");

    stop.store(true, Ordering::Relaxed);
    drop(relay);
    for flooder in flooders {
        flooder.join().unwrap();
    }
}
