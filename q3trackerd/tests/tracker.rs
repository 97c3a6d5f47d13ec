//! End-to-end tests driving the tracker's UDP and HTTP surfaces over real
//! sockets on loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use q3trackerd::api::routes::{self, AppState};
use q3trackerd::master::MasterServer;
use q3trackerd::poller::{self, PollQueue};
use q3trackerd::registry::Registry;
use shared::protocol;
use shared::types::{ServerEntry, ServerState};

const OOB: &[u8] = b"\xff\xff\xff\xff";

struct Tracker {
    registry: Arc<Registry>,
    queue: Arc<PollQueue>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Binds a master listener on an ephemeral loopback port and serves it in
/// the background.
async fn start_tracker() -> Tracker {
    let registry = Arc::new(Registry::new());
    let queue = Arc::new(PollQueue::new(64));
    let master = MasterServer::bind("127.0.0.1:0", registry.clone(), queue.clone())
        .await
        .expect("bind master listener");
    let addr = master.local_addr().expect("local addr");
    let cancel = CancellationToken::new();
    tokio::spawn(master.run(cancel.clone()));

    Tracker {
        registry,
        queue,
        addr,
        cancel,
    }
}

fn client() -> std::net::UdpSocket {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind client socket");
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("set read timeout");
    socket
}

fn oob(command: &str) -> Vec<u8> {
    let mut buf = OOB.to_vec();
    buf.extend_from_slice(command.as_bytes());
    buf
}

/// Collects reply datagrams until the read times out.
fn recv_all(socket: &std::net::UdpSocket) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok(n) = socket.recv(&mut buf) {
        datagrams.push(buf[..n].to_vec());
    }
    datagrams
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

fn seed(registry: &Registry, ip: [u8; 4], port: u16, build: impl FnOnce(&mut ServerEntry)) -> SocketAddrV4 {
    let addr = SocketAddrV4::new(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]), port);
    registry.get_or_create(addr, || ServerEntry::new(addr, 0, Utc::now()), build);
    addr
}

mod heartbeat {
    use super::*;

    #[tokio::test]
    async fn registers_unknown_sender_and_queues_a_poll() {
        let tracker = start_tracker().await;
        let client = client();
        client.send_to(&oob("heartbeat QuakeArena-1\n"), tracker.addr).unwrap();

        let registry = tracker.registry.clone();
        wait_until(move || registry.len() == 1).await;

        let SocketAddr::V4(client_addr) = client.local_addr().unwrap() else {
            panic!("client socket is not IPv4");
        };
        let entry = tracker.registry.get(client_addr).expect("entry keyed by source address");
        assert_eq!(entry.state, ServerState::New);
        assert_eq!(entry.heartbeats, 1);
        assert_eq!(entry.protocol, 0);
        assert!(entry.last_heartbeat.is_some());
        assert_eq!(tracker.queue.pending(), 1, "new arrival should be queued for a poll");
    }

    #[tokio::test]
    async fn flood_from_one_source_is_rate_limited() {
        let tracker = start_tracker().await;
        let client = client();
        for _ in 0..100 {
            client.send_to(&oob("heartbeat QuakeArena-1\n"), tracker.addr).unwrap();
        }

        let registry = tracker.registry.clone();
        wait_until(move || registry.len() == 1).await;
        // Let the listener drain whatever the limiter admits.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let SocketAddr::V4(client_addr) = client.local_addr().unwrap() else {
            panic!("client socket is not IPv4");
        };
        let entry = tracker.registry.get(client_addr).unwrap();
        // Burst of 4 plus at most ~2/s of refill over the send window.
        assert!(
            (1..=6).contains(&entry.heartbeats),
            "{} heartbeats accepted",
            entry.heartbeats
        );
    }
}

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn recent_liveness_allows_deletion() {
        let tracker = start_tracker().await;
        let client = client();
        let SocketAddr::V4(client_addr) = client.local_addr().unwrap() else {
            panic!("client socket is not IPv4");
        };

        tracker.registry.get_or_create(
            client_addr,
            || ServerEntry::new(client_addr, 57, Utc::now()),
            |e| e.last_heartbeat = Some(Utc::now()),
        );

        client.send_to(&oob("shutdown"), tracker.addr).unwrap();
        let registry = tracker.registry.clone();
        wait_until(move || registry.is_empty()).await;
    }

    #[tokio::test]
    async fn stale_sender_cannot_delete() {
        let tracker = start_tracker().await;
        let client = client();
        let SocketAddr::V4(client_addr) = client.local_addr().unwrap() else {
            panic!("client socket is not IPv4");
        };

        // Known address, but no heartbeat or good poll in the window.
        tracker.registry.get_or_create(
            client_addr,
            || ServerEntry::new(client_addr, 57, Utc::now()),
            |e| {
                e.last_heartbeat = Some(Utc::now() - chrono::Duration::minutes(10));
                e.last_good_poll = Some(Utc::now() - chrono::Duration::minutes(10));
            },
        );

        client.send_to(&oob("shutdown"), tracker.addr).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.registry.len(), 1, "unauthenticated shutdown must be ignored");
    }
}

mod getservers {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn filters_by_protocol_and_routability() {
        let tracker = start_tracker().await;
        seed(&tracker.registry, [192, 0, 2, 1], 27960, |e| e.protocol = 57);
        seed(&tracker.registry, [192, 0, 2, 2], 27961, |e| e.protocol = 84);
        // Protocol not yet learned: matches any query.
        let unknown = seed(&tracker.registry, [192, 0, 2, 3], 27962, |_| {});
        // Loopback never leaves the registry on this wire.
        seed(&tracker.registry, [127, 0, 0, 1], 27963, |e| e.protocol = 57);

        let client = client();
        client.send_to(&oob("getservers 57 full empty"), tracker.addr).unwrap();
        let datagrams = recv_all(&client);
        assert_eq!(datagrams.len(), 1);

        let mut addrs: Vec<SocketAddrV4> = datagrams
            .iter()
            .flat_map(|d| protocol::parse_servers_response(d))
            .collect();
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 27960),
                unknown,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn protocol_zero_returns_everything() {
        let tracker = start_tracker().await;
        seed(&tracker.registry, [192, 0, 2, 1], 27960, |e| e.protocol = 57);
        seed(&tracker.registry, [192, 0, 2, 2], 27961, |e| e.protocol = 84);
        seed(&tracker.registry, [192, 0, 2, 3], 27962, |_| {});

        let client = client();
        client.send_to(&oob("getservers 0"), tracker.addr).unwrap();
        let addrs: Vec<SocketAddrV4> = recv_all(&client)
            .iter()
            .flat_map(|d| protocol::parse_servers_response(d))
            .collect();
        assert_eq!(addrs.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_match_yields_a_terminator_only_datagram() {
        let tracker = start_tracker().await;
        seed(&tracker.registry, [192, 0, 2, 1], 27960, |e| e.protocol = 84);

        let client = client();
        client.send_to(&oob("getservers 57"), tracker.addr).unwrap();
        let datagrams = recv_all(&client);
        assert_eq!(datagrams.len(), 1);

        let mut expected = protocol::SERVERS_RESPONSE_HEADER.to_vec();
        expected.extend_from_slice(b"\\EOT\x00");
        assert_eq!(datagrams[0], expected);
    }
}

mod polling {
    use super::*;

    /// Fake game server answering one `getstatus` with a canned status.
    fn spawn_game_server() -> SocketAddrV4 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("game server socket is not IPv4");
        };
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], protocol::GETSTATUS);

            let mut reply = OOB.to_vec();
            reply.extend_from_slice(
                b"statusResponse\n\\sv_hostname\\Test\\mapname\\q3dm17\\sv_maxclients\\16\\protocol\\68\n2 0 \"BotA\"\n5 42 \"Alice\"\n",
            );
            socket.send_to(&reply, peer).unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn successful_poll_commits_status_and_goes_online() {
        let registry = Registry::new();
        let addr = spawn_game_server();
        registry.get_or_create(addr, || ServerEntry::new(addr, 0, Utc::now()), |_| {});

        poller::poll_server(&registry, addr).await;

        let entry = registry.get(addr).unwrap();
        assert_eq!(entry.state, ServerState::Online);
        assert!(entry.online);
        assert_eq!(entry.hostname, "Test");
        assert_eq!(entry.map, "q3dm17");
        assert_eq!(entry.max_players, 16);
        assert_eq!(entry.players, vec!["Alice"]);
        assert_eq!(entry.player_count, 1);
        assert_eq!(entry.bots, vec!["BotA"]);
        assert_eq!(entry.bot_count, 1);
        assert_eq!(entry.polls, 1);
        assert_eq!(entry.missed_polls, 0);
        assert_eq!(entry.protocol, 68, "reported protocol overwrites the cached one");
        assert!(entry.last_good_poll.is_some());
    }

    #[tokio::test]
    async fn repeated_failures_go_offline_and_keep_last_good_poll() {
        let registry = Registry::new();

        // Bind then drop, so the port is almost certainly closed.
        let dead = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
                panic!("socket is not IPv4");
            };
            addr
        };

        let good_poll = Utc::now() - chrono::Duration::minutes(1);
        registry.get_or_create(
            dead,
            || ServerEntry::new(dead, 57, Utc::now()),
            |e| {
                e.state = ServerState::Online;
                e.online = true;
                e.last_good_poll = Some(good_poll);
                e.last_seen = Some(good_poll);
            },
        );

        for _ in 0..3 {
            poller::poll_server(&registry, dead).await;
        }

        let entry = registry.get(dead).unwrap();
        assert_eq!(entry.state, ServerState::Offline);
        assert!(!entry.online);
        assert_eq!(entry.missed_polls, 3);
        assert_eq!(entry.polls, 3);
        assert_eq!(entry.last_good_poll, Some(good_poll), "failures never touch last_good_poll");
    }
}

mod http_api {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve(registry: Arc<Registry>) -> (SocketAddr, CancellationToken) {
        let app = routes::router(AppState { registry });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await;
        });
        (addr, cancel)
    }

    async fn request(addr: SocketAddr, head: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(head.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn servers_endpoint_returns_sorted_json() {
        let registry = Arc::new(Registry::new());
        seed(&registry, [192, 0, 2, 1], 27960, |e| {
            e.hostname = "quiet".to_string();
        });
        seed(&registry, [192, 0, 2, 2], 27961, |e| {
            e.hostname = "busy".to_string();
            e.players = vec!["Alice".to_string(), "Bob".to_string()];
            e.player_count = 2;
            e.online = true;
            e.state = ServerState::Online;
        });

        let (addr, cancel) = serve(registry).await;
        let response = request(
            addr,
            "GET /api/servers HTTP/1.1\r\nHost: tracker\r\nOrigin: http://example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        cancel.cancel();

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let lower = response.to_ascii_lowercase();
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("access-control-allow-origin: *"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let servers: Vec<serde_json::Value> = serde_json::from_str(body).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0]["hostname"], "busy");
        assert_eq!(servers[0]["player_count"], 2);
        assert_eq!(servers[0]["state"], "online");
        assert_eq!(servers[1]["hostname"], "quiet");
        assert!(servers[1]["last_good_poll"].is_null());
    }

    #[tokio::test]
    async fn options_returns_ok_with_no_body() {
        let registry = Arc::new(Registry::new());
        let (addr, cancel) = serve(registry).await;
        let response = request(
            addr,
            "OPTIONS /api/servers HTTP/1.1\r\nHost: tracker\r\nConnection: close\r\n\r\n",
        )
        .await;
        cancel.cancel();

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }
}
