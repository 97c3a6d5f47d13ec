//! Status polling: a de-duplicated bounded queue, a fixed worker pool, and
//! a periodic scan that keeps every entry fresh.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use shared::protocol::{self, ServerStatus};
use shared::types::ServerState;

use crate::registry::Registry;

/// A polled server gets this long to answer `getstatus`.
const POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded poll queue with de-duplication.
///
/// `pending` mirrors the channel contents so repeat requests for an address
/// already in line are dropped instead of queued twice. It has its own
/// lock; the registry lock is never taken while holding it.
pub struct PollQueue {
    tx: flume::Sender<SocketAddrV4>,
    rx: flume::Receiver<SocketAddrV4>,
    pending: Mutex<HashSet<SocketAddrV4>>,
}

impl PollQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Schedules an address unless it is already in line. A full channel
    /// drops the request without marking, so a later attempt can land; the
    /// periodic scan is the retry.
    pub fn enqueue(&self, addr: SocketAddrV4) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains(&addr) {
            return false;
        }
        match self.tx.try_send(addr) {
            Ok(()) => {
                pending.insert(addr);
                true
            }
            Err(_) => false,
        }
    }

    /// Next address to poll. The pending mark is cleared here, before the
    /// poll starts, so a fresh request arriving mid-poll queues again.
    pub async fn next(&self) -> Option<SocketAddrV4> {
        let addr = self.rx.recv_async().await.ok()?;
        self.pending.lock().remove(&addr);
        Some(addr)
    }

    /// Addresses currently sitting in the channel.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Addresses currently marked pending.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// One poll worker. Runs until cancelled.
pub async fn run_worker(registry: Arc<Registry>, queue: Arc<PollQueue>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.next() => {
                let Some(addr) = next else { break };
                if registry.get(addr).is_some() {
                    poll_server(&registry, addr).await;
                }
            }
        }
    }
}

/// Periodic scan: queues everything that is offline or has not been seen
/// for over two minutes.
pub async fn run_scan(
    registry: Arc<Registry>,
    queue: Arc<PollQueue>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("poll scan shutting down");
                break;
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                let due = registry.addrs_where(|e| needs_poll(e.online, e.last_seen, now));
                for addr in due {
                    queue.enqueue(addr);
                }
            }
        }
    }
}

/// One status poll: reserve under the registry lock, talk to the server
/// with the lock released, then commit the outcome.
pub async fn poll_server(registry: &Registry, addr: SocketAddrV4) {
    let now = Utc::now();
    registry.update(addr, |e| {
        e.polls += 1;
        e.last_attempt = Some(now);
    });

    match query_status(addr).await {
        Ok(status) => {
            let now = Utc::now();
            registry.update(addr, |e| {
                e.hostname = status.hostname;
                e.map = status.map;
                e.mod_name = status.mod_name;
                e.gametype = status.gametype;
                e.version = status.version;
                e.pb = status.pb;
                e.max_players = status.max_players;
                e.player_count = status.players.len();
                e.players = status.players;
                e.bot_count = status.bots.len();
                e.bots = status.bots;
                e.last_seen = Some(now);
                e.last_good_poll = Some(now);
                e.online = true;
                e.state = ServerState::Online;
                e.missed_polls = 0;
                if status.protocol != 0 {
                    e.protocol = status.protocol;
                }
            });
        }
        Err(err) => {
            tracing::debug!(server = %addr, error = %err, "status poll failed");
            mark_offline(registry, addr);
        }
    }
}

/// Sends `getstatus` and parses the reply. Any transport or parse problem
/// is a poll failure; the next scheduled poll is the retry.
async fn query_status(addr: SocketAddrV4) -> anyhow::Result<ServerStatus> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    socket.send(protocol::GETSTATUS).await?;

    let mut buf = [0u8; 4096];
    let n = timeout(POLL_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("status poll timed out")??;
    if n == 0 {
        anyhow::bail!("empty reply");
    }
    protocol::parse_status_response(&buf[..n]).context("malformed status reply")
}

/// A failed poll. Entries that never had a good poll stay `New`; the
/// others go `Offline`.
pub fn mark_offline(registry: &Registry, addr: SocketAddrV4) {
    registry.update(addr, |e| {
        e.online = false;
        e.missed_polls += 1;
        e.state = if e.last_good_poll.is_some() {
            ServerState::Offline
        } else {
            ServerState::New
        };
    });
}

/// True when the entry should be re-polled: offline, or quiet for too long.
pub fn needs_poll(online: bool, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    !online || last_seen.is_none_or(|seen| now - seen > chrono::Duration::minutes(2))
}
