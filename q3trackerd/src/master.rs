//! Master-side UDP listener: answers `getservers` from our registry and
//! accepts `heartbeat`/`shutdown` from game servers.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use shared::protocol::{self, Request};
use shared::types::ServerEntry;

use crate::poller::PollQueue;
use crate::ratelimit::{RateLimiter, RequestKind};
use crate::registry::Registry;

pub struct MasterServer {
    socket: UdpSocket,
    registry: Arc<Registry>,
    queue: Arc<PollQueue>,
    limiter: RateLimiter,
}

impl MasterServer {
    /// Binds the listener socket.
    pub async fn bind(addr: &str, registry: Arc<Registry>, queue: Arc<PollQueue>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding master listener on {addr}"))?;
        tracing::info!(addr = %socket.local_addr()?, "master listener bound");
        Ok(Self {
            socket,
            registry,
            queue,
            limiter: RateLimiter::new(),
        })
    }

    /// Local socket address, useful when bound to an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves datagrams until cancelled. Malformed or rate-limited traffic
    /// is dropped without a reply.
    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("master listener shutting down");
                    break;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, peer)) => self.handle_datagram(&buf[..n], peer).await,
                        Err(err) => tracing::debug!(error = %err, "listener read failed"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        // The getservers wire format is IPv4 only, and so is the registry.
        let SocketAddr::V4(peer) = peer else { return };
        let Some(request) = protocol::parse_request(datagram) else {
            return;
        };

        let kind = match request {
            Request::GetServers { .. } => RequestKind::GetServers,
            Request::Heartbeat => RequestKind::Heartbeat,
            Request::Shutdown => RequestKind::Shutdown,
        };
        if !self.limiter.allow(IpAddr::V4(*peer.ip()), kind) {
            return;
        }

        match request {
            Request::Heartbeat => self.handle_heartbeat(peer),
            Request::Shutdown => self.handle_shutdown(peer),
            Request::GetServers { protocol } => self.handle_getservers(peer, protocol).await,
        }
    }

    /// A heartbeat makes the sender known; fresh arrivals get queued for a
    /// poll right away. No reply is sent.
    fn handle_heartbeat(&self, peer: SocketAddrV4) {
        let now = Utc::now();
        let created = self.registry.get_or_create(
            peer,
            // Protocol stays 0 until the poller learns it.
            || ServerEntry::new(peer, 0, now),
            |e| {
                e.missed_polls = 0;
                e.last_heartbeat = Some(now);
                e.heartbeats += 1;
            },
        );
        if created {
            tracing::debug!(server = %peer, "heartbeat from unknown server");
            self.queue.enqueue(peer);
        }
    }

    /// Deletes the sender's entry, but only when its own recent liveness
    /// (a heartbeat or good poll within five minutes) vouches for the
    /// claim. Anyone can forge a source address; a stale entry is not
    /// worth deleting on an unverified say-so.
    fn handle_shutdown(&self, peer: SocketAddrV4) {
        let now = Utc::now();
        let window = chrono::Duration::minutes(5);
        let removed = self.registry.remove_if(peer, |e| {
            e.last_heartbeat.is_some_and(|t| now - t < window)
                || e.last_good_poll.is_some_and(|t| now - t < window)
        });
        if removed {
            tracing::info!(server = %peer, "server shut down");
        }
    }

    /// Answers with the filtered server list, chunked into datagrams. An
    /// entry whose protocol is still unknown matches every query.
    async fn handle_getservers(&self, peer: SocketAddrV4, requested: u32) {
        let addrs = self.registry.addrs_where(|e| {
            (requested == 0 || e.protocol == 0 || e.protocol == requested)
                && protocol::is_global_unicast(*e.address.ip())
        });

        for datagram in protocol::encode_servers_response(&addrs) {
            if let Err(err) = self.socket.send_to(&datagram, SocketAddr::V4(peer)).await {
                tracing::debug!(peer = %peer, error = %err, "getservers reply failed");
                break;
            }
        }
    }
}
