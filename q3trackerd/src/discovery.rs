//! Upstream discovery: periodically asks a well-known master for server
//! addresses and seeds the registry with anything new.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use shared::protocol;
use shared::types::ServerEntry;

use crate::config::UpstreamConfig;
use crate::poller::PollQueue;
use crate::registry::Registry;

/// Per-read deadline while draining a master's multi-packet reply.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Runs the discovery loop until cancelled. The first refresh happens
/// immediately on startup.
pub async fn run(
    registry: Arc<Registry>,
    queue: Arc<PollQueue>,
    config: UpstreamConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("discovery shutting down");
                break;
            }
            _ = ticker.tick() => refresh(&registry, &queue, &config).await,
        }
    }
}

/// One refresh cycle. A failing protocol is logged and skipped; the next
/// tick is the retry.
async fn refresh(registry: &Registry, queue: &PollQueue, config: &UpstreamConfig) {
    for &proto in &config.protocols {
        match fetch_servers(&config.host, proto).await {
            Ok(addrs) => {
                let now = Utc::now();
                let mut added = 0;
                for addr in addrs {
                    let created =
                        registry.get_or_create(addr, || ServerEntry::new(addr, proto, now), |_| {});
                    if created {
                        queue.enqueue(addr);
                        added += 1;
                    }
                }
                tracing::info!(protocol = proto, new = added, "refreshed from upstream master");
            }
            Err(err) => {
                tracing::warn!(protocol = proto, error = %err, "upstream master query failed");
            }
        }
    }
}

/// Queries the upstream master for one protocol. The reply may span
/// several datagrams; reads continue until a short deadline passes with
/// nothing further.
async fn fetch_servers(host: &str, proto: u32) -> Result<Vec<SocketAddrV4>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(host)
        .await
        .with_context(|| format!("connecting to master {host}"))?;
    socket.send(&protocol::getservers_query(proto)).await?;

    let mut addrs = Vec::new();
    let mut buf = [0u8; 1400];
    loop {
        match timeout(READ_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => addrs.extend(protocol::parse_servers_response(&buf[..n])),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    Ok(addrs)
}
