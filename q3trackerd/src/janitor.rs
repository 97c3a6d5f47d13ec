//! Periodic registry sweep: reconciles derived flags, evicts dead entries,
//! and demotes stalled ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use shared::types::ServerState;

use crate::registry::Registry;

/// Runs the sweep on a fixed interval until cancelled.
pub async fn run(registry: Arc<Registry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("janitor shutting down");
                break;
            }
            _ = ticker.tick() => {
                let before = registry.len();
                sweep(&registry, Utc::now());
                // Inserts may land between the two reads.
                let evicted = before.saturating_sub(registry.len());
                if evicted > 0 {
                    tracing::info!(evicted, remaining = registry.len(), "janitor evicted entries");
                }
            }
        }
    }
}

/// One pass over the registry, entirely under its lock.
///
/// New entries fall off after ten straight missed polls, offline entries
/// after seven days without a good poll. Online entries are never evicted
/// but go offline when unseen for five minutes.
pub fn sweep(registry: &Registry, now: DateTime<Utc>) {
    registry.retain(|_, e| {
        e.online = e.state == ServerState::Online;

        match e.state {
            ServerState::New => e.missed_polls < 10,
            ServerState::Offline => {
                !e.last_good_poll.is_some_and(|t| now - t >= chrono::Duration::days(7))
            }
            ServerState::Online => {
                if e.last_seen.is_some_and(|t| now - t > chrono::Duration::minutes(5)) {
                    e.state = ServerState::Offline;
                    e.online = false;
                }
                true
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ServerEntry;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn insert(registry: &Registry, last: u8, build: impl FnOnce(&mut ServerEntry)) -> SocketAddrV4 {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 27960);
        registry.get_or_create(addr, || ServerEntry::new(addr, 57, Utc::now()), build);
        addr
    }

    #[test]
    fn test_new_entries_evicted_after_ten_missed_polls() {
        let registry = Registry::new();
        let doomed = insert(&registry, 1, |e| e.missed_polls = 10);
        let spared = insert(&registry, 2, |e| e.missed_polls = 9);

        sweep(&registry, Utc::now());

        assert!(registry.get(doomed).is_none());
        assert!(registry.get(spared).is_some());
    }

    #[test]
    fn test_offline_entries_evicted_after_seven_days() {
        let registry = Registry::new();
        let now = Utc::now();
        let doomed = insert(&registry, 1, |e| {
            e.state = ServerState::Offline;
            e.last_good_poll = Some(now - chrono::Duration::days(8));
        });
        let spared = insert(&registry, 2, |e| {
            e.state = ServerState::Offline;
            e.last_good_poll = Some(now - chrono::Duration::days(6));
        });

        sweep(&registry, now);

        assert!(registry.get(doomed).is_none());
        assert!(registry.get(spared).is_some());
    }

    #[test]
    fn test_stalled_online_entries_are_demoted() {
        let registry = Registry::new();
        let now = Utc::now();
        let stalled = insert(&registry, 1, |e| {
            e.state = ServerState::Online;
            e.online = true;
            e.last_good_poll = Some(now - chrono::Duration::minutes(10));
            e.last_seen = Some(now - chrono::Duration::minutes(10));
        });
        let fresh = insert(&registry, 2, |e| {
            e.state = ServerState::Online;
            e.online = true;
            e.last_good_poll = Some(now);
            e.last_seen = Some(now);
        });

        sweep(&registry, now);

        let e = registry.get(stalled).unwrap();
        assert_eq!(e.state, ServerState::Offline);
        assert!(!e.online);

        let e = registry.get(fresh).unwrap();
        assert_eq!(e.state, ServerState::Online);
        assert!(e.online);
    }

    #[test]
    fn test_sweep_reconciles_online_flag() {
        let registry = Registry::new();
        let addr = insert(&registry, 1, |e| {
            e.state = ServerState::Online;
            e.online = false; // drifted
            e.last_seen = Some(Utc::now());
        });

        sweep(&registry, Utc::now());
        assert!(registry.get(addr).unwrap().online);
    }
}
