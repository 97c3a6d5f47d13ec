use std::net::SocketAddrV4;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Discovered (from the upstream master or a heartbeat) but never
    /// successfully polled.
    New,
    /// At least one successful poll and currently reachable.
    Online,
    /// Had a good poll before, now failing.
    Offline,
}

/// Metadata and last-known status for a single game server.
/// This is the canonical record shared by the poller, the master listener,
/// and the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// "ip:port", the registry key.
    pub address: SocketAddrV4,

    pub hostname: String,
    pub map: String,
    #[serde(rename = "mod")]
    pub mod_name: String,
    pub gametype: String,
    pub version: String,

    /// sv_punkbuster, as reported.
    pub pb: String,

    /// Always equals `players.len()`.
    pub player_count: usize,
    pub max_players: u32,
    pub players: Vec<String>,

    /// Poll attempts, successful or not.
    pub polls: u32,

    pub last_seen: Option<DateTime<Utc>>,

    /// Always equals `state == Online`.
    pub online: bool,

    /// Game protocol number; 0 means not yet known.
    pub protocol: u32,

    pub bots: Vec<String>,
    /// Always equals `bots.len()`.
    pub bot_count: usize,

    pub state: ServerState,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_good_poll: Option<DateTime<Utc>>,

    /// Consecutive failed polls since the last good one.
    pub missed_polls: u32,

    #[serde(skip)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub heartbeats: u32,
}

impl ServerEntry {
    /// Fresh entry for a newly discovered address. `protocol` is 0 when the
    /// address came from a heartbeat rather than an upstream query.
    pub fn new(address: SocketAddrV4, protocol: u32, now: DateTime<Utc>) -> Self {
        Self {
            address,
            hostname: String::new(),
            map: String::new(),
            mod_name: String::new(),
            gametype: String::new(),
            version: String::new(),
            pb: String::new(),
            player_count: 0,
            max_players: 0,
            players: Vec::new(),
            polls: 0,
            last_seen: None,
            online: false,
            protocol,
            bots: Vec::new(),
            bot_count: 0,
            state: ServerState::New,
            first_seen: Some(now),
            last_attempt: None,
            last_good_poll: None,
            missed_polls: 0,
            last_heartbeat: None,
            heartbeats: 0,
        }
    }
}
