//! Quake3 out-of-band wire codec.
//!
//! Every out-of-band datagram opens with four 0xFF bytes followed by a text
//! command and whitespace-separated arguments. Replies to `getservers`
//! carry binary 6-byte entries (IPv4 + big-endian port) separated by
//! backslashes.

use std::net::{Ipv4Addr, SocketAddrV4};

/// Marker opening every out-of-band datagram.
pub const OOB_MARKER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Header of a master's reply to `getservers`.
pub const SERVERS_RESPONSE_HEADER: &[u8] = b"\xff\xff\xff\xffgetserversResponse\n";

/// Status query sent to a game server.
pub const GETSTATUS: &[u8] = b"\xff\xff\xff\xffgetstatus\n";

/// Upper bound on an emitted `getserversResponse` datagram.
pub const MAX_DATAGRAM: usize = 1200;

/// IPv4 address plus big-endian port.
const ENTRY_WIRE_LEN: usize = 6;

/// Sentinel closing every emitted `getserversResponse` datagram.
const TERMINATOR: &[u8] = b"\\EOT\x00";

/// A request accepted by the master listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `getservers <protocol> ...` — protocol 0 means "any".
    GetServers { protocol: u32 },
    /// `heartbeat <tag>` — the tag is accepted but not interpreted.
    Heartbeat,
    /// The sender declares itself gone.
    Shutdown,
}

/// Parses an integer the lenient way the wire expects: garbage becomes 0.
pub fn parse_int(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

/// Returns the payload with the out-of-band marker removed, if present.
pub fn strip_marker(data: &[u8]) -> &[u8] {
    data.strip_prefix(&OOB_MARKER[..]).unwrap_or(data)
}

/// True for addresses worth handing to clients: not unspecified, loopback,
/// link-local, multicast, or broadcast.
pub fn is_global_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

/// Builds the `getservers` query sent to an upstream master.
pub fn getservers_query(protocol: u32) -> Vec<u8> {
    let mut buf = OOB_MARKER.to_vec();
    buf.extend_from_slice(format!("getservers {protocol} full empty").as_bytes());
    buf
}

/// Decodes an inbound datagram into a listener request. Anything that is
/// not a recognized command yields None and is dropped.
pub fn parse_request(datagram: &[u8]) -> Option<Request> {
    let text = String::from_utf8_lossy(strip_marker(datagram));
    let line = text.trim_end_matches(['\0', '\n', '\r', ' ']);
    let lower = line.to_ascii_lowercase();

    if lower.starts_with("getservers") {
        let protocol = line.split_whitespace().nth(1).map(parse_int).unwrap_or(0);
        Some(Request::GetServers { protocol })
    } else if lower.starts_with("heartbeat") {
        Some(Request::Heartbeat)
    } else if lower.starts_with("shutdown") {
        Some(Request::Shutdown)
    } else {
        None
    }
}

/// Decodes one `getserversResponse` datagram into socket addresses.
///
/// Backslash bytes are separators and are skipped; every other position
/// starts a 6-byte entry. The walk stops when fewer than 6 bytes remain,
/// which also swallows the trailing `EOT` sentinel. Unusable addresses are
/// dropped here so callers never see them.
pub fn parse_servers_response(datagram: &[u8]) -> Vec<SocketAddrV4> {
    let mut data = datagram;
    if let Some(rest) = data.strip_prefix(SERVERS_RESPONSE_HEADER) {
        data = rest;
    }
    if let Some(rest) = data.strip_suffix(&[0x00]) {
        data = rest;
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i + ENTRY_WIRE_LEN <= data.len() {
        if data[i] == b'\\' {
            i += 1;
            continue;
        }
        let ip = Ipv4Addr::new(data[i], data[i + 1], data[i + 2], data[i + 3]);
        let port = u16::from_be_bytes([data[i + 4], data[i + 5]]);
        i += ENTRY_WIRE_LEN;

        if !is_global_unicast(ip) {
            continue;
        }
        out.push(SocketAddrV4::new(ip, port));
    }
    out
}

/// Encodes addresses as one or more `getserversResponse` datagrams, each
/// at most [`MAX_DATAGRAM`] bytes and each closed with `\EOT\0`. An empty
/// list still produces one terminator-only datagram so the client sees a
/// definite end of transmission.
pub fn encode_servers_response(addrs: &[SocketAddrV4]) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut pkt = SERVERS_RESPONSE_HEADER.to_vec();

    for addr in addrs {
        if pkt.len() + 1 + ENTRY_WIRE_LEN + TERMINATOR.len() > MAX_DATAGRAM {
            pkt.extend_from_slice(TERMINATOR);
            datagrams.push(pkt);
            pkt = SERVERS_RESPONSE_HEADER.to_vec();
        }
        pkt.push(b'\\');
        pkt.extend_from_slice(&addr.ip().octets());
        pkt.extend_from_slice(&addr.port().to_be_bytes());
    }

    pkt.extend_from_slice(TERMINATOR);
    datagrams.push(pkt);
    datagrams
}

/// Status reported by a game server in reply to `getstatus`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub hostname: String,
    pub map: String,
    pub mod_name: String,
    pub gametype: String,
    pub version: String,
    pub pb: String,
    pub max_players: u32,
    pub protocol: u32,
    pub players: Vec<String>,
    pub bots: Vec<String>,
}

/// Parses a `statusResponse` datagram.
///
/// The parser keys off line position: the first line (the command echo) is
/// ignored, the second carries `\key\value` pairs, and every further
/// non-empty line is one connected client, `frags ping "name"`. A ping of
/// exactly "0" marks a bot. Returns None when the reply is too short to
/// carry an info line.
pub fn parse_status_response(datagram: &[u8]) -> Option<ServerStatus> {
    let text = String::from_utf8_lossy(strip_marker(datagram)).into_owned();
    let mut lines = text.split('\n');

    lines.next()?;
    let info = lines.next()?;

    let mut status = ServerStatus::default();
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');
    loop {
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            break;
        };
        match key {
            "sv_hostname" => status.hostname = value.to_string(),
            "mapname" => status.map = value.to_string(),
            "gamename" => status.mod_name = value.to_string(),
            "g_gametype" => status.gametype = value.to_string(),
            "version" => status.version = value.to_string(),
            "sv_punkbuster" => status.pb = value.to_string(),
            "sv_maxclients" => status.max_players = parse_int(value),
            "protocol" => status.protocol = parse_int(value),
            _ => {}
        }
    }

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let Some(ping) = line.split_whitespace().nth(1) else {
            continue;
        };
        // Name is whatever sits between the first pair of double quotes.
        let name = line.splitn(3, '"').nth(1).unwrap_or("").to_string();
        if ping == "0" {
            status.bots.push(name);
        } else {
            status.players.push(name);
        }
    }

    Some(status)
}
