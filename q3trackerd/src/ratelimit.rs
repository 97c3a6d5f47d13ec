//! Token-bucket rate limiting for the master listener.
//!
//! One global bucket bounds the whole inbound load; per-peer buckets with
//! per-request-kind parameters bound individual sources. Buckets refill
//! continuously. Empty bucket = drop, silently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

const GLOBAL_RATE: f64 = 50.0;
const GLOBAL_BURST: f64 = 100.0;

/// Request classes the listener throttles independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetServers,
    Heartbeat,
    Shutdown,
}

impl RequestKind {
    /// (tokens per second, burst) for one peer.
    fn limits(self) -> (f64, f64) {
        match self {
            RequestKind::GetServers => (1.5, 4.0),
            RequestKind::Heartbeat => (2.0, 4.0),
            RequestKind::Shutdown => (0.5, 1.0),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            burst,
            rate,
            last_refill: now,
        }
    }

    /// Refills for the elapsed time, then tries to take one token.
    fn take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Buckets {
    global: TokenBucket,
    per_peer: HashMap<(IpAddr, RequestKind), TokenBucket>,
}

/// Admission control keyed by (source IP, request kind), with a global
/// ceiling in front. Guarded by its own lock so an inbound flood never
/// contends with registry writers.
pub struct RateLimiter {
    inner: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Buckets {
                global: TokenBucket::new(GLOBAL_RATE, GLOBAL_BURST, Instant::now()),
                per_peer: HashMap::new(),
            }),
        }
    }

    /// One admission decision: the global bucket pays first, then the
    /// peer's bucket for this request kind.
    pub fn allow(&self, ip: IpAddr, kind: RequestKind) -> bool {
        self.allow_at(ip, kind, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, kind: RequestKind, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.global.take(now) {
            return false;
        }
        inner
            .per_peer
            .entry((ip, kind))
            .or_insert_with(|| {
                let (rate, burst) = kind.limits();
                TokenBucket::new(rate, burst, now)
            })
            .take(now)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
