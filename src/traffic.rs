// src/traffic.rs
//
// Byte accounting and outbound rate shaping. One `Traffic` lives on each
// connection; a bare `RateLimit` is embedded per request as the override
// a handler may install (it replaces, not composes with, the connection
// cap while enabled).

/// Throttle state for one byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub enabled: bool,
    pub bps: u32,
    pub blocked_until: u64,
}

impl RateLimit {
    /// Enable the limiter. A zero cap is ignored: the division guard
    /// belongs to config validation, this is the last line of defense.
    pub fn set(&mut self, bps: u32) {
        if bps == 0 {
            return;
        }
        self.enabled = true;
        self.bps = bps;
    }

    /// Account a completed send and push the earliest-next-write
    /// deadline forward: `sleep_ms = n * 1000 / bps`.
    pub fn on_sent(&mut self, n: usize, now_ms: u64) {
        if self.enabled {
            let sleep_ms = (n as u64 * 1000) / self.bps as u64;
            self.blocked_until = now_ms + sleep_ms;
        }
    }

    /// Deadline the caller must suspend until, if any.
    pub fn blocked(&self, now_ms: u64) -> Option<u64> {
        if self.enabled && self.blocked_until > now_ms {
            Some(self.blocked_until)
        } else {
            None
        }
    }

    pub fn clean(&mut self) {
        *self = RateLimit::default();
    }
}

/// Per-connection traffic counters.
///
/// `rx`/`tx` are cumulative for the life of the connection slot use;
/// the `_partial` pair accumulates since the last accounting boundary
/// and is rolled up into the owning virtual host by `flush_partials`.
#[derive(Debug, Default)]
pub struct Traffic {
    pub rx: u64,
    pub tx: u64,
    pub rx_partial: u64,
    pub tx_partial: u64,
    pub traffic_next: u64,
    pub limit: RateLimit,
}

impl Traffic {
    pub fn new() -> Self {
        Traffic::default()
    }

    /// Record received bytes. Zero-length reads are ignored so spurious
    /// wakeups from the I/O layer never disturb the counters.
    pub fn rx_add(&mut self, n: usize) {
        if n > 0 {
            self.rx += n as u64;
            self.rx_partial += n as u64;
        }
    }

    /// Record sent bytes unconditionally and update the shaping clock.
    pub fn tx_add(&mut self, n: usize, now_ms: u64) {
        self.tx += n as u64;
        self.tx_partial += n as u64;
        self.limit.on_sent(n, now_ms);
    }

    /// At or past the accounting boundary, hand back the partial
    /// counters (zeroing them) and advance the boundary by `lapse_ms`.
    pub fn flush_partials(&mut self, now_ms: u64, lapse_ms: u64) -> Option<(u64, u64)> {
        if now_ms < self.traffic_next {
            return None;
        }
        let out = (self.rx_partial, self.tx_partial);
        self.rx_partial = 0;
        self.tx_partial = 0;
        self.traffic_next = now_ms + lapse_ms;
        Some(out)
    }

    /// Full reset, used between uses of a pooled connection slot.
    pub fn clean(&mut self) {
        *self = Traffic::default();
    }
}
