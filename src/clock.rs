// src/clock.rs
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
///
/// Timeout deadlines and rate-limit wakeups are all expressed on this
/// axis. Workers read it once per loop turn and thread the cached value
/// through the engine, so the inner state machine never takes a time
/// syscall per phase.
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
