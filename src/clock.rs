// src/clock.rs
//! Session time source.
//!
//! Timestamps in the trace are monotonic ticks divided by a fixed power of
//! two. Dividing keeps successive deltas small, so they varint-encode in one
//! or two bytes. The wall clock is sampled only at session start/stop to
//! compute the effective tick frequency for the stream footer.

use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Right-shift applied to elapsed nanoseconds; one tick is ~64ns.
pub const TICK_SHIFT: u32 = 6;

/// Tick rate implied by `TICK_SHIFT`, used when the wall clock yields no
/// usable interval.
pub const NOMINAL_TICKS_PER_SEC: u64 = 1_000_000_000 >> TICK_SHIFT;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic tick count.
#[inline]
pub fn ticks() -> u64 {
    (EPOCH.elapsed().as_nanos() as u64) >> TICK_SHIFT
}

/// Wall-clock nanoseconds since the Unix epoch, 0 if the clock is set
/// before it.
pub fn wall_ns() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_wall_ns_nonzero() {
        assert!(wall_ns() > 0);
    }
}
