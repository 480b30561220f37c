//! Ping schedule and the "peer is around" indicator.
//!
//! The first ping goes out 3 to 6 seconds after start so two devices powered on
//! together don't ping in lockstep, then every 60 to 120 seconds.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const FIRST_PING_DELAY_MS: Range<u64> = 3_000..6_000;
pub const PING_INTERVAL_MS: Range<u64> = 60_000..120_000;

/// How long the indicator stays lit after a ping from the peer.
pub const PRESENCE_WINDOW_MS: u64 = 5_000;

#[derive(Debug)]
pub struct Heartbeat<R: Rng = StdRng> {
    rng: R,
    next_ping_at_ms: u64,
    last_ping_seen_ms: Option<u64>,
}

impl Heartbeat<StdRng> {
    pub fn new(now_ms: u64) -> Self {
        Self::with_rng(now_ms, StdRng::from_entropy())
    }
}

impl<R: Rng> Heartbeat<R> {
    pub fn with_rng(now_ms: u64, mut rng: R) -> Self {
        let next_ping_at_ms = now_ms + rng.gen_range(FIRST_PING_DELAY_MS);
        Self {
            rng,
            next_ping_at_ms,
            last_ping_seen_ms: None,
        }
    }

    /// True when a ping is due. Schedules the next one.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_ping_at_ms {
            return false;
        }
        self.next_ping_at_ms = now_ms + self.rng.gen_range(PING_INTERVAL_MS);
        true
    }

    pub fn next_ping_at_ms(&self) -> u64 {
        self.next_ping_at_ms
    }

    pub fn on_ping_received(&mut self, now_ms: u64) {
        self.last_ping_seen_ms = Some(now_ms);
    }

    pub fn peer_recently_seen(&self, now_ms: u64) -> bool {
        self.indicator_fade(now_ms).is_some()
    }

    /// Fraction of the presence window elapsed (0.0 just seen, towards 1.0 fading),
    /// or `None` once the indicator is off.
    pub fn indicator_fade(&self, now_ms: u64) -> Option<f32> {
        let seen = self.last_ping_seen_ms?;
        let elapsed = now_ms.saturating_sub(seen);
        if elapsed >= PRESENCE_WINDOW_MS {
            return None;
        }
        Some(elapsed as f32 / PRESENCE_WINDOW_MS as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(seed: u64) -> Heartbeat {
        Heartbeat::with_rng(1_000, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn first_ping_within_startup_window() {
        for seed in 0..50 {
            let hb = heartbeat(seed);
            let delay = hb.next_ping_at_ms() - 1_000;
            assert!(FIRST_PING_DELAY_MS.contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn poll_fires_once_then_reschedules() {
        let mut hb = heartbeat(7);
        let due = hb.next_ping_at_ms();
        assert!(!hb.poll(due - 1));
        assert!(hb.poll(due));
        assert!(!hb.poll(due));

        let next = hb.next_ping_at_ms();
        assert!(PING_INTERVAL_MS.contains(&(next - due)));
        assert!(hb.poll(next + 10));
    }

    #[test]
    fn indicator_lit_for_five_seconds() {
        let mut hb = heartbeat(1);
        assert!(!hb.peer_recently_seen(0));
        hb.on_ping_received(10_000);
        assert_eq!(hb.indicator_fade(10_000), Some(0.0));
        assert!(hb.peer_recently_seen(10_000 + PRESENCE_WINDOW_MS - 1));
        assert!(!hb.peer_recently_seen(10_000 + PRESENCE_WINDOW_MS));

        hb.on_ping_received(20_000);
        let fade = hb.indicator_fade(22_500).unwrap();
        assert!((fade - 0.5).abs() < f32::EPSILON);
    }
}
