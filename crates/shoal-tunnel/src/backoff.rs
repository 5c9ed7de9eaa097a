//! Jittered exponential backoff for tunnel redials: double the window
//! each failed attempt up to a cap, then pick a uniformly random delay
//! inside it so a fleet of reconnecting nodes does not stampede one
//! proxy.

use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The delay before the next attempt: full jitter over
    /// `min(cap, base * 2^attempt)`.
    pub fn next_delay(&mut self) -> Duration {
        let window = self
            .base
            .saturating_mul(1u32 << self.attempt.min(20))
            .min(self.cap);
        if self.attempt < u32::MAX {
            self.attempt += 1;
        }
        let micros = window.as_micros().max(1) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
    }

    /// Call after a successful connection so the next failure starts
    /// from the base again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
