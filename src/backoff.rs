/**
 * backoff.rs
 *
 * Exponential backoff with jitter for connection retries
 */

use rand::Rng;
use std::time::{Duration, Instant};

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Cap of a single retry delay for peer connection attempts
pub const PEER_MAX_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff policy
///
/// Each delay is the current interval randomized by `randomization_factor`
/// in both directions; the interval then grows by `multiplier` up to
/// `max_interval`. With `max_elapsed_time` set to `None` the policy never
/// gives up.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
    current_interval: Duration,
    start: Instant,
}

impl ExponentialBackoff {
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_elapsed_time: Option<Duration>,
    ) -> Self {
        Self {
            initial_interval,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier,
            max_interval,
            max_elapsed_time,
            current_interval: initial_interval,
            start: Instant::now(),
        }
    }

    /// Policy used for peer connection attempts: default growth, 5s cap,
    /// retries forever
    pub fn peer_default() -> Self {
        Self::new(
            DEFAULT_INITIAL_INTERVAL,
            DEFAULT_MULTIPLIER,
            PEER_MAX_INTERVAL,
            None,
        )
    }

    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start = Instant::now();
    }

    /// Next delay, or `None` once the policy has expired
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.next_backoff_with_rng(&mut rand::thread_rng())
    }

    fn next_backoff_with_rng(&mut self, rng: &mut impl Rng) -> Option<Duration> {
        if let Some(max) = self.max_elapsed_time {
            if self.start.elapsed() > max {
                return None;
            }
        }

        let delay = randomized(self.current_interval, self.randomization_factor, rng);

        let grown = self.current_interval.as_secs_f64() * self.multiplier;
        self.current_interval = if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };

        Some(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::peer_default()
    }
}

fn randomized(interval: Duration, factor: f64, rng: &mut impl Rng) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = factor * base;
    let low = base - delta;
    let high = base + delta;
    Duration::from_secs_f64(rng.gen_range(low..=high))
}
