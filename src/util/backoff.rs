use std::time::Duration;

use rand::Rng;

pub const RANDOM_FACTOR: f64 = 0.5;

/// Retry tuning shared by the persistent streams and the storage retry loop.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    /// Zero means retry without an attempt cap.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetrySettings {
    pub fn streaming_defaults() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn transaction_defaults() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff with symmetric jitter.
///
/// The first delay after [`ExponentialBackoff::reset`] is zero so a healthy
/// reconnect is immediate; each subsequent delay multiplies the base, clamped
/// to `[initial_delay, max_delay]`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: RetrySettings,
    current_base: Duration,
    attempts: usize,
}

impl ExponentialBackoff {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Returns the next delay, or `None` once the attempt cap is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.settings.max_attempts > 0 && self.attempts >= self.settings.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.current_base.as_secs_f64();
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        let next_base = self.current_base.as_secs_f64() * self.settings.multiplier;
        self.current_base = Duration::from_secs_f64(next_base)
            .clamp(self.settings.initial_delay, self.settings.max_delay);

        Some(delay.min(self.settings.max_delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_base = Duration::ZERO;
    }

    /// Jumps the base straight to the maximum delay. Used when the backend
    /// signals resource exhaustion: retrying sooner only adds load.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }
}
