//! Stateful retry-delay policy with exponential growth and jitter.
//!
//! Unlike a one-shot retry wrapper, the stream client owns a long-lived
//! [`Backoff`] instance: the delay keeps growing across consecutive
//! no-progress failures and is reset to the initial value whenever an attempt
//! made progress before failing.

use std::time::Duration;

/// Default initial retry delay.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum retry delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

/// Default exponential growth factor.
const DEFAULT_MULTIPLIER: f64 = 1.6;

/// Default jitter factor (±20%).
const DEFAULT_JITTER: f64 = 0.2;

/// Configuration for the retry backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,

    /// Exponential growth factor applied after each consecutive failure.
    pub multiplier: f64,

    /// Jitter factor in `[0.0, 1.0]`, applied as ±factor randomness.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// Stateful exponential backoff calculator.
///
/// [`next_delay`](Self::next_delay) returns the current delay (with jitter
/// applied) and advances the internal state for the next call;
/// [`reset`](Self::reset) rewinds to the initial delay.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Creates a new backoff policy starting at the configured initial delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Returns the next retry delay and advances the exponential state.
    ///
    /// The returned value is the current (pre-jitter) delay with ±jitter
    /// randomness applied; the internal delay is then multiplied by the growth
    /// factor and capped at the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.current, self.config.jitter);

        let grown = Duration::from_nanos(
            (self.current.as_nanos() as f64 * self.config.multiplier) as u64,
        );
        self.current = grown.min(self.config.max_delay);

        delay
    }

    /// Rewinds the policy to the initial delay.
    ///
    /// Called after an attempt that made progress (delivered at least one
    /// response) fails, so the next no-progress failure starts the growth
    /// sequence over.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }

    /// Returns the delay that the next [`next_delay`](Self::next_delay) call
    /// will be based on, before jitter.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

/// Applies jitter to a duration.
///
/// Jitter adds randomness in the range `[dur * (1 - factor), dur * (1 + factor)]`
/// to prevent thundering herd when multiple clients retry simultaneously.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rand::Rng::random_range(&mut rng, min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}
