//! Configuration for the backoff scheduler and the replication coordinator.

use std::time::Duration;

/// Configuration for exponential backoff with randomized jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the un-randomized delay.
    pub max_delay: Duration,
    /// Growth factor applied at every step.
    pub factor: f64,
    /// Fraction of the delay added at random (0.3 adds up to 30%).
    pub randomisation_factor: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration with the default growth and jitter.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: 2.0,
            randomisation_factor: 0.3,
        }
    }

    /// Sets the growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the randomisation factor. Values are clamped to `[0, 1]`.
    pub fn with_randomisation_factor(mut self, randomisation_factor: f64) -> Self {
        self.randomisation_factor = randomisation_factor.clamp(0.0, 1.0);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Un-randomized delay for a 0-indexed step, capped at `max_delay`.
    pub fn base_delay(&self, step: u32) -> Duration {
        let exponent = step.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay for a step given a jitter sample in `[0, 1)`.
    ///
    /// The base delay is multiplied by `1 + randomisation_factor * jitter`,
    /// with both factors clamped to `[0, 1]`.
    pub fn delay_with_jitter(&self, step: u32, jitter: f64) -> Duration {
        let randomisation = self.randomisation_factor.clamp(0.0, 1.0);
        let multiple = 1.0 + randomisation * jitter.clamp(0.0, 1.0);
        self.base_delay(step).mul_f64(multiple)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Options handed to the sync engine when a replication starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationOptions {
    /// Keep replicating as changes happen instead of stopping when caught up.
    pub live: bool,
    /// Let the engine retry internally on transient failures.
    pub retry: bool,
    /// Documents per batch.
    pub batch_size: u32,
    /// Batches buffered ahead of the writer.
    pub batch_limit: u32,
}

impl ReplicationOptions {
    /// Options for a long-running stream. Restarts are paced by the
    /// coordinator, so engine-side retry is off.
    pub fn live() -> Self {
        Self {
            live: true,
            retry: false,
            batch_size: 20,
            batch_limit: 5,
        }
    }

    /// Options for the final "push what you have and stop" flush.
    pub fn one_shot() -> Self {
        Self {
            live: false,
            retry: true,
            batch_size: 100,
            batch_limit: 10,
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the batch limit.
    pub fn with_batch_limit(mut self, limit: u32) -> Self {
        self.batch_limit = limit.max(1);
        self
    }
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self::live()
    }
}

/// Configuration for a replication coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pacing of restarts after failures.
    pub backoff: BackoffConfig,
    /// Options for live streams.
    pub live_options: ReplicationOptions,
    /// Options for the cleanup flush. The flush always runs one-shot, so
    /// `live` is ignored.
    pub flush_options: ReplicationOptions,
    /// Upper bound for the cleanup flush.
    pub flush_timeout: Duration,
    /// Buffered state transitions per subscriber.
    pub state_channel_capacity: usize,
}

impl CoordinatorConfig {
    /// Creates a coordinator configuration with default values.
    pub fn new() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            live_options: ReplicationOptions::live(),
            flush_options: ReplicationOptions::one_shot(),
            flush_timeout: Duration::from_secs(30),
            state_channel_capacity: 64,
        }
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the live stream options.
    pub fn with_live_options(mut self, options: ReplicationOptions) -> Self {
        self.live_options = options;
        self
    }

    /// Sets the cleanup flush timeout.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
