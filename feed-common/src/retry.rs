use std::time;

/// The retry policy used to determine how long a transiently failed event
/// waits in the queue before it is delivered again.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Interval before the next delivery of an event that has already been
    /// attempted `attempt` times.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate = self.initial_interval * self.backoff_coefficient.saturating_pow(attempt);

        match self.maximum_interval {
            Some(maximum) => std::cmp::min(candidate, maximum),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}
