use std::time::Duration;

/// Linear backoff for the relay link: attempt `n` waits `n * step`, and
/// after `max_attempts` consecutive failures the link is given up.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    step: Duration,
    attempts: u32,
    disabled: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            step,
            attempts: 0,
            disabled: false,
        }
    }

    /// A successful open resets the attempt counter.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Called when the link closes. Returns the attempt number and delay of
    /// the next retry, or `None` when retries are exhausted or disabled.
    pub fn on_closed(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.step * self.attempts))
    }

    /// Stop scheduling retries (teardown).
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.disabled || self.attempts >= self.max_attempts
    }
}
