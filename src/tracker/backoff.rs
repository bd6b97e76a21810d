//! Exponential backoff for transient database writes

use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay before the next retry, or None once retries are exhausted
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }

        let factor = 2_u32.saturating_pow(self.current_attempt);
        let delay = self.initial_delay.saturating_mul(factor);
        Some(std::cmp::min(delay, self.max_delay))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(250), 4);

        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay.as_millis());
            backoff.current_attempt += 1;
        }

        assert_eq!(delays, vec![100, 200, 250, 250]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_exhausts_retries() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 2);

        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }
}
