use crate::amqp::configuration::ReconnectSettings;
use std::time::Duration;

/// Exponential backoff between reconnection attempts.
///
/// Delays double after every attempt and never exceed `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// The delay to observe before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

impl From<&ReconnectSettings> for Backoff {
    fn from(settings: &ReconnectSettings) -> Self {
        Self::new(settings.initial_backoff(), settings.max_backoff())
    }
}
