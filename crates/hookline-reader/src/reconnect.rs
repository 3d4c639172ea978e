//! Receiver reconnection with capped exponential backoff.
//!
//! Receiver creation is retried forever while it fails with a transport
//! error. Attempt `n` waits `min(base * 2^n, max_delay)`, so with the default
//! one-second base the delays run 2s, 4s, 8s ... up to the 60s ceiling. Any
//! non-transport error is returned to the caller untouched.

use std::{future::Future, sync::Arc, time::Duration};

use hookline_core::{Clock, ReaderEvent, ReaderEventHandler, ReconnectionEvent};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ReaderError, Result};

/// Backoff configuration for receiver reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Unit the exponential factor multiplies.
    pub base_delay: Duration,

    /// Ceiling for any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0). Zero keeps delays exact.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(31);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.checked_mul(multiplier).unwrap_or(self.max_delay);
        let capped = delay.min(self.max_delay);

        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

/// Retries receiver (re)creation on transport failures.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    config: ReconnectConfig,
    subscription_name: String,
    event_type: String,
    clock: Arc<dyn Clock>,
    events: Arc<dyn ReaderEventHandler>,
}

impl ReconnectionPolicy {
    /// Creates a policy reporting attempts for the given subscription.
    pub fn new(
        config: ReconnectConfig,
        subscription_name: impl Into<String>,
        event_type: impl Into<String>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn ReaderEventHandler>,
    ) -> Self {
        Self {
            config,
            subscription_name: subscription_name.into(),
            event_type: event_type.into(),
            clock,
            events,
        }
    }

    /// Returns the backoff configuration.
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds or fails with a non-transport
    /// error.
    ///
    /// Each transport failure emits a `ReconnectionAttempt` event and waits
    /// for the backoff delay before trying again.
    ///
    /// # Errors
    ///
    /// Returns the first non-transport error, or `ReaderError::Cancelled`
    /// once cancellation is requested.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ReaderError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            subscription = %self.subscription_name,
                            attempts = attempt,
                            "receiver reconnected"
                        );
                    }
                    return Ok(value);
                },
                Err(error) if error.is_transport() => error,
                Err(error) => return Err(error),
            };

            attempt = attempt.saturating_add(1);
            let delay = self.config.delay_for_attempt(attempt);

            warn!(
                subscription = %self.subscription_name,
                event_type = %self.event_type,
                attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "receiver setup failed, backing off"
            );

            self.events
                .handle_event(ReaderEvent::ReconnectionAttempt(ReconnectionEvent {
                    attempt,
                    subscription_name: self.subscription_name.clone(),
                    event_type: self.event_type.clone(),
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error_message: error.to_string(),
                    occurred_at: self.clock.now_utc(),
                }))
                .await;

            tokio::select! {
                () = self.clock.sleep(delay) => {},
                () = cancel.cancelled() => return Err(ReaderError::Cancelled),
            }
        }
    }
}
