//! Reader tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ReaderError, Result},
    reconnect::ReconnectConfig,
    DEFAULT_BATCH_SIZE, DEFAULT_INACTIVITY_THRESHOLD, DEFAULT_INITIAL_HANDLER_SLOTS,
    DEFAULT_MAX_HANDLER_SLOTS, DEFAULT_PHASE_OUT_GRACE, DEFAULT_RECEIVE_TIMEOUT,
};

/// Configuration for one Reader instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Maximum messages per receive.
    pub batch_size: usize,

    /// Long-poll timeout for each receive.
    pub receive_timeout: Duration,

    /// Continuous empty-poll time after which the active receiver is rolled
    /// over.
    pub inactivity_threshold: Duration,

    /// How long a phased-out receiver may wait for its completions before it
    /// is closed anyway.
    pub phase_out_grace: Duration,

    /// Slot ids pre-seeded into the free-list.
    pub initial_handler_slots: u32,

    /// Growth cap for slot ids; `None` grows without bound.
    pub max_handler_slots: Option<u32>,

    /// Backoff for receiver reconnection.
    pub reconnect: ReconnectConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            phase_out_grace: DEFAULT_PHASE_OUT_GRACE,
            initial_handler_slots: DEFAULT_INITIAL_HANDLER_SLOTS,
            max_handler_slots: Some(DEFAULT_MAX_HANDLER_SLOTS),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Checks the configuration for values the pump cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReaderError::configuration("batch_size must be at least 1"));
        }
        if self.receive_timeout.is_zero() {
            return Err(ReaderError::configuration("receive_timeout must be positive"));
        }
        if self.inactivity_threshold.is_zero() {
            return Err(ReaderError::configuration("inactivity_threshold must be positive"));
        }
        if let Some(cap) = self.max_handler_slots {
            if cap == 0 {
                return Err(ReaderError::configuration("max_handler_slots must be at least 1"));
            }
            if cap < self.initial_handler_slots {
                return Err(ReaderError::configuration(format!(
                    "max_handler_slots ({cap}) is below initial_handler_slots ({})",
                    self.initial_handler_slots
                )));
            }
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(ReaderError::configuration(
                "reconnect max_delay must not be below base_delay",
            ));
        }
        Ok(())
    }
}
