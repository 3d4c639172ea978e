//! Reader statistics and the periodic heartbeat.
//!
//! Delta counters (messages read, completions) are swapped to zero each time
//! a heartbeat is built, so every event reports activity since the previous
//! one. Lifetime counters are never reset and only feed
//! [`ReaderSnapshot`](crate::ReaderSnapshot).

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use hookline_core::{HeartbeatEvent, ReaderEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::reader::Reader;

/// Shared atomic counters updated by the pump and by completions.
#[derive(Debug, Default)]
pub struct ReaderStats {
    messages_read: AtomicU64,
    completions_succeeded: AtomicU64,
    completions_failed: AtomicU64,

    ledger_misses: AtomicU64,
    receivers_unavailable: AtomicU64,
    acknowledge_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    rollovers: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Counters accumulated since the previous heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatDeltas {
    /// Messages received.
    pub messages_read: u64,
    /// Completions acknowledged on the broker.
    pub completions_succeeded: u64,
    /// Completions that were not acknowledged.
    pub completions_failed: u64,
}

impl ReaderStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts messages received in one batch.
    pub fn record_read(&self, count: usize) {
        self.messages_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Counts one completion by outcome.
    pub fn record_completion(&self, succeeded: bool) {
        if succeeded {
            self.completions_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a completion for a correlation id that was not in flight.
    pub fn record_ledger_miss(&self) {
        self.ledger_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completion whose receiver was already closed.
    pub fn record_receiver_unavailable(&self) {
        self.receivers_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a broker acknowledgement that failed.
    pub fn record_acknowledge_failure(&self) {
        self.acknowledge_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an envelope the dispatcher refused.
    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a receiver rollover.
    pub fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a receiver creation retry.
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the deltas and resets them to zero.
    pub fn take_deltas(&self) -> HeartbeatDeltas {
        HeartbeatDeltas {
            messages_read: self.messages_read.swap(0, Ordering::AcqRel),
            completions_succeeded: self.completions_succeeded.swap(0, Ordering::AcqRel),
            completions_failed: self.completions_failed.swap(0, Ordering::AcqRel),
        }
    }

    /// Lifetime count of ledger misses.
    pub fn ledger_misses(&self) -> u64 {
        self.ledger_misses.load(Ordering::Relaxed)
    }

    /// Lifetime count of completions against closed receivers.
    pub fn receivers_unavailable(&self) -> u64 {
        self.receivers_unavailable.load(Ordering::Relaxed)
    }

    /// Lifetime count of failed acknowledgements.
    pub fn acknowledge_failures(&self) -> u64 {
        self.acknowledge_failures.load(Ordering::Relaxed)
    }

    /// Lifetime count of refused dispatches.
    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Lifetime count of rollovers.
    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    /// Lifetime count of reconnection retries.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

/// Emits a heartbeat event on a fixed interval.
#[derive(Debug, Clone)]
pub struct HeartbeatReporter {
    reader: Arc<Reader>,
    interval: Duration,
}

impl HeartbeatReporter {
    /// Creates a reporter for `reader` ticking every `interval`.
    pub fn new(reader: Arc<Reader>, interval: Duration) -> Self {
        Self { reader, interval }
    }

    /// Creates a reporter if the init data configures a heartbeat interval.
    pub fn from_reader(reader: &Arc<Reader>) -> Option<Self> {
        reader.init().heartbeat_interval().map(|interval| Self::new(reader.clone(), interval))
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Builds and emits one heartbeat, resetting the delta counters.
    pub async fn emit_heartbeat(&self) -> HeartbeatEvent {
        let init = self.reader.init();
        let deltas = self.reader.stats().take_deltas();

        let event = HeartbeatEvent {
            subscription_name: init.subscription_name.clone(),
            event_type: init.event_type.clone(),
            subscriber_name: init.subscriber_name.clone(),
            in_flight: self.reader.ledger().len(),
            handler_high_water: self.reader.slots().reported_high_water(),
            messages_read_delta: deltas.messages_read,
            completions_succeeded_delta: deltas.completions_succeeded,
            completions_failed_delta: deltas.completions_failed,
            emitted_at: self.reader.clock().now_utc(),
        };

        debug!(
            subscription = %event.subscription_name,
            in_flight = event.in_flight,
            messages_read = event.messages_read_delta,
            "emitting heartbeat"
        );

        self.reader.events().handle_event(ReaderEvent::Heartbeat(event.clone())).await;
        event
    }

    /// Emits a heartbeat every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            subscription = %self.reader.init().subscription_name,
            interval_secs = self.interval.as_secs(),
            "heartbeat started"
        );

        loop {
            tokio::select! {
                () = self.reader.clock().sleep(self.interval) => {
                    self.emit_heartbeat().await;
                },
                () = cancel.cancelled() => break,
            }
        }

        debug!(subscription = %self.reader.init().subscription_name, "heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_reset_after_take() {
        let stats = ReaderStats::new();
        stats.record_read(3);
        stats.record_completion(true);
        stats.record_completion(true);
        stats.record_completion(false);

        assert_eq!(
            stats.take_deltas(),
            HeartbeatDeltas { messages_read: 3, completions_succeeded: 2, completions_failed: 1 }
        );
        assert_eq!(stats.take_deltas(), HeartbeatDeltas::default());
    }

    #[test]
    fn lifetime_counters_survive_take() {
        let stats = ReaderStats::new();
        stats.record_ledger_miss();
        stats.record_rollover();
        stats.record_reconnect_attempt();

        let _ = stats.take_deltas();

        assert_eq!(stats.ledger_misses(), 1);
        assert_eq!(stats.rollovers(), 1);
        assert_eq!(stats.reconnect_attempts(), 1);
    }
}
