//! Outward telemetry events emitted by a Reader.
//!
//! Defines the heartbeat, reconnection and receiver lifecycle events and the
//! handler trait that forwards them to whatever telemetry transport the host
//! provides. The Reader never depends on a concrete transport.
//!
//! # Event Flow Architecture
//!
//! ```text
//! ┌───────────────────┐  Heartbeat       ┌────────────────────┐
//! │ HeartbeatReporter │ ───────────────▶ │                    │
//! └───────────────────┘                  │ MulticastHandler   │
//! ┌───────────────────┐  Reconnection    │ (Event Dispatcher) │
//! │ ReaderPump        │ ───────────────▶ │                    │
//! │                   │  Rollover/Closed └────────────────────┘
//! └───────────────────┘                            │
//!                                                  ▼
//!                                       ┌─────────────────────┐
//!                                       │ TracingEventHandler │
//!                                       │ host telemetry sink │
//!                                       └─────────────────────┘
//! ```

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::ReceiverId;

/// Events emitted by a Reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReaderEvent {
    /// Periodic liveness and throughput report.
    Heartbeat(HeartbeatEvent),

    /// Receiver (re)creation failed with a transport error and is being
    /// retried.
    ReconnectionAttempt(ReconnectionEvent),

    /// The active receiver was replaced.
    RolledOver(RolloverEvent),

    /// A phased-out receiver was closed.
    ReceiverClosed(ReceiverClosedEvent),
}

/// Liveness report derived from pump state.
///
/// Counters named `*_delta` cover only the interval since the previous
/// heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    /// Subscription drained by the Reader.
    pub subscription_name: String,

    /// Event type of the subscription.
    pub event_type: String,

    /// Subscriber the Reader delivers to.
    pub subscriber_name: String,

    /// Messages currently in flight.
    pub in_flight: usize,

    /// Highest handler slot id minted so far, zero before first use.
    pub handler_high_water: u32,

    /// Messages read from the broker since the last heartbeat.
    pub messages_read_delta: u64,

    /// Successful completions since the last heartbeat.
    pub completions_succeeded_delta: u64,

    /// Failed completions since the last heartbeat.
    pub completions_failed_delta: u64,

    /// When the heartbeat was produced.
    pub emitted_at: DateTime<Utc>,
}

/// Emitted for every receiver (re)creation retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionEvent {
    /// Retry attempt number (1-based).
    pub attempt: u32,

    /// Subscription being reconnected.
    pub subscription_name: String,

    /// Event type of the subscription.
    pub event_type: String,

    /// Delay before the next attempt in milliseconds.
    pub delay_ms: u64,

    /// Transport error that caused the retry.
    pub error_message: String,

    /// When the attempt failed.
    pub occurred_at: DateTime<Utc>,
}

/// Why the active receiver was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloverReason {
    /// The receiver reported only empty polls for longer than the
    /// inactivity threshold.
    Inactivity,
    /// A transport failure forced a reconnect.
    TransportFailure,
}

impl fmt::Display for RolloverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactivity => write!(f, "inactivity"),
            Self::TransportFailure => write!(f, "transport_failure"),
        }
    }
}

/// Emitted when a new receiver becomes active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverEvent {
    /// Subscription the receivers read from.
    pub subscription_name: String,

    /// Receiver demoted to phased-out.
    pub previous_receiver: ReceiverId,

    /// Receiver now active.
    pub active_receiver: ReceiverId,

    /// Trigger of the rollover.
    pub reason: RolloverReason,

    /// When the rollover happened.
    pub occurred_at: DateTime<Utc>,
}

/// Emitted when a phased-out receiver is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverClosedEvent {
    /// Subscription the receiver read from.
    pub subscription_name: String,

    /// Closed receiver.
    pub receiver_id: ReceiverId,

    /// Messages from this receiver still uncompleted at close time. Non-zero
    /// only when the force-closure deadline fired.
    pub outstanding: u64,

    /// When the receiver was closed.
    pub closed_at: DateTime<Utc>,
}

/// Trait for handling Reader telemetry events.
///
/// Implementations must not block the caller for long: the pump awaits
/// reconnection and rollover events inline.
#[async_trait::async_trait]
pub trait ReaderEventHandler: Send + Sync + fmt::Debug {
    /// Handles a Reader event.
    ///
    /// Failures are the handler's own concern and must not propagate back
    /// into the Reader.
    async fn handle_event(&self, event: ReaderEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ReaderEventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: ReaderEvent) {}
}

/// Event handler that writes every event to the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

impl TracingEventHandler {
    /// Creates a new tracing event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ReaderEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::Heartbeat(heartbeat) => info!(
                subscription = %heartbeat.subscription_name,
                subscriber = %heartbeat.subscriber_name,
                in_flight = heartbeat.in_flight,
                handler_high_water = heartbeat.handler_high_water,
                messages_read = heartbeat.messages_read_delta,
                completions_succeeded = heartbeat.completions_succeeded_delta,
                completions_failed = heartbeat.completions_failed_delta,
                "reader heartbeat"
            ),
            ReaderEvent::ReconnectionAttempt(attempt) => info!(
                subscription = %attempt.subscription_name,
                event_type = %attempt.event_type,
                attempt = attempt.attempt,
                delay_ms = attempt.delay_ms,
                error = %attempt.error_message,
                "receiver reconnection attempt"
            ),
            ReaderEvent::RolledOver(rollover) => info!(
                subscription = %rollover.subscription_name,
                previous_receiver = %rollover.previous_receiver,
                active_receiver = %rollover.active_receiver,
                reason = %rollover.reason,
                "receiver rolled over"
            ),
            ReaderEvent::ReceiverClosed(closed) => info!(
                subscription = %closed.subscription_name,
                receiver_id = %closed.receiver_id,
                outstanding = closed.outstanding,
                "phased-out receiver closed"
            ),
        }
    }
}

/// Event handler that forwards events to multiple subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn ReaderEventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber to receive Reader events.
    pub fn add_subscriber(&mut self, handler: Arc<dyn ReaderEventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl ReaderEventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: ReaderEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
