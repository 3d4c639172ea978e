//! Shared in-flight state and the completion path.
//!
//! [`Reader`] owns everything both the pump and out-of-band completions
//! touch: the handler slot pool, the in-flight ledger, the receiver registry
//! and the statistics. The pump holds it behind an `Arc`; delivery gets a
//! [`MessageCompleter`] pointing at the same instance.

use std::sync::Arc;

use hookline_core::{
    Clock, CorrelationId, InitData, MessageEnvelope, ReaderEventHandler, SlotId,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    broker::BrokerMessage,
    config::ReaderConfig,
    error::Result,
    heartbeat::ReaderStats,
    ledger::{InFlightLedger, MessageHandle},
    receiver::{ReceiverRegistry, ReceiverWrapper},
    slots::HandlerSlotPool,
};

/// How a completed message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Delivered and acknowledged on the broker.
    Acknowledged,
    /// Not delivered; left for redelivery after its lock expires.
    Abandoned,
    /// The owning receiver was already closed; the broker redelivers.
    ReceiverUnavailable,
    /// Delivered, but the broker acknowledgement failed.
    AcknowledgeFailed,
}

impl CompletionOutcome {
    /// Whether the broker acknowledged the message.
    pub fn is_acknowledged(self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}

/// Point-in-time view of a Reader for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSnapshot {
    /// Messages currently in flight.
    pub in_flight: usize,
    /// Highest slot id minted, zero before first use.
    pub handler_high_water: u32,
    /// Slots currently leased.
    pub leased_slots: usize,
    /// Receivers open, active and phased-out.
    pub open_receivers: usize,
    /// Completions for unknown correlation ids.
    pub ledger_misses: u64,
    /// Completions whose receiver was already closed.
    pub receivers_unavailable: u64,
    /// Failed broker acknowledgements.
    pub acknowledge_failures: u64,
    /// Envelopes refused by the dispatcher.
    pub dispatch_failures: u64,
    /// Receiver rollovers.
    pub rollovers: u64,
    /// Receiver creation retries.
    pub reconnect_attempts: u64,
}

/// State shared between the pump and completion callers.
#[derive(Debug)]
pub struct Reader {
    init: InitData,
    service_name: String,
    config: ReaderConfig,
    slots: HandlerSlotPool,
    ledger: InFlightLedger,
    registry: Arc<ReceiverRegistry>,
    stats: ReaderStats,
    events: Arc<dyn ReaderEventHandler>,
    clock: Arc<dyn Clock>,
}

impl Reader {
    /// Creates a Reader for validated init data.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::InvalidInitData` if the init data is incomplete
    /// and `ReaderError::Configuration` if the configuration is unusable.
    pub fn new(
        init: InitData,
        config: ReaderConfig,
        events: Arc<dyn ReaderEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        init.validate()?;
        config.validate()?;

        Ok(Self {
            service_name: init.service_identity(),
            slots: HandlerSlotPool::new(config.initial_handler_slots, config.max_handler_slots),
            ledger: InFlightLedger::new(),
            registry: Arc::new(ReceiverRegistry::new()),
            stats: ReaderStats::new(),
            init,
            config,
            events,
            clock,
        })
    }

    /// Decodes an init payload and creates a Reader from it.
    ///
    /// # Errors
    ///
    /// Fails fast with `ReaderError::InvalidInitData` on a malformed payload.
    pub fn from_payload(
        payload: &[u8],
        config: ReaderConfig,
        events: Arc<dyn ReaderEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let init = InitData::from_bytes(payload)?;
        Self::new(init, config, events, clock)
    }

    /// Startup data.
    pub fn init(&self) -> &InitData {
        &self.init
    }

    /// Owning-service identity stamped on envelopes.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Tuning configuration.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Handler slot pool.
    pub fn slots(&self) -> &HandlerSlotPool {
        &self.slots
    }

    /// In-flight ledger.
    pub fn ledger(&self) -> &InFlightLedger {
        &self.ledger
    }

    /// Open receivers by identity.
    pub fn registry(&self) -> &Arc<ReceiverRegistry> {
        &self.registry
    }

    /// Counters.
    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Telemetry sink.
    pub fn events(&self) -> &Arc<dyn ReaderEventHandler> {
        &self.events
    }

    /// Time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Builds the envelope handed to delivery for one received message.
    pub fn envelope(
        &self,
        message: &BrokerMessage,
        correlation_id: CorrelationId,
        handler_id: SlotId,
    ) -> MessageEnvelope {
        MessageEnvelope {
            payload: message.body.clone(),
            event_type: self.init.event_type.clone(),
            subscriber_name: self.init.subscriber_name.clone(),
            service_name: self.service_name.clone(),
            correlation_id,
            handler_id,
            message_id: message.message_id.clone(),
            delivery_count: message.delivery_count,
            subscriber_config: self.init.subscriber_config.clone(),
        }
    }

    /// Settles a message delivery handed out by the pump.
    ///
    /// Removes the message from the ledger, acknowledges it on its owning
    /// receiver when `delivered` is true, and releases its handler slot.
    /// A message that is not acknowledged is redelivered by the broker after
    /// its lock expires.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::LockTokenNotFound` if the message is not in
    /// flight, for example because it was already completed. Nothing is
    /// released in that case.
    pub async fn complete_message(
        &self,
        envelope: &MessageEnvelope,
        delivered: bool,
    ) -> Result<CompletionOutcome> {
        let handle = match self.ledger.try_remove(envelope.correlation_id) {
            Ok(handle) => handle,
            Err(error) => {
                self.stats.record_ledger_miss();
                warn!(
                    correlation_id = %envelope.correlation_id,
                    message_id = %envelope.message_id,
                    error = %error,
                    "completion for message that is not in flight"
                );
                return Err(error);
            },
        };

        let wrapper = self.registry.get(handle.receiver_id);
        let settlement = Settlement {
            slots: &self.slots,
            slot: handle.slot,
            wrapper: wrapper.clone(),
        };

        let outcome = match wrapper {
            Some(wrapper) => self.settle(envelope, &handle, &wrapper, delivered).await,
            None => {
                self.stats.record_receiver_unavailable();
                warn!(
                    correlation_id = %envelope.correlation_id,
                    receiver_id = %handle.receiver_id,
                    "owning receiver already closed, message will be redelivered"
                );
                CompletionOutcome::ReceiverUnavailable
            },
        };

        if handle.slot != envelope.handler_id {
            warn!(
                correlation_id = %envelope.correlation_id,
                tracked_slot = %handle.slot,
                envelope_slot = %envelope.handler_id,
                "envelope handler id differs from tracked slot"
            );
        }
        self.stats.record_completion(outcome.is_acknowledged());
        drop(settlement);

        Ok(outcome)
    }

    async fn settle(
        &self,
        envelope: &MessageEnvelope,
        handle: &MessageHandle,
        wrapper: &ReceiverWrapper,
        delivered: bool,
    ) -> CompletionOutcome {
        if !delivered {
            debug!(
                correlation_id = %envelope.correlation_id,
                message_id = %envelope.message_id,
                "delivery not confirmed, leaving message for redelivery"
            );
            return CompletionOutcome::Abandoned;
        }

        match wrapper.receiver().complete(handle.lock_token).await {
            Ok(()) => {
                debug!(
                    correlation_id = %envelope.correlation_id,
                    receiver_id = %handle.receiver_id,
                    slot = %handle.slot,
                    "message acknowledged"
                );
                CompletionOutcome::Acknowledged
            },
            Err(error) => {
                self.stats.record_acknowledge_failure();
                warn!(
                    correlation_id = %envelope.correlation_id,
                    receiver_id = %handle.receiver_id,
                    error = %error,
                    error_kind = %error.kind(),
                    "failed to acknowledge message"
                );
                CompletionOutcome::AcknowledgeFailed
            },
        }
    }

    /// Captures the current counters.
    pub fn snapshot(&self) -> ReaderSnapshot {
        ReaderSnapshot {
            in_flight: self.ledger.len(),
            handler_high_water: self.slots.reported_high_water(),
            leased_slots: self.slots.leased(),
            open_receivers: self.registry.len(),
            ledger_misses: self.stats.ledger_misses(),
            receivers_unavailable: self.stats.receivers_unavailable(),
            acknowledge_failures: self.stats.acknowledge_failures(),
            dispatch_failures: self.stats.dispatch_failures(),
            rollovers: self.stats.rollovers(),
            reconnect_attempts: self.stats.reconnect_attempts(),
        }
    }
}

/// Resources a removed ledger entry still holds.
///
/// Dropping it decrements the owning wrapper's received-count and returns
/// the slot to the pool, so both happen once the acknowledgement is
/// finished, or when a completion future is dropped midway.
struct Settlement<'a> {
    slots: &'a HandlerSlotPool,
    slot: SlotId,
    wrapper: Option<Arc<ReceiverWrapper>>,
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if let Some(wrapper) = self.wrapper.take() {
            wrapper.record_completed();
        }
        self.slots.release(self.slot);
    }
}

/// Completion callback handed to delivery with every envelope.
#[derive(Debug, Clone)]
pub struct MessageCompleter {
    reader: Arc<Reader>,
}

impl MessageCompleter {
    /// Creates a completer for `reader`.
    pub fn new(reader: Arc<Reader>) -> Self {
        Self { reader }
    }

    /// Reports that delivery of `envelope` finished.
    ///
    /// # Errors
    ///
    /// See [`Reader::complete_message`].
    pub async fn complete_message(
        &self,
        envelope: &MessageEnvelope,
        delivered: bool,
    ) -> Result<CompletionOutcome> {
        self.reader.complete_message(envelope, delivered).await
    }
}
