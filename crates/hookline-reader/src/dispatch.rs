//! Hand-off from the pump to delivery.
//!
//! Dispatch is keyed by the envelope's handler id: whichever delivery
//! component sits behind [`DeliveryDispatcher`] routes the envelope to the
//! handler owning that slot. The pump awaits only acceptance of the
//! envelope; delivery reports back later through the [`MessageCompleter`].

use std::fmt::Debug;

use hookline_core::MessageEnvelope;

use crate::{error::Result, reader::MessageCompleter};

/// Delivery component the pump hands envelopes to.
#[async_trait::async_trait]
pub trait DeliveryDispatcher: Send + Sync + Debug {
    /// Accepts an envelope for delivery.
    ///
    /// Must return once the envelope is accepted, not once it is delivered.
    /// The implementation calls `completer.complete_message` exactly once
    /// when it is finished with the message.
    async fn dispatch(&self, envelope: MessageEnvelope, completer: MessageCompleter) -> Result<()>;
}

pub mod mock {
    //! Dispatcher that records envelopes for tests to complete by hand.

    use std::{collections::VecDeque, sync::Arc};

    use hookline_core::{MessageEnvelope, SlotId};
    use tokio::sync::Mutex;

    use super::DeliveryDispatcher;
    use crate::{
        error::{ReaderError, Result},
        reader::{CompletionOutcome, MessageCompleter},
    };

    /// An accepted envelope with the completer it arrived with.
    #[derive(Debug, Clone)]
    pub struct DispatchedMessage {
        /// The envelope.
        pub envelope: MessageEnvelope,
        /// Completion callback for it.
        pub completer: MessageCompleter,
    }

    impl DispatchedMessage {
        /// Completes this message.
        pub async fn complete(&self, delivered: bool) -> Result<CompletionOutcome> {
            self.completer.complete_message(&self.envelope, delivered).await
        }
    }

    #[derive(Debug, Default)]
    struct RecorderState {
        pending: VecDeque<DispatchedMessage>,
        dispatched_total: usize,
        failures: VecDeque<ReaderError>,
    }

    /// Records every accepted envelope.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDispatcher {
        state: Arc<Mutex<RecorderState>>,
    }

    impl RecordingDispatcher {
        /// Creates an empty recorder.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next dispatch fail with `error`.
        pub async fn inject_failure(&self, error: ReaderError) {
            self.state.lock().await.failures.push_back(error);
        }

        /// Envelopes accepted and not yet taken, oldest first.
        pub async fn pending(&self) -> Vec<MessageEnvelope> {
            self.state.lock().await.pending.iter().map(|m| m.envelope.clone()).collect()
        }

        /// Handler ids of pending envelopes, oldest first.
        pub async fn pending_slots(&self) -> Vec<SlotId> {
            self.state.lock().await.pending.iter().map(|m| m.envelope.handler_id).collect()
        }

        /// Total envelopes accepted.
        pub async fn dispatched_total(&self) -> usize {
            self.state.lock().await.dispatched_total
        }

        /// Removes and returns the oldest pending message.
        pub async fn take_next(&self) -> Option<DispatchedMessage> {
            self.state.lock().await.pending.pop_front()
        }

        /// Removes and returns every pending message.
        pub async fn take_all(&self) -> Vec<DispatchedMessage> {
            self.state.lock().await.pending.drain(..).collect()
        }

        /// Completes every pending message with the same outcome.
        pub async fn complete_all(&self, delivered: bool) -> Vec<Result<CompletionOutcome>> {
            let taken = self.take_all().await;
            let mut outcomes = Vec::with_capacity(taken.len());
            for message in taken {
                outcomes.push(message.complete(delivered).await);
            }
            outcomes
        }
    }

    #[async_trait::async_trait]
    impl DeliveryDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            envelope: MessageEnvelope,
            completer: MessageCompleter,
        ) -> Result<()> {
            let mut state = self.state.lock().await;
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.dispatched_total += 1;
            state.pending.push_back(DispatchedMessage { envelope, completer });
            Ok(())
        }
    }
}
