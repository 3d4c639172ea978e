//! The Reader's main loop.
//!
//! Each iteration receives one batch from the active receiver, updates the
//! receiver lifecycle, rolls over or closes receivers as needed, then slots,
//! tracks and dispatches every received message. Transport failures rebuild
//! the active receiver through the reconnection policy; any other failure is
//! logged and the loop moves on to its next poll.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use hookline_core::{CorrelationId, RolloverReason};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{Broker, BrokerMessage, BrokerReceiver, ReceiverSpec},
    dispatch::DeliveryDispatcher,
    error::{ReaderError, Result},
    ledger::MessageHandle,
    reader::{MessageCompleter, Reader},
    receiver::{ReceiverLifecycle, ReceiverWrapper},
    reconnect::ReconnectionPolicy,
};

/// Drives one subscription until cancelled.
#[derive(Debug)]
pub struct ReaderPump {
    reader: Arc<Reader>,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<dyn DeliveryDispatcher>,
    lifecycle: ReceiverLifecycle,
    policy: ReconnectionPolicy,
    spec: ReceiverSpec,
    provisioned: bool,
}

impl ReaderPump {
    /// Creates a pump; no broker call is made until the first poll.
    pub fn new(
        reader: Arc<Reader>,
        broker: Arc<dyn Broker>,
        dispatcher: Arc<dyn DeliveryDispatcher>,
    ) -> Self {
        let init = reader.init();
        let config = reader.config();

        let lifecycle = ReceiverLifecycle::new(
            init.subscription_name.clone(),
            reader.registry().clone(),
            config.inactivity_threshold,
            config.phase_out_grace,
            reader.clock().clone(),
            reader.events().clone(),
        );
        let policy = ReconnectionPolicy::new(
            config.reconnect.clone(),
            init.subscription_name.clone(),
            init.event_type.clone(),
            reader.clock().clone(),
            reader.events().clone(),
        );
        let spec = ReceiverSpec::from(init);

        Self { reader, broker, dispatcher, lifecycle, policy, spec, provisioned: false }
    }

    /// Shared Reader state.
    pub fn reader(&self) -> &Arc<Reader> {
        &self.reader
    }

    /// Receiver lifecycle state.
    pub fn lifecycle(&self) -> &ReceiverLifecycle {
        &self.lifecycle
    }

    /// Completion callback bound to this pump's Reader.
    pub fn completer(&self) -> MessageCompleter {
        MessageCompleter::new(self.reader.clone())
    }

    /// Provisions the subscription and opens the first receiver.
    ///
    /// Both steps retry transport failures forever.
    ///
    /// # Errors
    ///
    /// Returns the first non-transport broker error, or
    /// `ReaderError::Cancelled`.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.provisioned {
            let init = self.reader.init();
            self.policy
                .run(cancel, || {
                    self.broker.create_topic_and_subscription(
                        &init.event_type,
                        &init.subscription_name,
                        init.max_delivery_count,
                    )
                })
                .await?;
            self.provisioned = true;
        }

        if self.lifecycle.active().is_none() {
            let receiver = self.connect(cancel).await?;
            let wrapper = self.lifecycle.activate(receiver, None).await;
            info!(
                subscription = %self.spec.subscription_name,
                event_type = %self.spec.event_type,
                dead_letter = self.spec.dead_letter,
                receiver_id = %wrapper.id(),
                "reader connected"
            );
        }

        Ok(())
    }

    /// Runs the receive loop until `cancel` fires.
    ///
    /// Messages still in flight on exit stay in the ledger; the broker
    /// redelivers them once their locks expire.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(subscription = %self.spec.subscription_name, "reader pump started");

        while !cancel.is_cancelled() {
            match self.poll_once(&cancel).await {
                Ok(_) => {},
                Err(ReaderError::Cancelled) => break,
                Err(failure) if failure.is_transport() => {
                    warn!(
                        subscription = %self.spec.subscription_name,
                        error = %failure,
                        "receiver transport failure, reconnecting"
                    );
                    match self.reconnect(&cancel).await {
                        Ok(()) => {},
                        Err(ReaderError::Cancelled) => break,
                        Err(reconnect_error) => {
                            error!(
                                subscription = %self.spec.subscription_name,
                                error = %reconnect_error,
                                error_kind = %reconnect_error.kind(),
                                "reconnection failed"
                            );
                            self.pause(&cancel).await;
                        },
                    }
                },
                Err(failure) => {
                    error!(
                        subscription = %self.spec.subscription_name,
                        error = %failure,
                        error_kind = %failure.kind(),
                        "reader iteration failed"
                    );
                    self.pause(&cancel).await;
                },
            }
        }

        info!(
            subscription = %self.spec.subscription_name,
            in_flight = self.reader.ledger().len(),
            "reader pump stopped"
        );
    }

    /// Runs a single loop iteration and returns how many messages were
    /// handed to delivery.
    ///
    /// # Errors
    ///
    /// Returns receive and reconnection failures to the caller; `run`
    /// decides whether to reconnect or move on.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        if self.lifecycle.active().is_none() {
            self.start(cancel).await?;
        }
        let wrapper = self
            .lifecycle
            .active()
            .cloned()
            .ok_or_else(|| ReaderError::internal("no active receiver after start"))?;

        let batch_size = self.reader.config().batch_size;
        let receive_timeout = self.reader.config().receive_timeout;

        let batch = tokio::select! {
            result = wrapper.receiver().receive_batch(batch_size, receive_timeout) => result?,
            () = cancel.cancelled() => return Err(ReaderError::Cancelled),
        };

        let received = batch.len();
        self.lifecycle.record_poll(received);
        self.reader.stats().record_read(received);

        if self.lifecycle.rollover_due() {
            self.roll_over(cancel, RolloverReason::Inactivity).await?;
        }
        self.lifecycle.close_drained().await;

        if batch.is_empty() {
            return Ok(0);
        }

        debug!(
            subscription = %self.spec.subscription_name,
            receiver_id = %wrapper.id(),
            count = received,
            "received batch"
        );

        for message in batch {
            self.hand_off(&wrapper, message, cancel).await?;
        }
        Ok(received)
    }

    /// Replaces a failed active receiver.
    ///
    /// The failed wrapper is phased out so messages it already handed out
    /// can still complete against it.
    ///
    /// # Errors
    ///
    /// Returns a non-transport creation error or `ReaderError::Cancelled`.
    pub async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.phase_out_active();
        self.roll_over(cancel, RolloverReason::TransportFailure).await
    }

    /// Closes every receiver. Called once the loop has stopped.
    pub async fn shutdown(&mut self) {
        self.lifecycle.close_all().await;
        info!(
            subscription = %self.spec.subscription_name,
            abandoned_in_flight = self.reader.ledger().len(),
            "receivers closed"
        );
    }

    async fn roll_over(&mut self, cancel: &CancellationToken, reason: RolloverReason) -> Result<()> {
        let receiver = self.connect(cancel).await?;
        self.lifecycle.activate(receiver, Some(reason)).await;
        self.reader.stats().record_rollover();
        Ok(())
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerReceiver>> {
        let calls = AtomicU32::new(0);
        self.policy
            .run(cancel, || {
                if calls.fetch_add(1, Ordering::Relaxed) > 0 {
                    self.reader.stats().record_reconnect_attempt();
                }
                self.broker.create_receiver(&self.spec)
            })
            .await
    }

    async fn hand_off(
        &self,
        wrapper: &Arc<ReceiverWrapper>,
        message: BrokerMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let slot = self.reader.slots().acquire(cancel).await?;
        let correlation_id = CorrelationId::new();
        let handle = MessageHandle { lock_token: message.lock_token(), receiver_id: wrapper.id(), slot };

        if let Err(failure) = self.reader.ledger().track(correlation_id, handle) {
            self.reader.slots().release(slot);
            warn!(
                correlation_id = %correlation_id,
                message_id = %message.message_id,
                error = %failure,
                "could not track message, leaving it for redelivery"
            );
            return Ok(());
        }
        wrapper.record_received();

        let envelope = self.reader.envelope(&message, correlation_id, slot);
        debug!(
            correlation_id = %correlation_id,
            message_id = %message.message_id,
            slot = %slot,
            delivery_count = message.delivery_count,
            "dispatching message"
        );

        let dispatched = tokio::select! {
            result = self.dispatcher.dispatch(envelope.clone(), self.completer()) => result,
            () = cancel.cancelled() => Err(ReaderError::Cancelled),
        };

        match dispatched {
            Ok(()) => Ok(()),
            Err(ReaderError::Cancelled) => Err(ReaderError::Cancelled),
            Err(failure) => {
                self.reader.stats().record_dispatch_failure();
                warn!(
                    correlation_id = %correlation_id,
                    message_id = %message.message_id,
                    error = %failure,
                    "dispatch refused, abandoning message"
                );
                if let Err(abandon_error) = self.reader.complete_message(&envelope, false).await {
                    warn!(
                        correlation_id = %correlation_id,
                        error = %abandon_error,
                        "failed to abandon refused message"
                    );
                }
                Ok(())
            },
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        let delay = self.reader.config().receive_timeout;
        tokio::select! {
            () = self.reader.clock().sleep(delay) => {},
            () = cancel.cancelled() => {},
        }
    }
}
