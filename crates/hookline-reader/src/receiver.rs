//! Receiver wrappers and the rollover state machine.
//!
//! Each broker receiver the pump opens is wrapped with an identity and an
//! atomic received-count. Wrappers move through `Active -> PhasedOut ->
//! Closed`:
//!
//! - exactly one wrapper is active and is the only one the pump receives
//!   from;
//! - a rollover (inactivity or transport failure) demotes the active wrapper
//!   to phased-out with a force-closure deadline of `now + grace`;
//! - a phased-out wrapper is closed once its received-count drains to zero
//!   or its deadline passes, whichever comes first.
//!
//! Completions look wrappers up by identity in the [`ReceiverRegistry`], so
//! a message received on a phased-out wrapper still acknowledges against the
//! receiver that issued its lock token.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hookline_core::{
    Clock, ReaderEvent, ReaderEventHandler, ReceiverClosedEvent, ReceiverId, RolloverEvent,
    RolloverReason,
};
use tracing::{debug, info, warn};

use crate::broker::BrokerReceiver;

/// A broker receiver plus the bookkeeping shared with completions.
#[derive(Debug)]
pub struct ReceiverWrapper {
    id: ReceiverId,
    receiver: Arc<dyn BrokerReceiver>,
    received: AtomicU64,
}

impl ReceiverWrapper {
    /// Wraps a freshly opened receiver under a new identity.
    pub fn new(receiver: Arc<dyn BrokerReceiver>) -> Self {
        Self { id: ReceiverId::new(), receiver, received: AtomicU64::new(0) }
    }

    /// Identity stored in every message handle this wrapper produces.
    pub fn id(&self) -> ReceiverId {
        self.id
    }

    /// Underlying broker receiver.
    pub fn receiver(&self) -> &Arc<dyn BrokerReceiver> {
        &self.receiver
    }

    /// Messages handed out by this wrapper that have not completed yet.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Counts one message handed out.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    /// Counts one message completed. Never underflows; returns `false` if
    /// the count was already zero.
    pub fn record_completed(&self) -> bool {
        self.received
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok()
    }
}

/// Concurrent lookup of open wrappers by identity.
///
/// Written only by the pump; read by completions from any context.
#[derive(Debug, Default)]
pub struct ReceiverRegistry {
    wrappers: DashMap<ReceiverId, Arc<ReceiverWrapper>>,
}

impl ReceiverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open wrapper.
    pub fn insert(&self, wrapper: Arc<ReceiverWrapper>) {
        self.wrappers.insert(wrapper.id(), wrapper);
    }

    /// Looks up an open wrapper.
    pub fn get(&self, receiver_id: ReceiverId) -> Option<Arc<ReceiverWrapper>> {
        self.wrappers.get(&receiver_id).map(|entry| entry.value().clone())
    }

    /// Unregisters a wrapper, typically right before closing it.
    pub fn remove(&self, receiver_id: ReceiverId) -> Option<Arc<ReceiverWrapper>> {
        self.wrappers.remove(&receiver_id).map(|(_, wrapper)| wrapper)
    }

    /// Number of open wrappers, active and phased-out.
    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    /// Whether no wrapper is open.
    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }
}

#[derive(Debug)]
struct ActiveReceiver {
    wrapper: Arc<ReceiverWrapper>,
    first_empty_poll: Option<Instant>,
}

#[derive(Debug)]
struct PhasedOutReceiver {
    wrapper: Arc<ReceiverWrapper>,
    force_close_at: Instant,
}

/// Pump-owned state machine over the active and phased-out wrappers.
#[derive(Debug)]
pub struct ReceiverLifecycle {
    subscription_name: String,
    active: Option<ActiveReceiver>,
    phased_out: Vec<PhasedOutReceiver>,
    retired: Option<ReceiverId>,
    registry: Arc<ReceiverRegistry>,
    inactivity_threshold: Duration,
    phase_out_grace: Duration,
    clock: Arc<dyn Clock>,
    events: Arc<dyn ReaderEventHandler>,
}

impl ReceiverLifecycle {
    /// Creates a lifecycle with no receiver yet.
    pub fn new(
        subscription_name: impl Into<String>,
        registry: Arc<ReceiverRegistry>,
        inactivity_threshold: Duration,
        phase_out_grace: Duration,
        clock: Arc<dyn Clock>,
        events: Arc<dyn ReaderEventHandler>,
    ) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            active: None,
            phased_out: Vec::new(),
            retired: None,
            registry,
            inactivity_threshold,
            phase_out_grace,
            clock,
            events,
        }
    }

    /// The wrapper the pump receives from.
    pub fn active(&self) -> Option<&Arc<ReceiverWrapper>> {
        self.active.as_ref().map(|active| &active.wrapper)
    }

    /// When the active wrapper started its current run of empty polls.
    pub fn first_empty_poll(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|active| active.first_empty_poll)
    }

    /// Number of wrappers draining after a rollover.
    pub fn phased_out_count(&self) -> usize {
        self.phased_out.len()
    }

    /// Force-closure deadline of a phased-out wrapper.
    pub fn force_close_deadline(&self, receiver_id: ReceiverId) -> Option<Instant> {
        self.phased_out
            .iter()
            .find(|phased| phased.wrapper.id() == receiver_id)
            .map(|phased| phased.force_close_at)
    }

    /// Installs a new active wrapper around `receiver`.
    ///
    /// Any current active wrapper is phased out first. A `RolledOver` event
    /// is emitted when this replaces an earlier receiver.
    pub async fn activate(
        &mut self,
        receiver: Arc<dyn BrokerReceiver>,
        reason: Option<RolloverReason>,
    ) -> Arc<ReceiverWrapper> {
        self.phase_out_active();
        let previous = self.retired.take();

        let wrapper = Arc::new(ReceiverWrapper::new(receiver));
        self.registry.insert(wrapper.clone());
        self.active = Some(ActiveReceiver { wrapper: wrapper.clone(), first_empty_poll: None });

        match (previous, reason) {
            (Some(previous_receiver), Some(reason)) => {
                info!(
                    subscription = %self.subscription_name,
                    previous_receiver = %previous_receiver,
                    active_receiver = %wrapper.id(),
                    reason = %reason,
                    "receiver rolled over"
                );
                self.events
                    .handle_event(ReaderEvent::RolledOver(RolloverEvent {
                        subscription_name: self.subscription_name.clone(),
                        previous_receiver,
                        active_receiver: wrapper.id(),
                        reason,
                        occurred_at: self.clock.now_utc(),
                    }))
                    .await;
            },
            _ => {
                debug!(
                    subscription = %self.subscription_name,
                    receiver_id = %wrapper.id(),
                    "receiver activated"
                );
            },
        }

        wrapper
    }

    /// Demotes the active wrapper to phased-out without a successor.
    ///
    /// Used when the active receiver failed and reconnection is about to
    /// start; the next `activate` reports the rollover against it.
    pub fn phase_out_active(&mut self) -> Option<ReceiverId> {
        let active = self.active.take()?;
        let receiver_id = active.wrapper.id();
        let force_close_at = self.clock.now() + self.phase_out_grace;

        debug!(
            subscription = %self.subscription_name,
            receiver_id = %receiver_id,
            outstanding = active.wrapper.received_count(),
            "receiver phased out"
        );

        self.phased_out.push(PhasedOutReceiver { wrapper: active.wrapper, force_close_at });
        self.retired = Some(receiver_id);
        Some(receiver_id)
    }

    /// Updates inactivity tracking after a poll of the active wrapper.
    ///
    /// A non-empty batch clears the first-empty-poll timestamp; an empty one
    /// sets it unless already set.
    pub fn record_poll(&mut self, received: usize) {
        let now = self.clock.now();
        if let Some(active) = self.active.as_mut() {
            if received > 0 {
                active.first_empty_poll = None;
            } else if active.first_empty_poll.is_none() {
                active.first_empty_poll = Some(now);
            }
        }
    }

    /// Whether the active wrapper has been empty for longer than the
    /// inactivity threshold.
    pub fn rollover_due(&self) -> bool {
        let now = self.clock.now();
        self.first_empty_poll()
            .is_some_and(|since| now.saturating_duration_since(since) > self.inactivity_threshold)
    }

    /// Closes every phased-out wrapper that has drained or passed its
    /// deadline. Returns how many were closed.
    pub async fn close_drained(&mut self) -> usize {
        let now = self.clock.now();
        let (closable, remaining): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.phased_out).into_iter().partition(|phased| {
                phased.wrapper.received_count() == 0 || now >= phased.force_close_at
            });
        self.phased_out = remaining;

        let closed = closable.len();
        for phased in closable {
            let forced = phased.wrapper.received_count() > 0;
            self.close_wrapper(&phased.wrapper, forced).await;
        }
        closed
    }

    /// Closes every wrapper, active included.
    pub async fn close_all(&mut self) {
        if let Some(active) = self.active.take() {
            self.close_wrapper(&active.wrapper, false).await;
        }
        for phased in std::mem::take(&mut self.phased_out) {
            self.close_wrapper(&phased.wrapper, false).await;
        }
        self.retired = None;
    }

    async fn close_wrapper(&self, wrapper: &Arc<ReceiverWrapper>, forced: bool) {
        let receiver_id = wrapper.id();
        let outstanding = wrapper.received_count();
        self.registry.remove(receiver_id);

        if forced {
            warn!(
                subscription = %self.subscription_name,
                receiver_id = %receiver_id,
                outstanding,
                "force-closing receiver with messages still in flight"
            );
        }

        if let Err(error) = wrapper.receiver().close().await {
            warn!(
                subscription = %self.subscription_name,
                receiver_id = %receiver_id,
                error = %error,
                "failed to close receiver"
            );
        }

        self.events
            .handle_event(ReaderEvent::ReceiverClosed(ReceiverClosedEvent {
                subscription_name: self.subscription_name.clone(),
                receiver_id,
                outstanding,
                closed_at: self.clock.now_utc(),
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{NoOpEventHandler, TestClock};

    use super::*;
    use crate::broker::{mock::MockBroker, Broker, ReceiverSpec};

    const THRESHOLD: Duration = Duration::from_secs(300);
    const GRACE: Duration = Duration::from_secs(120);

    fn spec() -> ReceiverSpec {
        ReceiverSpec {
            event_type: "order.created".to_string(),
            subscription_name: "billing-sub".to_string(),
            dead_letter: false,
        }
    }

    fn lifecycle(clock: &TestClock, registry: Arc<ReceiverRegistry>) -> ReceiverLifecycle {
        ReceiverLifecycle::new(
            "billing-sub",
            registry,
            THRESHOLD,
            GRACE,
            Arc::new(clock.clone()),
            Arc::new(NoOpEventHandler::new()),
        )
    }

    #[tokio::test]
    async fn received_count_never_underflows() {
        let broker = MockBroker::new();
        let wrapper = ReceiverWrapper::new(broker.create_receiver(&spec()).await.expect("receiver"));

        wrapper.record_received();
        assert!(wrapper.record_completed());
        assert!(!wrapper.record_completed());
        assert_eq!(wrapper.received_count(), 0);
    }

    #[tokio::test]
    async fn empty_polls_start_inactivity_window_once() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let mut lifecycle = lifecycle(&clock, Arc::new(ReceiverRegistry::new()));
        lifecycle.activate(broker.create_receiver(&spec()).await.expect("receiver"), None).await;

        lifecycle.record_poll(0);
        let started = lifecycle.first_empty_poll();
        assert!(started.is_some());

        clock.advance(Duration::from_secs(10));
        lifecycle.record_poll(0);
        assert_eq!(lifecycle.first_empty_poll(), started);

        lifecycle.record_poll(1);
        assert_eq!(lifecycle.first_empty_poll(), None);
    }

    #[tokio::test]
    async fn rollover_due_only_after_threshold() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let mut lifecycle = lifecycle(&clock, Arc::new(ReceiverRegistry::new()));
        lifecycle.activate(broker.create_receiver(&spec()).await.expect("receiver"), None).await;

        lifecycle.record_poll(0);
        clock.advance(THRESHOLD);
        assert!(!lifecycle.rollover_due());

        clock.advance(Duration::from_secs(1));
        assert!(lifecycle.rollover_due());
    }

    #[tokio::test]
    async fn activation_demotes_previous_with_deadline() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let registry = Arc::new(ReceiverRegistry::new());
        let mut lifecycle = lifecycle(&clock, registry.clone());

        let first = lifecycle
            .activate(broker.create_receiver(&spec()).await.expect("receiver"), None)
            .await;
        let second = lifecycle
            .activate(
                broker.create_receiver(&spec()).await.expect("receiver"),
                Some(RolloverReason::Inactivity),
            )
            .await;

        assert_eq!(lifecycle.active().map(|w| w.id()), Some(second.id()));
        assert_eq!(lifecycle.phased_out_count(), 1);
        assert_eq!(lifecycle.force_close_deadline(first.id()), Some(clock.now() + GRACE));
        assert!(registry.get(first.id()).is_some());
        assert!(registry.get(second.id()).is_some());
    }

    #[tokio::test]
    async fn phased_out_closes_only_when_drained_or_expired() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let registry = Arc::new(ReceiverRegistry::new());
        let mut lifecycle = lifecycle(&clock, registry.clone());

        let first = lifecycle
            .activate(broker.create_receiver(&spec()).await.expect("receiver"), None)
            .await;
        first.record_received();
        first.record_received();
        lifecycle
            .activate(
                broker.create_receiver(&spec()).await.expect("receiver"),
                Some(RolloverReason::Inactivity),
            )
            .await;

        assert_eq!(lifecycle.close_drained().await, 0);

        first.record_completed();
        assert_eq!(lifecycle.close_drained().await, 0);

        first.record_completed();
        assert_eq!(lifecycle.close_drained().await, 1);
        assert_eq!(lifecycle.phased_out_count(), 0);
        assert!(registry.get(first.id()).is_none());
        assert_eq!(broker.receivers_closed().await, 1);
    }

    #[tokio::test]
    async fn deadline_forces_closure_of_stuck_receiver() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let registry = Arc::new(ReceiverRegistry::new());
        let mut lifecycle = lifecycle(&clock, registry.clone());

        let first = lifecycle
            .activate(broker.create_receiver(&spec()).await.expect("receiver"), None)
            .await;
        first.record_received();
        lifecycle.phase_out_active();

        clock.advance(GRACE - Duration::from_secs(1));
        assert_eq!(lifecycle.close_drained().await, 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(lifecycle.close_drained().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_all_closes_active_and_phased_out() {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let registry = Arc::new(ReceiverRegistry::new());
        let mut lifecycle = lifecycle(&clock, registry.clone());

        let first = lifecycle
            .activate(broker.create_receiver(&spec()).await.expect("receiver"), None)
            .await;
        first.record_received();
        lifecycle
            .activate(
                broker.create_receiver(&spec()).await.expect("receiver"),
                Some(RolloverReason::TransportFailure),
            )
            .await;

        lifecycle.close_all().await;

        assert!(lifecycle.active().is_none());
        assert_eq!(lifecycle.phased_out_count(), 0);
        assert!(registry.is_empty());
        assert_eq!(broker.receivers_closed().await, 2);
    }
}
