//! Shared fixtures for Reader integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use hookline_core::{
    InitData, ReaderEvent, ReaderEventHandler, RolloverReason, SubscriberConfig, TestClock,
};
use hookline_reader::{
    broker::mock::MockBroker, dispatch::mock::RecordingDispatcher, Reader, ReaderConfig,
    ReaderPump,
};
use tokio_util::sync::CancellationToken;

/// Captures every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<ReaderEvent>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<ReaderEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn rollovers(&self) -> Vec<RolloverReason> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                ReaderEvent::RolledOver(rollover) => Some(rollover.reason),
                _ => None,
            })
            .collect()
    }

    pub fn reconnection_attempts(&self) -> Vec<u32> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                ReaderEvent::ReconnectionAttempt(attempt) => Some(attempt.attempt),
                _ => None,
            })
            .collect()
    }

    pub fn closed_receivers(&self) -> usize {
        self.all().iter().filter(|event| matches!(event, ReaderEvent::ReceiverClosed(_))).count()
    }
}

#[async_trait::async_trait]
impl ReaderEventHandler for RecordingEvents {
    async fn handle_event(&self, event: ReaderEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

pub fn init_data() -> InitData {
    InitData::new(
        "billing-sub",
        SubscriberConfig::new(
            "billing",
            "order.created",
            Some("https://billing.example.com/hook".to_string()),
        ),
    )
}

/// A pump wired to in-memory collaborators and a manual clock.
pub struct Harness {
    pub clock: TestClock,
    pub broker: MockBroker,
    pub dispatcher: RecordingDispatcher,
    pub events: Arc<RecordingEvents>,
    pub pump: ReaderPump,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ReaderConfig::default())
    }

    pub fn with_config(config: ReaderConfig) -> Self {
        Self::with_init(init_data(), config)
    }

    pub fn with_init(init: InitData, config: ReaderConfig) -> Self {
        let clock = TestClock::new();
        let broker = MockBroker::new();
        let dispatcher = RecordingDispatcher::new();
        let events = Arc::new(RecordingEvents::default());

        let reader = Arc::new(
            Reader::new(init, config, events.clone(), Arc::new(clock.clone()))
                .expect("valid reader"),
        );
        let pump =
            ReaderPump::new(reader, Arc::new(broker.clone()), Arc::new(dispatcher.clone()));

        Self { clock, broker, dispatcher, events, pump, cancel: CancellationToken::new() }
    }

    pub fn reader(&self) -> &Arc<Reader> {
        self.pump.reader()
    }

    pub async fn poll(&mut self) -> usize {
        self.pump.poll_once(&self.cancel).await.expect("poll succeeds")
    }

    pub fn active_received_count(&self) -> u64 {
        self.pump.lifecycle().active().map(|wrapper| wrapper.received_count()).unwrap_or_default()
    }
}
