//! Broker abstraction consumed by the Reader.
//!
//! The pump only needs to create a subscription, open receivers on it,
//! receive batches and acknowledge messages by lock token. Production uses
//! the PostgreSQL adapter in [`crate::postgres`]; tests use the in-memory
//! [`mock::MockBroker`].

use std::{fmt::Debug, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookline_core::{InitData, LockToken};

use crate::error::Result;

/// A message received under a broker lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned message identifier.
    pub message_id: String,
    /// Raw payload.
    pub body: Bytes,
    /// Lock token issued for this receive.
    pub lock_token: LockToken,
    /// Number of times the broker has delivered this message, including
    /// this one.
    pub delivery_count: u32,
    /// When the message entered the subscription.
    pub enqueued_at: DateTime<Utc>,
}

impl BrokerMessage {
    /// Returns the token that acknowledges this receive.
    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }
}

/// Addressing for a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSpec {
    /// Topic name.
    pub event_type: String,
    /// Subscription name within the topic.
    pub subscription_name: String,
    /// Read the subscription's dead-letter queue instead of its main queue.
    pub dead_letter: bool,
}

impl From<&InitData> for ReceiverSpec {
    fn from(init: &InitData) -> Self {
        Self {
            event_type: init.event_type.clone(),
            subscription_name: init.subscription_name.clone(),
            dead_letter: init.dead_letter,
        }
    }
}

/// One open receiver on a subscription.
#[async_trait::async_trait]
pub trait BrokerReceiver: Send + Sync + Debug {
    /// Receives up to `max_messages`, waiting at most `timeout` for the
    /// first one. An empty batch is a normal outcome.
    async fn receive_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>>;

    /// Acknowledges a message so the broker never redelivers it.
    async fn complete(&self, lock_token: LockToken) -> Result<()>;

    /// Closes the receiver. Unacknowledged locks expire on their own.
    async fn close(&self) -> Result<()>;
}

/// Broker connection able to provision subscriptions and open receivers.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Idempotently creates the topic and the subscription on it.
    async fn create_topic_and_subscription(
        &self,
        event_type: &str,
        subscription_name: &str,
        max_delivery_count: u32,
    ) -> Result<()>;

    /// Opens a new receiver.
    async fn create_receiver(&self, spec: &ReceiverSpec) -> Result<Arc<dyn BrokerReceiver>>;
}

pub mod mock {
    //! In-memory broker for testing the Reader without infrastructure.
    //!
    //! Holds a single subscription queue shared by every receiver it opens.
    //! Supports injecting failures into receiver creation and receives, and
    //! records completions and closures for verification.

    use std::{
        collections::{HashMap, HashSet, VecDeque},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use bytes::Bytes;
    use chrono::Utc;
    use hookline_core::LockToken;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::{Broker, BrokerMessage, BrokerReceiver, ReceiverSpec};
    use crate::error::{ReaderError, Result};

    #[derive(Debug, Default)]
    struct MockState {
        subscriptions: HashSet<(String, String)>,
        queue: VecDeque<BrokerMessage>,
        locked: HashMap<LockToken, BrokerMessage>,
        completed: Vec<LockToken>,
        create_errors: VecDeque<ReaderError>,
        receive_errors: VecDeque<ReaderError>,
        receivers_created: usize,
        receivers_closed: usize,
    }

    /// Mock broker with configurable failures.
    #[derive(Debug, Clone, Default)]
    pub struct MockBroker {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBroker {
        /// Creates a broker with an empty subscription.
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueues a message and returns its message id.
        pub async fn push_message(&self, body: impl Into<Bytes>) -> String {
            let message_id = Uuid::new_v4().to_string();
            self.state.lock().await.queue.push_back(BrokerMessage {
                message_id: message_id.clone(),
                body: body.into(),
                lock_token: LockToken::new(),
                delivery_count: 0,
                enqueued_at: Utc::now(),
            });
            message_id
        }

        /// Enqueues `count` messages with numbered JSON bodies.
        pub async fn push_messages(&self, count: usize) -> Vec<String> {
            let mut ids = Vec::with_capacity(count);
            for sequence in 0..count {
                ids.push(self.push_message(format!(r#"{{"sequence":{sequence}}}"#)).await);
            }
            ids
        }

        /// Makes the next receiver creation fail with `error`.
        pub async fn inject_create_error(&self, error: ReaderError) {
            self.state.lock().await.create_errors.push_back(error);
        }

        /// Makes the next receive (on any receiver) fail with `error`.
        pub async fn inject_receive_error(&self, error: ReaderError) {
            self.state.lock().await.receive_errors.push_back(error);
        }

        /// Returns a copy of every lock token completed so far.
        pub async fn completed(&self) -> Vec<LockToken> {
            self.state.lock().await.completed.clone()
        }

        /// Number of receivers opened.
        pub async fn receivers_created(&self) -> usize {
            self.state.lock().await.receivers_created
        }

        /// Number of receivers closed.
        pub async fn receivers_closed(&self) -> usize {
            self.state.lock().await.receivers_closed
        }

        /// Messages waiting to be received.
        pub async fn pending(&self) -> usize {
            self.state.lock().await.queue.len()
        }

        /// Messages received but neither completed nor expired.
        pub async fn locked(&self) -> usize {
            self.state.lock().await.locked.len()
        }

        /// Whether a subscription was provisioned.
        pub async fn has_subscription(&self, event_type: &str, subscription_name: &str) -> bool {
            self.state
                .lock()
                .await
                .subscriptions
                .contains(&(event_type.to_string(), subscription_name.to_string()))
        }

        /// Expires every held lock, returning the messages to the queue for
        /// redelivery.
        pub async fn expire_locks(&self) {
            let mut state = self.state.lock().await;
            let expired: Vec<_> = state.locked.drain().map(|(_, message)| message).collect();
            state.queue.extend(expired);
        }
    }

    #[async_trait::async_trait]
    impl Broker for MockBroker {
        async fn create_topic_and_subscription(
            &self,
            event_type: &str,
            subscription_name: &str,
            _max_delivery_count: u32,
        ) -> Result<()> {
            self.state
                .lock()
                .await
                .subscriptions
                .insert((event_type.to_string(), subscription_name.to_string()));
            Ok(())
        }

        async fn create_receiver(&self, _spec: &ReceiverSpec) -> Result<Arc<dyn BrokerReceiver>> {
            let mut state = self.state.lock().await;
            if let Some(error) = state.create_errors.pop_front() {
                return Err(error);
            }
            state.receivers_created += 1;
            drop(state);

            Ok(Arc::new(MockReceiver { state: self.state.clone(), closed: AtomicBool::new(false) }))
        }
    }

    /// Receiver handed out by [`MockBroker`].
    #[derive(Debug)]
    pub struct MockReceiver {
        state: Arc<Mutex<MockState>>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BrokerReceiver for MockReceiver {
        async fn receive_batch(
            &self,
            max_messages: usize,
            _timeout: Duration,
        ) -> Result<Vec<BrokerMessage>> {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReaderError::broker("receiver is closed"));
            }

            let mut state = self.state.lock().await;
            if let Some(error) = state.receive_errors.pop_front() {
                return Err(error);
            }

            let take = max_messages.min(state.queue.len());
            let drained: Vec<_> = state.queue.drain(..take).collect();
            let mut batch = Vec::with_capacity(take);
            for mut message in drained {
                message.lock_token = LockToken::new();
                message.delivery_count += 1;
                state.locked.insert(message.lock_token, message.clone());
                batch.push(message);
            }
            Ok(batch)
        }

        async fn complete(&self, lock_token: LockToken) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReaderError::broker("receiver is closed"));
            }

            let mut state = self.state.lock().await;
            if state.locked.remove(&lock_token).is_none() {
                return Err(ReaderError::LockLost { lock_token });
            }
            state.completed.push(lock_token);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.state.lock().await.receivers_closed += 1;
            }
            Ok(())
        }
    }
}
