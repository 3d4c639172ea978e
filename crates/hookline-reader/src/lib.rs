//! Subscription reader with in-flight delivery tracking.
//!
//! Drains one broker subscription, hands each message to a bounded pool of
//! delivery slots and tracks it until delivery reports back. The broker
//! connection is rolled over after inactivity or transport failure without
//! orphaning messages received on the retired connection.
//!
//! ```text
//!                 ┌──────────────┐   receive_batch   ┌──────────────┐
//!                 │  ReaderPump  │ ◄──────────────── │ active recv  │
//!                 └──────┬───────┘                   └──────────────┘
//!          acquire slot  │  track                    ┌──────────────┐
//!   ┌──────────────┐ ◄───┤───► ┌──────────────┐      │ phased-out   │
//!   │ SlotPool     │     │     │ InFlight     │      │ recv (drain) │
//!   └──────▲───────┘     │     │ Ledger       │      └──────▲───────┘
//!          │             ▼     └──────▲───────┘             │
//!          │     ┌──────────────┐     │ try_remove          │ complete
//!          │     │ Dispatcher   │─────┼─────────────────────┘
//!          │     └──────────────┘     │
//!          └──── release ◄──── complete_message
//! ```
//!
//! The pump is the only writer of receiver state. Completions arrive on any
//! task and touch only the slot pool, the ledger, the receiver registry and
//! atomic counters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod ledger;
pub mod postgres;
pub mod pump;
pub mod reader;
pub mod receiver;
pub mod reconnect;
pub mod service;
pub mod slots;

pub use broker::{Broker, BrokerMessage, BrokerReceiver, ReceiverSpec};
pub use config::ReaderConfig;
pub use dispatch::DeliveryDispatcher;
pub use error::{ErrorKind, ReaderError, Result};
pub use heartbeat::{HeartbeatDeltas, HeartbeatReporter, ReaderStats};
pub use ledger::{InFlightLedger, MessageHandle};
pub use postgres::{PgBroker, PgBrokerSettings, PgReceiver};
pub use pump::ReaderPump;
pub use reader::{CompletionOutcome, MessageCompleter, Reader, ReaderSnapshot};
pub use receiver::{ReceiverLifecycle, ReceiverRegistry, ReceiverWrapper};
pub use reconnect::{ReconnectConfig, ReconnectionPolicy};
pub use service::{Lifecycle, ReaderService, ReplicaRole};
pub use slots::HandlerSlotPool;

/// Messages requested per receive.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Long-poll timeout per receive.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Empty-poll time before the active receiver is rolled over.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Force-closure grace for phased-out receivers.
pub const DEFAULT_PHASE_OUT_GRACE: Duration = Duration::from_secs(2 * 60);

/// Slot ids pre-seeded into the pool.
pub const DEFAULT_INITIAL_HANDLER_SLOTS: u32 = 10;

/// Default growth cap for slot ids.
pub const DEFAULT_MAX_HANDLER_SLOTS: u32 = 1024;
