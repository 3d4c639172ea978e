//! Core domain models and telemetry event types.
//!
//! Provides the strongly-typed identifiers, init payload, subscriber
//! configuration snapshot and message envelope shared by every hookline
//! crate, together with the outward telemetry events and the clock
//! abstraction used for deterministic testing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    HeartbeatEvent, MulticastEventHandler, NoOpEventHandler, ReaderEvent, ReaderEventHandler,
    ReceiverClosedEvent, ReconnectionEvent, RolloverEvent, RolloverReason, TracingEventHandler,
};
pub use models::{
    AuthConfig, CorrelationId, InitData, LockToken, MessageEnvelope,
    PayloadTransformation, ReceiverId, RouteConfig, SlotId, SubscriberConfig,
};
pub use time::{Clock, RealClock, TestClock};
