//! Error types for subscription reading and in-flight tracking.
//!
//! Classifies every failure the Reader can observe so the pump can decide
//! between reconnecting (transport failures), logging and continuing
//! (everything else in the loop), or refusing to start (malformed init data).

use std::fmt;

use hookline_core::{CoreError, CorrelationId, LockToken, ReceiverId};
use thiserror::Error;

/// Result type alias for Reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;

/// Error conditions raised by the Reader and its broker adapters.
#[derive(Debug, Clone, Error)]
pub enum ReaderError {
    /// Socket-level or connection failure talking to the broker.
    #[error("broker transport failure: {message}")]
    Transport {
        /// Error message describing the failure
        message: String,
    },

    /// Broker rejected or garbled the protocol exchange.
    #[error("broker protocol error: {message}")]
    BrokerProtocol {
        /// Error message describing the failure
        message: String,
    },

    /// Non-transport broker failure.
    #[error("broker error: {message}")]
    Broker {
        /// Error message describing the failure
        message: String,
    },

    /// Message lock expired or was taken over before completion.
    #[error("lock {lock_token} is no longer held")]
    LockLost {
        /// Token whose lock was lost
        lock_token: LockToken,
    },

    /// Completion referenced a message that is not in flight.
    #[error("no in-flight message for correlation id {correlation_id}")]
    LockTokenNotFound {
        /// Correlation id that was not found
        correlation_id: CorrelationId,
    },

    /// A correlation id was tracked twice.
    #[error("correlation id {correlation_id} is already in flight")]
    DuplicateCorrelation {
        /// Duplicated correlation id
        correlation_id: CorrelationId,
    },

    /// Owning receiver was closed before the message completed.
    #[error("receiver {receiver_id} is no longer available")]
    ReceiverUnavailable {
        /// Receiver that was looked up
        receiver_id: ReceiverId,
    },

    /// Delivery dispatch refused the envelope.
    #[error("dispatch failed: {message}")]
    Dispatch {
        /// Error message from the dispatcher
        message: String,
    },

    /// Init payload could not be used to start a Reader.
    #[error("invalid init data: {message}")]
    InvalidInitData {
        /// Description of the offending input
        message: String,
    },

    /// Invalid Reader configuration.
    #[error("invalid reader configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Cooperative cancellation was requested.
    #[error("reader cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("internal reader error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl ReaderError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a broker protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::BrokerProtocol { message: message.into() }
    }

    /// Creates a generic broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }

    /// Creates a dispatch error.
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this failure is recovered by rebuilding the receiver.
    ///
    /// Only broker-protocol and transport failures qualify; every other error
    /// is logged and the pump moves on to its next poll.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::BrokerProtocol { .. })
    }

    /// Stable label for structured logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::BrokerProtocol { .. } => ErrorKind::Transport,
            Self::Broker { .. } | Self::LockLost { .. } => ErrorKind::Broker,
            Self::LockTokenNotFound { .. }
            | Self::DuplicateCorrelation { .. }
            | Self::ReceiverUnavailable { .. } => ErrorKind::Ledger,
            Self::Dispatch { .. } => ErrorKind::Dispatch,
            Self::InvalidInitData { .. } | Self::Configuration { .. } => ErrorKind::Startup,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl From<CoreError> for ReaderError {
    fn from(error: CoreError) -> Self {
        Self::InvalidInitData { message: error.to_string() }
    }
}

impl From<sqlx::Error> for ReaderError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::transport(error.to_string()),
            sqlx::Error::Protocol(_) => Self::protocol(error.to_string()),
            _ => Self::broker(error.to_string()),
        }
    }
}

/// Coarse error category for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broker connectivity.
    Transport,
    /// Broker operations.
    Broker,
    /// In-flight bookkeeping inconsistencies.
    Ledger,
    /// Hand-off to delivery.
    Dispatch,
    /// Startup input.
    Startup,
    /// Cooperative shutdown.
    Cancelled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Broker => write!(f, "broker"),
            Self::Ledger => write!(f, "ledger"),
            Self::Dispatch => write!(f, "dispatch"),
            Self::Startup => write!(f, "startup"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
