//! Core domain models and strongly-typed identifiers.
//!
//! Defines the Reader's init payload, the resolved subscriber configuration
//! snapshot, the per-message envelope handed to delivery, and newtype ID
//! wrappers for compile-time type safety.

use std::{fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Default maximum number of broker deliveries before a message is
/// dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Identifier generated for every received message.
///
/// Keys the in-flight ledger. A fresh value is minted per receive, so a
/// redelivered broker message gets a new correlation id.
///
/// # Example
///
/// ```
/// use hookline_core::models::CorrelationId;
/// let correlation_id = CorrelationId::new();
/// println!("tracking message {}", correlation_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identity of one broker receiver wrapper.
///
/// Unique per (re)connect. Stored in every in-flight message handle so a
/// completion can find the receiver that produced the message even after a
/// rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiverId(pub Uuid);

impl ReceiverId {
    /// Creates a new random receiver ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReceiverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-issued token required to acknowledge a specific message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    /// Creates a new random lock token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler slot identifier, one unit of delivery concurrency.
///
/// Slot ids start at 1 and are handed out by the reader's slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authentication applied by the delivery component when calling a
/// subscriber webhook.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Unauthenticated calls.
    #[default]
    None,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Resolved password.
        password: String,
    },
    /// OAuth2 client-credentials flow against an OIDC token endpoint.
    Oidc {
        /// Token endpoint.
        uri: String,
        /// Client identifier.
        client_id: String,
        /// Resolved client secret.
        client_secret: String,
        /// Requested scopes.
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            },
            Self::Oidc { uri, client_id, scopes, .. } => f
                .debug_struct("Oidc")
                .field("uri", uri)
                .field("client_id", client_id)
                .field("scopes", scopes)
                .finish_non_exhaustive(),
        }
    }
}

/// How the delivery component shapes the outgoing request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadTransformation {
    /// Forward the broker payload untouched.
    #[default]
    None,
    /// Forward only the inner delivery body of the domain event.
    DeliveryBodyOnly,
}

/// Selector-specific override of the subscriber's default webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Value matched against the event's routing selector.
    pub selector: String,
    /// Webhook for this selector.
    pub webhook_url: String,
    /// HTTP verb for this selector.
    #[serde(default = "default_http_verb")]
    pub http_verb: String,
}

/// Resolved subscriber configuration snapshot.
///
/// Produced by the provisioning side with all secrets already resolved and
/// carried inside every envelope so delivery never needs a config lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Subscriber name.
    pub subscriber_name: String,
    /// Event type the subscriber listens to.
    pub event_type: String,
    /// Default webhook.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Default HTTP verb.
    #[serde(default = "default_http_verb")]
    pub http_verb: String,
    /// Authentication for webhook calls.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Selector-based routes.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Outgoing body shaping.
    #[serde(default)]
    pub payload_transformation: PayloadTransformation,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl SubscriberConfig {
    /// Creates a configuration with a single default webhook, no auth and
    /// no routes.
    pub fn new(
        subscriber_name: impl Into<String>,
        event_type: impl Into<String>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            subscriber_name: subscriber_name.into(),
            event_type: event_type.into(),
            webhook_url,
            http_verb: default_http_verb(),
            auth: AuthConfig::None,
            routes: Vec::new(),
            payload_transformation: PayloadTransformation::None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Returns the webhook for a routing selector, falling back to the
    /// subscriber's default webhook.
    pub fn resolve_url(&self, selector: Option<&str>) -> Option<&str> {
        selector
            .and_then(|selector| self.routes.iter().find(|route| route.selector == selector))
            .map(|route| route.webhook_url.as_str())
            .or(self.webhook_url.as_deref())
    }

    /// Returns the per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_http_verb() -> String {
    "POST".to_string()
}

fn default_timeout_seconds() -> u64 {
    100
}

fn default_max_delivery_count() -> u32 {
    DEFAULT_MAX_DELIVERY_COUNT
}

/// Immutable startup data for one Reader.
///
/// Constructed by the provisioning component, serialized into the opaque
/// init payload and decoded exactly once when the Reader opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    /// Broker subscription drained by this Reader.
    pub subscription_name: String,
    /// Event type (topic) the subscription belongs to.
    pub event_type: String,
    /// Subscriber the messages are delivered to.
    pub subscriber_name: String,
    /// Whether this Reader drains the subscription's dead-letter queue.
    #[serde(default)]
    pub dead_letter: bool,
    /// Heartbeat period; no heartbeat is emitted when absent.
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
    /// Resolved subscriber configuration.
    pub subscriber_config: SubscriberConfig,
    /// Broker deliveries allowed before a message is dead-lettered.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    /// Identity of the hosting service, stamped on every envelope.
    #[serde(default)]
    pub service_name: Option<String>,
}

impl InitData {
    /// Creates init data for the main queue of `subscription_name`, taking
    /// the event type and subscriber from the configuration snapshot.
    pub fn new(subscription_name: impl Into<String>, subscriber_config: SubscriberConfig) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            event_type: subscriber_config.event_type.clone(),
            subscriber_name: subscriber_config.subscriber_name.clone(),
            dead_letter: false,
            heartbeat_interval_seconds: None,
            subscriber_config,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            service_name: None,
        }
    }

    /// Decodes and validates an init payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` when the payload is not a valid
    /// document or lacks a required field, and `CoreError::InvalidInitData`
    /// when a required field is blank or out of range.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(CoreError::invalid_init("init payload is empty"));
        }
        let init: Self = serde_json::from_slice(payload)?;
        init.validate()?;
        Ok(init)
    }

    /// Encodes this init data into the payload format read by `from_bytes`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInitData` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("subscriber_name", &self.subscriber_name),
            ("event_type", &self.event_type),
            ("subscription_name", &self.subscription_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::invalid_init(format!("{field} must not be empty")));
            }
        }

        if self.max_delivery_count == 0 {
            return Err(CoreError::invalid_init("max_delivery_count must be greater than 0"));
        }

        if self.heartbeat_interval_seconds == Some(0) {
            return Err(CoreError::invalid_init(
                "heartbeat_interval_seconds must be greater than 0 when set",
            ));
        }

        Ok(())
    }

    /// Returns the heartbeat period, if heartbeats are enabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_seconds.map(Duration::from_secs)
    }

    /// Returns the owning-service identity stamped on envelopes.
    pub fn service_identity(&self) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| format!("reader/{}/{}", self.event_type, self.subscriber_name))
    }
}

/// One received message on its way to delivery.
///
/// Created per receive and passed by value to the delivery dispatcher. The
/// correlation id and handler id are what the completion callback needs to
/// reconcile the message with the Reader's in-flight state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Raw broker payload.
    pub payload: Bytes,
    /// Event type of the payload.
    pub event_type: String,
    /// Subscriber the message is for.
    pub subscriber_name: String,
    /// Identity of the Reader service that received the message.
    pub service_name: String,
    /// Per-receive correlation identifier.
    pub correlation_id: CorrelationId,
    /// Handler slot assigned to this message.
    pub handler_id: SlotId,
    /// Broker message identifier.
    pub message_id: String,
    /// Number of times the broker has delivered this message.
    pub delivery_count: u32,
    /// Subscriber configuration snapshot.
    pub subscriber_config: SubscriberConfig,
}
