//! HTTP delivery behind the reader's dispatch seam.
//!
//! Each accepted envelope is posted to the subscriber's webhook on its own
//! task; the result is reported back through the completer so the message
//! is acknowledged on a 2xx and abandoned otherwise.

use std::time::Duration;

use anyhow::{Context, Result};
use hookline_core::MessageEnvelope;
use hookline_reader::{DeliveryDispatcher, MessageCompleter};
use reqwest::{header::CONTENT_TYPE, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

/// Settings for the forwarding HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Upper bound for a single delivery request.
    pub timeout: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: "hookline-reader/1.0".to_string() }
    }
}

/// Dispatcher that forwards envelopes to subscriber webhooks.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    config: ForwarderConfig,
}

impl HttpForwarder {
    /// Builds the forwarder and its pooled HTTP client.
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    /// Sends the envelope payload to its webhook. Returns whether the
    /// subscriber answered with a 2xx status.
    pub async fn deliver(&self, envelope: &MessageEnvelope) -> bool {
        let subscriber = &envelope.subscriber_config;
        let Some(url) = subscriber.resolve_url(None) else {
            warn!(subscriber = %envelope.subscriber_name, "no webhook url configured");
            return false;
        };
        let method = Method::from_bytes(subscriber.http_verb.as_bytes()).unwrap_or(Method::POST);
        let timeout = subscriber.timeout().min(self.config.timeout);

        let response = self
            .client
            .request(method, url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Correlation-Id", envelope.correlation_id.to_string())
            .header("X-Event-Type", &envelope.event_type)
            .body(envelope.payload.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!(status = response.status().as_u16(), "webhook accepted delivery");
                true
            },
            Ok(response) => {
                warn!(status = response.status().as_u16(), "webhook rejected delivery");
                false
            },
            Err(e) => {
                warn!(error = %e, timeout = e.is_timeout(), "webhook request failed");
                false
            },
        }
    }
}

#[async_trait::async_trait]
impl DeliveryDispatcher for HttpForwarder {
    async fn dispatch(
        &self,
        envelope: MessageEnvelope,
        completer: MessageCompleter,
    ) -> hookline_reader::Result<()> {
        let forwarder = self.clone();
        let span = info_span!(
            "forward",
            correlation_id = %envelope.correlation_id,
            handler_id = %envelope.handler_id,
            message_id = %envelope.message_id,
        );

        tokio::spawn(
            async move {
                let delivered = forwarder.deliver(&envelope).await;
                if let Err(e) = completer.complete_message(&envelope, delivered).await {
                    warn!(error = %e, "completion not applied");
                }
            }
            .instrument(span),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use hookline_core::{
        CorrelationId, InitData, NoOpEventHandler, SlotId, SubscriberConfig, TestClock,
    };
    use hookline_reader::{broker::mock::MockBroker, Reader, ReaderConfig, ReaderPump};
    use tokio_util::sync::CancellationToken;
    use wiremock::{
        matchers::{body_string, header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn envelope(webhook_url: Option<String>) -> MessageEnvelope {
        MessageEnvelope {
            payload: Bytes::from_static(br#"{"order":42}"#),
            event_type: "order.created".to_string(),
            subscriber_name: "billing".to_string(),
            service_name: "reader/order.created/billing".to_string(),
            correlation_id: CorrelationId::new(),
            handler_id: SlotId(1),
            message_id: "m-1".to_string(),
            delivery_count: 1,
            subscriber_config: SubscriberConfig::new("billing", "order.created", webhook_url),
        }
    }

    fn forwarder() -> HttpForwarder {
        HttpForwarder::new(ForwarderConfig {
            timeout: Duration::from_secs(2),
            ..ForwarderConfig::default()
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn posts_payload_with_identity_headers() {
        let server = MockServer::start().await;
        let envelope = envelope(Some(format!("{}/hook", server.uri())));
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header("x-event-type", "order.created"))
            .and(header("x-correlation-id", envelope.correlation_id.to_string().as_str()))
            .and(body_string(r#"{"order":42}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert!(forwarder().deliver(&envelope).await);
    }

    #[tokio::test]
    async fn non_success_status_is_not_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("x-correlation-id"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(!forwarder().deliver(&envelope(Some(server.uri()))).await);
    }

    #[tokio::test]
    async fn missing_webhook_url_is_not_delivered() {
        assert!(!forwarder().deliver(&envelope(None)).await);
    }

    #[tokio::test]
    async fn slow_webhook_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let forwarder = HttpForwarder::new(ForwarderConfig {
            timeout: Duration::from_millis(200),
            ..ForwarderConfig::default()
        })
        .expect("client builds");

        assert!(!forwarder.deliver(&envelope(Some(server.uri()))).await);
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "condition not reached in time");
    }

    fn pump_for(server: &MockServer, broker: &MockBroker) -> ReaderPump {
        let init = InitData::new(
            "billing-sub",
            SubscriberConfig::new("billing", "order.created", Some(format!("{}/hook", server.uri()))),
        );
        let reader = Arc::new(
            Reader::new(
                init,
                ReaderConfig::default(),
                Arc::new(NoOpEventHandler::new()),
                Arc::new(TestClock::new()),
            )
            .expect("valid reader"),
        );
        ReaderPump::new(reader, Arc::new(broker.clone()), Arc::new(forwarder()))
    }

    #[tokio::test]
    async fn accepted_delivery_acknowledges_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let broker = MockBroker::new();
        broker.push_message(r#"{"order":42}"#).await;
        let mut pump = pump_for(&server, &broker);

        let read = pump.poll_once(&CancellationToken::new()).await.expect("poll");
        assert_eq!(read, 1);

        wait_until(|| async { broker.completed().await.len() == 1 }).await;
        let reader = pump.reader().clone();
        wait_until(|| {
            let reader = reader.clone();
            async move { reader.slots().leased() == 0 }
        })
        .await;
        assert!(reader.ledger().is_empty());
    }

    #[tokio::test]
    async fn rejected_delivery_leaves_message_for_redelivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let broker = MockBroker::new();
        broker.push_message("{}").await;
        let mut pump = pump_for(&server, &broker);

        pump.poll_once(&CancellationToken::new()).await.expect("poll");

        let reader = pump.reader().clone();
        wait_until(|| {
            let reader = reader.clone();
            async move { reader.slots().leased() == 0 }
        })
        .await;
        assert!(reader.ledger().is_empty());
        assert!(broker.completed().await.is_empty());
    }
}
