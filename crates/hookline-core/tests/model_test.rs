//! Init payload decoding and envelope serialization tests.

use bytes::Bytes;
use hookline_core::{
    AuthConfig, CoreError, CorrelationId, InitData, MessageEnvelope, PayloadTransformation,
    SlotId, SubscriberConfig,
};
use proptest::prelude::*;

const FULL_PAYLOAD: &str = r#"{
    "subscription_name": "billing-sub",
    "event_type": "order.created",
    "subscriber_name": "billing",
    "dead_letter": true,
    "heartbeat_interval_seconds": 30,
    "max_delivery_count": 5,
    "service_name": "fabric:/hookline/reader-billing",
    "subscriber_config": {
        "subscriber_name": "billing",
        "event_type": "order.created",
        "webhook_url": "https://billing.example.com/hook",
        "auth": { "type": "basic", "username": "svc", "password": "s3cret" },
        "routes": [
            { "selector": "eu", "webhook_url": "https://eu.billing.example.com/hook" }
        ],
        "payload_transformation": "delivery_body_only",
        "timeout_seconds": 45
    }
}"#;

#[test]
fn full_payload_decodes() {
    let init = InitData::from_bytes(FULL_PAYLOAD.as_bytes()).expect("valid payload");

    assert_eq!(init.subscription_name, "billing-sub");
    assert!(init.dead_letter);
    assert_eq!(init.heartbeat_interval(), Some(std::time::Duration::from_secs(30)));
    assert_eq!(init.max_delivery_count, 5);
    assert_eq!(init.service_identity(), "fabric:/hookline/reader-billing");

    let config = &init.subscriber_config;
    assert!(matches!(config.auth, AuthConfig::Basic { .. }));
    assert_eq!(config.payload_transformation, PayloadTransformation::DeliveryBodyOnly);
    assert_eq!(config.routes[0].http_verb, "POST");
    assert_eq!(config.timeout().as_secs(), 45);
}

#[test]
fn minimal_payload_uses_defaults() {
    let payload = r#"{
        "subscription_name": "billing-sub",
        "event_type": "order.created",
        "subscriber_name": "billing",
        "subscriber_config": { "subscriber_name": "billing", "event_type": "order.created" }
    }"#;

    let init = InitData::from_bytes(payload.as_bytes()).expect("valid payload");

    assert!(!init.dead_letter);
    assert_eq!(init.heartbeat_interval(), None);
    assert_eq!(init.max_delivery_count, 10);
    assert_eq!(init.subscriber_config.auth, AuthConfig::None);
    assert_eq!(init.subscriber_config.timeout_seconds, 100);
}

#[test]
fn empty_payload_rejected() {
    assert!(matches!(InitData::from_bytes(b""), Err(CoreError::InvalidInitData(_))));
}

#[test]
fn missing_event_type_rejected() {
    let payload = r#"{
        "subscription_name": "billing-sub",
        "subscriber_name": "billing",
        "subscriber_config": { "subscriber_name": "billing", "event_type": "order.created" }
    }"#;

    let error = InitData::from_bytes(payload.as_bytes()).expect_err("event_type is required");
    assert!(matches!(error, CoreError::Serialization(_)));
    assert!(error.to_string().contains("event_type"));
}

#[test]
fn blank_required_fields_rejected() {
    for field in ["subscription_name", "event_type", "subscriber_name"] {
        let mut value: serde_json::Value =
            serde_json::from_str(FULL_PAYLOAD).expect("fixture is JSON");
        value[field] = serde_json::Value::String(String::new());
        let payload = serde_json::to_vec(&value).expect("encodes");

        let error = InitData::from_bytes(&payload).expect_err("blank field rejected");
        assert!(error.to_string().contains(field), "{field}: {error}");
    }
}

#[test]
fn zero_heartbeat_and_delivery_count_rejected() {
    let mut value: serde_json::Value = serde_json::from_str(FULL_PAYLOAD).expect("fixture");
    value["heartbeat_interval_seconds"] = 0.into();
    assert!(InitData::from_bytes(&serde_json::to_vec(&value).expect("encodes")).is_err());

    let mut value: serde_json::Value = serde_json::from_str(FULL_PAYLOAD).expect("fixture");
    value["max_delivery_count"] = 0.into();
    assert!(InitData::from_bytes(&serde_json::to_vec(&value).expect("encodes")).is_err());
}

#[test]
fn encoded_payload_decodes_to_same_init() {
    let init = InitData::from_bytes(FULL_PAYLOAD.as_bytes()).expect("valid payload");
    let decoded = InitData::from_bytes(&init.to_bytes().expect("encodes")).expect("decodes");
    assert_eq!(decoded, init);
}

#[test]
fn envelope_serializes_identity_fields() {
    let envelope = MessageEnvelope {
        payload: Bytes::from_static(b"{}"),
        event_type: "order.created".to_string(),
        subscriber_name: "billing".to_string(),
        service_name: "reader/order.created/billing".to_string(),
        correlation_id: CorrelationId::new(),
        handler_id: SlotId(7),
        message_id: "m-1".to_string(),
        delivery_count: 1,
        subscriber_config: SubscriberConfig::new("billing", "order.created", None),
    };

    let json = serde_json::to_value(&envelope).expect("serializes");
    assert_eq!(json["handler_id"], 7);
    assert_eq!(json["correlation_id"], envelope.correlation_id.to_string());
}

proptest! {
    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn arbitrary_bytes_never_panic(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = InitData::from_bytes(&payload);
    }
}
