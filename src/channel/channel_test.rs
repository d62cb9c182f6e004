use serde_json::json;

use super::*;

#[test]
fn test_request_round_trip() {
    let request = ChannelRequest {
        id: 42,
        method: Method::TransportProduce,
        internal: Internal {
            router_id: Some("router-1".to_owned()),
            transport_id: Some("transport-1".to_owned()),
            producer_id: Some("producer-1".to_owned()),
            consumer_id: None,
        },
        data: json!({ "kind": "video", "paused": false }),
    };

    let wire = serde_json::to_string(&request).unwrap();
    let parsed: ChannelRequest = serde_json::from_str(&wire).unwrap();

    assert_eq!(parsed.id, 42);
    assert_eq!(parsed.method, Method::TransportProduce);
    assert_eq!(parsed.internal, request.internal);
    assert_eq!(parsed.data, request.data);
}

#[test]
fn test_method_wire_names() {
    let wire = serde_json::to_string(&Method::RouterCreateWebRtcTransport).unwrap();
    assert_eq!(wire, "\"router.createWebRtcTransport\"");

    let parsed: Method = serde_json::from_str("\"consumer.requestKeyFrame\"").unwrap();
    assert_eq!(parsed, Method::ConsumerRequestKeyFrame);
}

#[test]
fn test_request_with_missing_internal_defaults() {
    let parsed: ChannelRequest =
        serde_json::from_str(r#"{"id":1,"method":"router.dump"}"#).unwrap();
    assert_eq!(parsed.internal, Internal::default());
    assert!(parsed.data.is_null());
}

#[test]
fn test_accepted_response_shape() {
    let response = ChannelResponse::accepted(7, json!({ "ok": 1 }));
    let wire = serde_json::to_value(&response).unwrap();

    assert_eq!(wire["id"], 7);
    assert_eq!(wire["accepted"], true);
    assert_eq!(wire["data"]["ok"], 1);
}

#[test]
fn test_error_response_shape() {
    let error = crate::error::Error::NotFound("Producer not found".to_owned());
    let response = ChannelResponse::error(9, &error);
    let wire = serde_json::to_value(&response).unwrap();

    assert_eq!(wire["id"], 9);
    assert_eq!(wire["error"], "NotFoundError");
    assert_eq!(wire["reason"], "not found: Producer not found");
}

#[test]
fn test_notification_round_trip() {
    let notification = Notification {
        target_id: "consumer-1".to_owned(),
        event: "score".to_owned(),
        data: json!({ "producer": 9, "consumer": 10 }),
    };

    let wire = serde_json::to_string(&notification).unwrap();
    let parsed: Notification = serde_json::from_str(&wire).unwrap();
    assert_eq!(parsed, notification);
}
