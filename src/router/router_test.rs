use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use serde_json::json;

use super::*;
use crate::channel::Internal;

fn request(id: u32, method: Method, internal: Internal, data: serde_json::Value) -> ChannelRequest {
    ChannelRequest {
        id,
        method,
        internal,
        data,
    }
}

fn transport_internal(transport_id: &str) -> Internal {
    Internal {
        transport_id: Some(transport_id.to_owned()),
        ..Default::default()
    }
}

fn create_transport(router: &mut Router, transport_id: &str) {
    let addr: SocketAddr = "127.0.0.1:4443".parse().unwrap();
    let response = router.handle_request(
        request(
            1,
            Method::RouterCreateWebRtcTransport,
            transport_internal(transport_id),
            json!({ "listenInfos": [{ "addr": addr, "protocol": "udp" }] }),
        ),
        Instant::now(),
    );
    assert!(matches!(response, ChannelResponse::Accepted { .. }));
}

fn producer_rtp_parameters(ssrc: u32) -> serde_json::Value {
    json!({
        "codecs": [
            {
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
                "rtcpFeedback": [
                    { "type": "nack", "parameter": "" },
                    { "type": "nack", "parameter": "pli" }
                ]
            }
        ],
        "encodings": [{ "ssrc": ssrc }],
        "rtcp": { "cname": "cname", "reducedSize": true }
    })
}

fn produce(router: &mut Router, transport_id: &str, producer_id: &str, ssrc: u32) -> ChannelResponse {
    router.handle_request(
        request(
            2,
            Method::TransportProduce,
            Internal {
                transport_id: Some(transport_id.to_owned()),
                producer_id: Some(producer_id.to_owned()),
                ..Default::default()
            },
            json!({ "kind": "video", "rtpParameters": producer_rtp_parameters(ssrc) }),
        ),
        Instant::now(),
    )
}

fn consume(
    router: &mut Router,
    transport_id: &str,
    consumer_id: &str,
    producer_id: &str,
    ssrc: u32,
) -> ChannelResponse {
    router.handle_request(
        request(
            3,
            Method::TransportConsume,
            Internal {
                transport_id: Some(transport_id.to_owned()),
                consumer_id: Some(consumer_id.to_owned()),
                ..Default::default()
            },
            json!({
                "producerId": producer_id,
                "kind": "video",
                "rtpParameters": producer_rtp_parameters(ssrc),
            }),
        ),
        Instant::now(),
    )
}

fn media_packet(ssrc: u32, seq: u16, ts: u32) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[1, 2, 3, 4]),
    }
}

#[test]
fn test_create_transport_returns_connect_info() {
    let mut router = Router::new("router-1".to_owned());
    let addr: SocketAddr = "127.0.0.1:4443".parse().unwrap();

    let response = router.handle_request(
        request(
            1,
            Method::RouterCreateWebRtcTransport,
            transport_internal("transport-1"),
            json!({ "listenInfos": [{ "addr": addr, "protocol": "udp" }] }),
        ),
        Instant::now(),
    );

    let ChannelResponse::Accepted { data, .. } = response else {
        panic!("expected accepted response");
    };
    assert!(data["iceUsernameFragment"].is_string());
    assert!(data["icePassword"].is_string());
    assert_eq!(data["iceLite"], true);
    assert_eq!(data["iceCandidates"][0]["port"], 4443);
    assert_eq!(data["dtlsFingerprints"][0]["algorithm"], "sha-256");
}

#[test]
fn test_duplicate_producer_id_is_rejected() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    assert!(matches!(
        produce(&mut router, "transport-1", "producer-1", 1111),
        ChannelResponse::Accepted { .. }
    ));

    let response = produce(&mut router, "transport-2", "producer-1", 2222);
    let ChannelResponse::Error { error, .. } = response else {
        panic!("expected error response");
    };
    assert_eq!(error, "AlreadyExistsError");
}

#[test]
fn test_consume_unknown_producer_is_not_found() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");

    let response = consume(&mut router, "transport-1", "consumer-1", "nope", 5555);
    let ChannelResponse::Error { error, .. } = response else {
        panic!("expected error response");
    };
    assert_eq!(error, "NotFoundError");
}

#[test]
fn test_indices_stay_mutually_inverse() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);
    consume(&mut router, "transport-2", "consumer-2", "producer-1", 5556);
    assert!(router.invariants_hold());

    let response = router.handle_request(
        request(
            4,
            Method::ConsumerClose,
            Internal {
                consumer_id: Some("consumer-1".to_owned()),
                ..Default::default()
            },
            serde_json::Value::Null,
        ),
        Instant::now(),
    );
    assert!(matches!(response, ChannelResponse::Accepted { .. }));
    assert!(router.invariants_hold());
}

#[test]
fn test_fan_out_reaches_consumers_on_other_transports() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");
    create_transport(&mut router, "transport-3");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);
    consume(&mut router, "transport-3", "consumer-2", "producer-1", 5556);

    router.transport_for_test("transport-2").force_connected_for_test();
    router.transport_for_test("transport-3").force_connected_for_test();

    let now = Instant::now();
    for seq in 100..110u16 {
        let mut packet = media_packet(1111, seq, seq as u32 * 3000);
        let original = packet.clone();
        router.receive_rtp_for_test("transport-1", &mut packet, now);
        // buffer reuse invariant: untouched after the full fan-out
        assert_eq!(packet, original);
    }

    let consumer_1 = router
        .transport_for_test("transport-2")
        .get_consumer("consumer-1")
        .unwrap()
        .dump();
    let consumer_2 = router
        .transport_for_test("transport-3")
        .get_consumer("consumer-2")
        .unwrap()
        .dump();

    assert_eq!(consumer_1.packet_count, 10);
    assert_eq!(consumer_2.packet_count, 10);
    assert_eq!(consumer_1.ssrc, 5555);
    assert_eq!(consumer_2.ssrc, 5556);
}

#[test]
fn test_producer_close_cascades_to_consumers() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);
    consume(&mut router, "transport-2", "consumer-2", "producer-1", 5556);

    let response = router.handle_request(
        request(
            5,
            Method::ProducerClose,
            Internal {
                producer_id: Some("producer-1".to_owned()),
                ..Default::default()
            },
            serde_json::Value::Null,
        ),
        Instant::now(),
    );
    assert!(matches!(response, ChannelResponse::Accepted { .. }));

    // both consumers are gone from their transport and from the indices
    assert!(router
        .transport_for_test("transport-2")
        .get_consumer("consumer-1")
        .is_none());
    assert!(router
        .transport_for_test("transport-2")
        .get_consumer("consumer-2")
        .is_none());
    assert!(router.invariants_hold());

    let mut producer_close_notifications = 0;
    while let Some(notification) = router.poll_notification() {
        if notification.event == "producerclose" {
            producer_close_notifications += 1;
        }
    }
    assert_eq!(producer_close_notifications, 2);
}

#[test]
fn test_transport_close_cascades() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);

    // closing the producing transport closes the consumer elsewhere
    let response = router.handle_request(
        request(
            6,
            Method::TransportClose,
            transport_internal("transport-1"),
            serde_json::Value::Null,
        ),
        Instant::now(),
    );
    assert!(matches!(response, ChannelResponse::Accepted { .. }));

    assert!(router
        .transport_for_test("transport-2")
        .get_consumer("consumer-1")
        .is_none());
    assert!(router.invariants_hold());
}

#[test]
fn test_producer_pause_flows_to_consumer() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);
    router.transport_for_test("transport-2").force_connected_for_test();

    let response = router.handle_request(
        request(
            7,
            Method::ProducerPause,
            Internal {
                producer_id: Some("producer-1".to_owned()),
                ..Default::default()
            },
            serde_json::Value::Null,
        ),
        Instant::now(),
    );
    assert!(matches!(response, ChannelResponse::Accepted { .. }));

    assert!(router
        .transport_for_test("transport-2")
        .get_consumer("consumer-1")
        .unwrap()
        .is_producer_paused());

    let mut saw_pause_notification = false;
    while let Some(notification) = router.poll_notification() {
        if notification.event == "producerpause" && notification.target_id == "consumer-1" {
            saw_pause_notification = true;
        }
    }
    assert!(saw_pause_notification);

    // paused producer drops its packets: nothing reaches the consumer
    let mut packet = media_packet(1111, 100, 0);
    router.receive_rtp_for_test("transport-1", &mut packet, Instant::now());
    assert_eq!(
        router
            .transport_for_test("transport-2")
            .get_consumer("consumer-1")
            .unwrap()
            .dump()
            .packet_count,
        0
    );
}

#[test]
fn test_consumer_score_notification_after_stream_appears() {
    let mut router = Router::new("router-1".to_owned());
    create_transport(&mut router, "transport-1");
    create_transport(&mut router, "transport-2");

    produce(&mut router, "transport-1", "producer-1", 1111);
    consume(&mut router, "transport-2", "consumer-1", "producer-1", 5555);
    router.transport_for_test("transport-2").force_connected_for_test();
    while router.poll_notification().is_some() {}

    // first packet creates the producer stream, which binds the consumer
    let mut packet = media_packet(1111, 100, 0);
    router.receive_rtp_for_test("transport-1", &mut packet, Instant::now());

    let mut saw_consumer_score = false;
    while let Some(notification) = router.poll_notification() {
        if notification.event == "score" && notification.target_id == "consumer-1" {
            saw_consumer_score = true;
            assert_eq!(notification.data["consumer"], 10);
        }
    }
    assert!(saw_consumer_score);
}
