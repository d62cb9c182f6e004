use std::time::Instant;

use shared::{Protocol, TransportContext};
use stun::attributes::{ATTR_PRIORITY, ATTR_USERNAME, ATTR_USE_CANDIDATE};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Setter, TransactionId, BINDING_REQUEST, BINDING_SUCCESS};
use stun::textattrs::Username;

use super::*;
use crate::rtp::parameters::{
    RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
};

fn new_transport() -> WebRtcTransport {
    WebRtcTransport::new(
        "transport-1".to_owned(),
        WebRtcTransportOptions {
            listen_infos: vec![ListenInfo {
                addr: "127.0.0.1:4443".parse().unwrap(),
                announced_ip: Some("198.51.100.7".to_owned()),
                protocol: TransportProtocol::Udp,
            }],
        },
        SystemInstant::now(),
    )
    .unwrap()
}

fn peer_context() -> TransportContext {
    TransportContext {
        local_addr: "127.0.0.1:4443".parse().unwrap(),
        peer_addr: "192.0.2.33:50000".parse().unwrap(),
        protocol: Protocol::UDP,
        ecn: None,
    }
}

fn binding_request_bytes(transport: &WebRtcTransport, use_candidate: bool) -> BytesMut {
    let info = transport.connect_info();

    let mut msg = Message::new();
    msg.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(Username::new(
            ATTR_USERNAME,
            format!("{}:client", info.ice_username_fragment),
        )),
    ])
    .unwrap();
    msg.add(ATTR_PRIORITY, &100u32.to_be_bytes());
    if use_candidate {
        msg.add(ATTR_USE_CANDIDATE, &[]);
    }
    MessageIntegrity::new_short_term_integrity(info.ice_password)
        .add_to(&mut msg)
        .unwrap();
    FINGERPRINT.add_to(&mut msg).unwrap();

    BytesMut::from(&msg.raw[..])
}

fn video_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_owned(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            rtcp_feedback: vec![RtcpFeedback {
                typ: "nack".to_owned(),
                parameter: String::new(),
            }],
        }],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: "cname".to_owned(),
            reduced_size: true,
        },
    }
}

#[test]
fn test_connect_info_announces_configured_ip() {
    let transport = new_transport();
    let info = transport.connect_info();

    assert!(info.ice_lite);
    assert_eq!(info.ice_candidates.len(), 1);
    assert_eq!(info.ice_candidates[0].ip, "198.51.100.7");
    assert_eq!(info.ice_candidates[0].port, 4443);
    assert_eq!(info.ice_candidates[0].typ, "host");
    assert_eq!(info.dtls_fingerprints.len(), 1);
}

#[test]
fn test_stun_binding_request_is_answered_and_selects_tuple() {
    let mut transport = new_transport();
    let now = Instant::now();

    let message = binding_request_bytes(&transport, true);
    let forward = transport.handle_transmit(Transmit {
        now,
        transport: peer_context(),
        message,
    });
    assert!(forward.is_none());

    // binding success goes back to the requesting tuple
    let response = transport.poll_transmit().expect("expected a response");
    assert_eq!(response.transport.peer_addr, peer_context().peer_addr);
    let mut parsed = Message::new();
    parsed.write(&response.message).unwrap();
    assert_eq!(parsed.typ, BINDING_SUCCESS);

    let mut saw_state_change = false;
    let mut saw_selected_tuple = false;
    while let Some(event) = transport.poll_event() {
        match event {
            TransportEvent::IceStateChange(IceState::Connected) => saw_state_change = true,
            TransportEvent::IceSelectedTupleChange(tuple) => {
                assert_eq!(tuple.remote_port, 50000);
                saw_selected_tuple = true;
            }
            _ => {}
        }
    }
    assert!(saw_state_change);
    assert!(saw_selected_tuple);
}

#[test]
fn test_garbage_datagram_is_ignored() {
    let mut transport = new_transport();

    let forward = transport.handle_transmit(Transmit {
        now: Instant::now(),
        transport: peer_context(),
        message: BytesMut::from(&[0x10u8, 0, 0, 0][..]),
    });

    assert!(forward.is_none());
    assert!(transport.poll_transmit().is_none());
}

#[test]
fn test_rtp_before_srtp_is_dropped() {
    let mut transport = new_transport();
    transport
        .produce(
            "producer-1".to_owned(),
            MediaKind::Video,
            video_parameters(1111),
            false,
        )
        .unwrap();

    // a well-formed RTP header, but no SRTP context yet
    let forward = transport.handle_transmit(Transmit {
        now: Instant::now(),
        transport: peer_context(),
        message: BytesMut::from(&[0x80u8, 96, 0, 1, 0, 0, 0, 0, 0, 0, 4, 87][..]),
    });

    assert!(forward.is_none());
}

#[test]
fn test_produce_rejects_duplicate_ssrc() {
    let mut transport = new_transport();
    transport
        .produce(
            "producer-1".to_owned(),
            MediaKind::Video,
            video_parameters(1111),
            false,
        )
        .unwrap();

    let result = transport.produce(
        "producer-2".to_owned(),
        MediaKind::Video,
        video_parameters(1111),
        false,
    );
    assert!(matches!(result, Err(Error::AlreadyExists(_))));
}

#[test]
fn test_is_connected_requires_everything() {
    let mut transport = new_transport();
    assert!(!transport.is_connected());

    // ICE alone is not enough
    let message = binding_request_bytes(&transport, true);
    let _ = transport.handle_transmit(Transmit {
        now: Instant::now(),
        transport: peer_context(),
        message,
    });
    assert!(!transport.is_connected());
}

#[test]
fn test_dump_shape() {
    let mut transport = new_transport();
    transport
        .produce(
            "producer-1".to_owned(),
            MediaKind::Video,
            video_parameters(1111),
            false,
        )
        .unwrap();

    let dump = transport.dump();
    assert_eq!(dump.id, "transport-1");
    assert_eq!(dump.ice_state, IceState::New);
    assert_eq!(dump.dtls_state, DtlsState::New);
    assert_eq!(dump.producer_ids, vec!["producer-1".to_owned()]);
}
