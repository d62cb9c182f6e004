use bytes::Bytes;

use super::*;
use crate::rtp::parameters::{
    RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpHeaderExtensionParameters,
    RtxParameters,
};

fn video_producer() -> Producer {
    Producer::new(
        "producer-1".to_owned(),
        MediaKind::Video,
        RtpParameters {
            mid: None,
            codecs: vec![
                RtpCodecParameters {
                    mime_type: "video/VP8".to_owned(),
                    payload_type: 96,
                    clock_rate: 90000,
                    channels: None,
                    rtcp_feedback: vec![
                        RtcpFeedback {
                            typ: "nack".to_owned(),
                            parameter: String::new(),
                        },
                        RtcpFeedback {
                            typ: "nack".to_owned(),
                            parameter: "pli".to_owned(),
                        },
                    ],
                },
                RtpCodecParameters {
                    mime_type: "video/rtx".to_owned(),
                    payload_type: 97,
                    clock_rate: 90000,
                    channels: None,
                    rtcp_feedback: vec![],
                },
            ],
            header_extensions: vec![RtpHeaderExtensionParameters {
                uri: RID_URI.to_owned(),
                id: 10,
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                rid: None,
                rtx: Some(RtxParameters { ssrc: 1112 }),
                max_bitrate: None,
            }],
            rtcp: RtcpParameters {
                cname: "producer-cname".to_owned(),
                reduced_size: true,
            },
        },
        false,
    )
}

fn packet(ssrc: u32, pt: u8, seq: u16, ts: u32) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: pt,
            sequence_number: seq,
            timestamp: ts,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0u8; 50]),
    }
}

#[test]
fn test_stream_created_on_first_packet() {
    let mut producer = video_producer();

    let mut first = packet(1111, 96, 100, 0);
    assert!(producer.receive_rtp_packet(&mut first, 1000));

    assert!(matches!(
        producer.poll_event(),
        Some(ProducerEvent::NewStream { ssrc: 1111 })
    ));
    assert_eq!(producer.stream_ssrcs(), vec![1111]);
}

#[test]
fn test_unknown_ssrc_is_dropped() {
    let mut producer = video_producer();

    let mut unknown = packet(9999, 96, 100, 0);
    assert!(!producer.receive_rtp_packet(&mut unknown, 1000));
    assert!(producer.stream_ssrcs().is_empty());
}

#[test]
fn test_unknown_payload_type_is_dropped() {
    let mut producer = video_producer();

    // ssrc matches the declared encoding, so the stream exists afterwards,
    // but a later packet with an unknown pt on a different ssrc is dropped
    let mut first = packet(1111, 96, 100, 0);
    assert!(producer.receive_rtp_packet(&mut first, 1000));

    let mut bad = packet(2222, 44, 101, 0);
    assert!(!producer.receive_rtp_packet(&mut bad, 1010));
}

#[test]
fn test_rtx_packet_is_unwrapped_and_forwarded() {
    let mut producer = video_producer();

    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 100, 0), 1000));
    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 101, 3000), 1033));

    // retransmission of seq 102 over the declared RTX ssrc
    let mut rtx = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 97,
            sequence_number: 7000,
            timestamp: 6000,
            ssrc: 1112,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0, 102, 9, 9]),
    };
    assert!(producer.receive_rtp_packet(&mut rtx, 1066));

    // forwarded as a media packet
    assert_eq!(rtx.header.ssrc, 1111);
    assert_eq!(rtx.header.payload_type, 96);
    assert_eq!(rtx.header.sequence_number, 102);
}

#[test]
fn test_paused_producer_discards_and_counts() {
    let mut producer = video_producer();

    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 100, 0), 1000));
    producer.pause();

    assert!(!producer.receive_rtp_packet(&mut packet(1111, 96, 101, 3000), 1033));
    assert!(producer.is_paused());
    assert_eq!(producer.dump().rtp_streams[0].packets_discarded, 1);

    producer.resume();
    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 101, 3000), 1066));
}

#[test]
fn test_gap_generates_nack_feedback() {
    let mut producer = video_producer();

    for seq in [100u16, 101, 103, 104, 105] {
        producer.receive_rtp_packet(&mut packet(1111, 96, seq, seq as u32 * 3000), 1000);
    }

    let feedback = producer.take_feedback();
    assert_eq!(feedback.len(), 1);
    let nack = feedback[0]
        .as_any()
        .downcast_ref::<rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack>()
        .expect("expected a NACK");
    assert_eq!(nack.media_ssrc, 1111);
    assert_eq!(nack.nacks[0].packet_id, 102);
}

#[test]
fn test_key_frame_request_emits_pli() {
    let mut producer = video_producer();
    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 100, 0), 1000));

    producer.request_key_frame(1111);
    let feedback = producer.take_feedback();
    assert_eq!(feedback.len(), 1);
    assert!(feedback[0]
        .as_any()
        .downcast_ref::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
        .is_some());
}

#[test]
fn test_inactivity_turns_stream_unhealthy() {
    let mut producer = video_producer();
    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 100, 0), 1000));
    while producer.poll_event().is_some() {}

    // several check intervals with no traffic
    let mut now_ms = 1000;
    for _ in 0..12 {
        now_ms += VIDEO_CHECK_INTERVAL_MS;
        producer.handle_timeout(now_ms);
    }

    let mut saw_unhealthy = false;
    while let Some(event) = producer.poll_event() {
        if matches!(event, ProducerEvent::StreamUnhealthy { ssrc: 1111 }) {
            saw_unhealthy = true;
        }
    }
    assert!(saw_unhealthy);
}

#[test]
fn test_receiver_report_feedback_emitted() {
    let mut producer = video_producer();
    assert!(producer.receive_rtp_packet(&mut packet(1111, 96, 100, 0), 1000));
    producer.take_feedback();

    producer.handle_timeout(1000 + MAX_VIDEO_INTERVAL_MS + 1);

    let feedback = producer.take_feedback();
    assert!(feedback.iter().any(|p| p
        .as_any()
        .downcast_ref::<rtcp::receiver_report::ReceiverReport>()
        .is_some()));
}
