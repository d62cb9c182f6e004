use log::{debug, warn};
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::reception_report::ReceptionReport;
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

use crate::rtp::nack_generator::NackGenerator;
use crate::rtp::stream::{RtpStream, RtpStreamParams};


const NACK_LOG2_SIZE_MINUS_6: u8 = 7; // 8192 packets

/// Key-frame request flavors a stream can emit upstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyFrameRequestKind {
    Pli,
    Fir,
}

/// Ingress direction of a producer stream: A.1 tracking plus NACK
/// generation, RTX repair intake and receiver-report generation.
#[derive(Debug)]
pub struct RtpStreamRecv {
    pub(crate) stream: RtpStream,
    nack_generator: Option<NackGenerator>,

    // receiver report state
    expected_prior: u32,
    received_prior: u32,
    last_sr_ntp: u32,
    last_sr_received_ms: u64,

    // interarrival jitter, RFC 3550 page 39
    transit: i64,
    jitter: f64,

    // inactivity detection
    packets_at_last_check: u64,

    fir_seq: u8,
}

impl RtpStreamRecv {
    pub fn new(params: RtpStreamParams) -> Self {
        let nack_generator = params
            .use_nack
            .then(|| NackGenerator::new(NACK_LOG2_SIZE_MINUS_6));

        Self {
            stream: RtpStream::new(params),
            nack_generator,
            expected_prior: 0,
            received_prior: 0,
            last_sr_ntp: 0,
            last_sr_received_ms: 0,
            transit: 0,
            jitter: 0.0,
            packets_at_last_check: 0,
            fir_seq: 0,
        }
    }

    pub fn stream(&self) -> &RtpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut RtpStream {
        &mut self.stream
    }

    pub fn ssrc(&self) -> u32 {
        self.stream.ssrc()
    }

    pub fn score(&self) -> u8 {
        self.stream.score()
    }

    pub fn receive_packet(&mut self, packet: &rtp::packet::Packet, now_ms: u64) -> bool {
        if !self.stream.receive_packet(packet, now_ms) {
            return false;
        }

        self.update_jitter(packet.header.timestamp, now_ms);

        if let Some(generator) = &mut self.nack_generator {
            generator.received(packet.header.sequence_number);
        }

        true
    }

    /// Take in an RFC 4588 retransmission, unwrap it into the media stream
    /// and account it as repaired. The packet is rewritten in place.
    pub fn receive_rtx_packet(&mut self, packet: &mut rtp::packet::Packet, now_ms: u64) -> bool {
        let params = self.stream.params();
        if Some(packet.header.ssrc) != params.rtx_ssrc {
            return false;
        }
        if Some(packet.header.payload_type) != params.rtx_payload_type {
            debug!(
                "ignoring RTX packet with unknown payload type [pt:{}]",
                packet.header.payload_type
            );
            return false;
        }
        if packet.payload.len() < 2 {
            warn!("ignoring empty RTX packet [ssrc:{}]", packet.header.ssrc);
            return false;
        }

        // RFC 4588: original sequence number leads the payload.
        let osn = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
        packet.header.ssrc = params.ssrc;
        packet.header.payload_type = params.payload_type;
        packet.header.sequence_number = osn;
        packet.payload = packet.payload.slice(2..);

        self.stream
            .retransmission_counter
            .update(packet.payload.len(), now_ms);

        if !self.receive_packet(packet, now_ms) {
            return false;
        }

        self.stream.packets_repaired += 1;

        true
    }

    /// Missing packets due for a NACK, already packed into RTCP. Updates the
    /// stream's nack counters.
    pub fn poll_nack(&mut self, now_ms: u64) -> Option<TransportLayerNack> {
        let generator = self.nack_generator.as_mut()?;
        let missing = generator.poll_missing(now_ms);
        if missing.is_empty() {
            return None;
        }

        self.stream.nack_count += 1;
        self.stream.nack_rtp_packet_count += missing.len() as u64;

        Some(TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: self.stream.ssrc(),
            nacks: pack_nack_pairs(&missing),
        })
    }

    /// Build the RTCP key-frame request this stream supports, if any.
    pub fn request_key_frame(&mut self) -> Option<Box<dyn rtcp::packet::Packet>> {
        let params = self.stream.params();
        if params.use_pli {
            self.stream.pli_count += 1;
            Some(Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: self.stream.ssrc(),
            }))
        } else if params.use_fir {
            self.fir_seq = self.fir_seq.wrapping_add(1);
            self.stream.fir_count += 1;
            Some(Box::new(FullIntraRequest {
                sender_ssrc: 0,
                media_ssrc: self.stream.ssrc(),
                fir: vec![FirEntry {
                    ssrc: self.stream.ssrc(),
                    sequence_number: self.fir_seq,
                }],
            }))
        } else {
            None
        }
    }

    pub fn key_frame_request_kind(&self) -> Option<KeyFrameRequestKind> {
        let params = self.stream.params();
        if params.use_pli {
            Some(KeyFrameRequestKind::Pli)
        } else if params.use_fir {
            Some(KeyFrameRequestKind::Fir)
        } else {
            None
        }
    }

    /// NTP anchor from a sender report, for the `lastSenderReport` field of
    /// our receiver reports.
    pub fn receive_sender_report(&mut self, sr: &rtcp::sender_report::SenderReport, now_ms: u64) {
        self.last_sr_ntp = (sr.ntp_time >> 16) as u32;
        self.last_sr_received_ms = now_ms;
    }

    /// Build the reception report block for this stream and refresh
    /// `fraction_lost`/`packets_lost`. Returns the block plus a score change
    /// if the loss sample moved the quality score.
    pub fn get_rtcp_reception_report(&mut self, now_ms: u64) -> (ReceptionReport, Option<u8>) {
        let expected = self.stream.expected_packets();
        let received = self.stream.transmission_counter.packet_count() as u32;

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0u8
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        self.stream.fraction_lost = fraction_lost;
        self.stream.packets_lost = (expected.saturating_sub(received)).min(0x00FF_FFFF);

        // an interval with no expected packets says nothing about quality
        let score_change = if expected_interval > 0 {
            self.stream.update_score(fraction_lost)
        } else {
            None
        };

        let delay = if self.last_sr_received_ms == 0 {
            0
        } else {
            (now_ms.saturating_sub(self.last_sr_received_ms) * 65536 / 1000) as u32
        };

        let report = ReceptionReport {
            ssrc: self.stream.ssrc(),
            fraction_lost,
            total_lost: self.stream.packets_lost,
            last_sequence_number: self.stream.extended_highest_seq(),
            jitter: self.jitter as u32,
            last_sender_report: self.last_sr_ntp,
            delay,
        };

        (report, score_change)
    }

    /// Periodic silence check: with no packet since the previous check the
    /// monitor is fed total loss. Returns a score change, if any.
    pub fn check_inactivity(&mut self) -> Option<u8> {
        let packets = self.stream.transmission_counter.packet_count();
        let inactive = packets == self.packets_at_last_check;
        self.packets_at_last_check = packets;

        if inactive {
            self.stream.update_score(255)
        } else {
            None
        }
    }

    fn update_jitter(&mut self, rtp_ts: u32, now_ms: u64) {
        let clock_rate = self.stream.clock_rate() as i64;
        if clock_rate == 0 {
            return;
        }

        let arrival = now_ms as i64 * clock_rate / 1000;
        let transit = arrival - rtp_ts as i64;
        let d = (transit - self.transit).abs();

        if self.transit != 0 {
            self.jitter += (d as f64 - self.jitter) / 16.0;
        }
        self.transit = transit;
    }
}

/// Pack sorted missing sequence numbers into RFC 4585 pid/blp pairs.
fn pack_nack_pairs(missing: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = vec![];

    for &seq in missing {
        if let Some(pair) = pairs.last_mut() {
            let distance = seq.wrapping_sub(pair.packet_id);
            if (1..=16).contains(&distance) {
                pair.lost_packets |= 1 << (distance - 1);
                continue;
            }
        }
        pairs.push(NackPair {
            packet_id: seq,
            lost_packets: 0,
        });
    }

    pairs
}
