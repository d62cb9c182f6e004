use bytes::{BufMut, BytesMut};
use log::debug;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{
    SdesType, SourceDescription, SourceDescriptionChunk, SourceDescriptionItem,
};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

use crate::rtp::stream::{RtpStream, RtpStreamParams};


// Power of two so the ring index distributes evenly across the wrap.
const RETRANSMISSION_BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
struct StoredPacket {
    seq: u16,
    packet: rtp::packet::Packet,
}

/// Egress direction of a consumer stream: send-side accounting, a
/// retransmission ring buffer answering NACKs over RTX, and sender-report
/// generation.
#[derive(Debug)]
pub struct RtpStreamSend {
    pub(crate) stream: RtpStream,
    buffer: Vec<Option<StoredPacket>>,
    rtx_seq: u16,
    rtt_ms: f32,
}

impl RtpStreamSend {
    pub fn new(params: RtpStreamParams) -> Self {
        let buffer_size = if params.use_nack {
            RETRANSMISSION_BUFFER_SIZE
        } else {
            0
        };
        let mut buffer = Vec::with_capacity(buffer_size);
        buffer.resize_with(buffer_size, || None);

        Self {
            stream: RtpStream::new(params),
            buffer,
            rtx_seq: rand::random::<u16>(),
            rtt_ms: 0.0,
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

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    /// Account an outgoing packet and keep a copy for retransmission.
    pub fn receive_packet(&mut self, packet: &rtp::packet::Packet, now_ms: u64) -> bool {
        if !self.stream.receive_packet(packet, now_ms) {
            return false;
        }

        if !self.buffer.is_empty() {
            let seq = packet.header.sequence_number;
            let index = seq as usize % self.buffer.len();
            self.buffer[index] = Some(StoredPacket {
                seq,
                packet: packet.clone(),
            });
        }

        true
    }

    /// Answer a NACK with RTX-encoded retransmissions of whatever is still
    /// buffered.
    pub fn receive_nack(
        &mut self,
        nack: &TransportLayerNack,
        now_ms: u64,
    ) -> Vec<rtp::packet::Packet> {
        let mut retransmissions = vec![];

        self.stream.nack_count += 1;

        if !self.stream.has_rtx() {
            debug!(
                "NACK received but RTX not negotiated [ssrc:{}]",
                self.stream.ssrc()
            );
            return retransmissions;
        }

        for pair in &nack.nacks {
            for seq in pair.into_iter() {
                let Some(stored) = self.get_buffered(seq) else {
                    debug!(
                        "requested packet not in buffer [ssrc:{}, seq:{}]",
                        self.stream.ssrc(),
                        seq
                    );
                    continue;
                };

                let rtx = self.rtx_encode(&stored);
                self.stream
                    .retransmission_counter
                    .update(rtx.payload.len(), now_ms);
                retransmissions.push(rtx);
            }
        }

        self.stream.nack_rtp_packet_count += retransmissions.len() as u64;

        retransmissions
    }

    /// Sender report for this stream, or `None` before the first packet.
    /// `ntp_now` is the wall clock in NTP format.
    pub fn get_rtcp_sender_report(&mut self, now_ms: u64, ntp_now: u64) -> Option<SenderReport> {
        let packet_count = self.stream.transmission_counter.packet_count();
        if packet_count == 0 {
            return None;
        }

        // Extrapolate the RTP timestamp to "now" from the last sent packet.
        let elapsed_ms = now_ms.saturating_sub(self.stream.max_packet_ms());
        let rtp_time = self
            .stream
            .max_packet_ts()
            .wrapping_add((elapsed_ms * self.stream.clock_rate() as u64 / 1000) as u32);

        Some(SenderReport {
            ssrc: self.stream.ssrc(),
            ntp_time: ntp_now,
            rtp_time,
            packet_count: packet_count as u32,
            octet_count: self.stream.transmission_counter.octet_count() as u32,
            ..Default::default()
        })
    }

    pub fn get_rtcp_sdes(&self) -> SourceDescription {
        SourceDescription {
            chunks: vec![SourceDescriptionChunk {
                source: self.stream.ssrc(),
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesCname,
                    text: self.stream.params().cname.clone().into(),
                }],
            }],
        }
    }

    /// Loss and round-trip figures from the remote receiver report. Returns
    /// a score change if the sample moved the quality score.
    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &rtcp::reception_report::ReceptionReport,
        ntp_now: u64,
    ) -> Option<u8> {
        self.stream.fraction_lost = report.fraction_lost;
        self.stream.packets_lost = report.total_lost;

        if report.last_sender_report != 0 {
            let ntp_mid = (ntp_now >> 16) as u32;
            let rtt_units = ntp_mid
                .wrapping_sub(report.last_sender_report)
                .wrapping_sub(report.delay);
            // only meaningful when the math did not wrap negative
            if rtt_units < u32::MAX / 2 {
                self.rtt_ms = rtt_units as f32 * 1000.0 / 65536.0;
            }
        }

        self.stream.update_score(report.fraction_lost)
    }

    fn get_buffered(&self, seq: u16) -> Option<rtp::packet::Packet> {
        if self.buffer.is_empty() {
            return None;
        }
        let index = seq as usize % self.buffer.len();
        match &self.buffer[index] {
            Some(stored) if stored.seq == seq => Some(stored.packet.clone()),
            _ => None,
        }
    }

    /// RFC 4588 encapsulation: RTX ssrc and payload type, a dedicated
    /// sequence space, and the original sequence number leading the payload.
    fn rtx_encode(&mut self, packet: &rtp::packet::Packet) -> rtp::packet::Packet {
        let params = self.stream.params();
        let mut rtx = packet.clone();

        if let (Some(rtx_ssrc), Some(rtx_pt)) = (params.rtx_ssrc, params.rtx_payload_type) {
            rtx.header.ssrc = rtx_ssrc;
            rtx.header.payload_type = rtx_pt;
        }
        rtx.header.sequence_number = self.rtx_seq;
        self.rtx_seq = self.rtx_seq.wrapping_add(1);

        let mut payload = BytesMut::with_capacity(2 + packet.payload.len());
        payload.put_u16(packet.header.sequence_number);
        payload.extend_from_slice(&packet.payload);
        rtx.payload = payload.freeze();

        rtx
    }
}
