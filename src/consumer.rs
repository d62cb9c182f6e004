use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use shared::marshal::Marshal;

use crate::error::{Error, Result};
use crate::rtp::codecs::EncodingContext;
use crate::rtp::parameters::{MediaKind, RtpParameters};
use crate::rtp::seq_manager::SeqManager;
use crate::rtp::stream::RtpStreamParams;
use crate::rtp::stream_send::RtpStreamSend;
use crate::rtp::{MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS};


/// Layer-selection strategy. Only the simple single-encoding forwarder is
/// implemented; the variants exist as the dispatch seam.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
}

#[derive(Debug)]
pub enum ConsumerEvent {
    Score { producer: u8, consumer: u8 },
    KeyFrameRequested,
}

/// Egress endpoint of one subscription: rewrites sequence numbers,
/// timestamps and the SSRC of forwarded packets so the receiver sees a
/// single contiguous stream across producer resyncs and pause/resume.
pub struct Consumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    typ: ConsumerType,
    rtp_parameters: RtpParameters,
    supported_codec_payload_types: HashSet<u8>,

    rtp_stream: RtpStreamSend,
    rtp_seq_manager: SeqManager<u16>,
    rtp_timestamp_manager: SeqManager<u32>,
    sync_required: bool,
    encoding_context: Option<Box<dyn EncodingContext>>,
    key_frame_supported: bool,

    paused: bool,
    producer_paused: bool,
    transport_connected: bool,
    producer_stream_bound: bool,
    producer_score: u8,

    max_rtcp_interval_ms: u64,
    last_rtcp_sent_ms: u64,

    events: VecDeque<ConsumerEvent>,
}

impl Consumer {
    pub fn new(
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        producer_paused: bool,
    ) -> Result<Self> {
        rtp_parameters.validate()?;

        // the simple forwarder sends exactly one stream
        if rtp_parameters.encodings.len() != 1 {
            return Err(Error::TypeError(
                "invalid rtpParameters with encodings size != 1".to_owned(),
            ));
        }
        let encoding = &rtp_parameters.encodings[0];
        let Some(ssrc) = encoding.ssrc else {
            return Err(Error::TypeError("encoding without ssrc".to_owned()));
        };
        let Some(codec) = rtp_parameters.media_codec() else {
            return Err(Error::UnsupportedMedia("no media codec".to_owned()));
        };

        let mut use_nack = false;
        let mut use_pli = false;
        let mut use_fir = false;
        for fb in &codec.rtcp_feedback {
            match (fb.typ.as_str(), fb.parameter.as_str()) {
                ("nack", "") => use_nack = true,
                ("nack", "pli") => use_pli = true,
                ("ccm", "fir") => use_fir = true,
                _ => {}
            }
        }

        let rtx_codec = rtp_parameters.rtx_codec();
        let stream_params = RtpStreamParams {
            ssrc,
            payload_type: codec.payload_type,
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            kind,
            rid: None,
            cname: rtp_parameters.rtcp.cname.clone(),
            rtx_ssrc: encoding.rtx.as_ref().map(|rtx| rtx.ssrc),
            rtx_payload_type: rtx_codec.map(|c| c.payload_type),
            use_nack,
            use_pli,
            use_fir,
        };

        let mut rtp_stream = RtpStreamSend::new(stream_params);
        if paused || producer_paused {
            rtp_stream.stream_mut().pause();
        }

        let max_rtcp_interval_ms = match kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_VIDEO_INTERVAL_MS,
        };

        let supported_codec_payload_types = rtp_parameters.supported_payload_types();

        Ok(Self {
            id,
            producer_id,
            kind,
            typ: ConsumerType::Simple,
            rtp_parameters,
            supported_codec_payload_types,
            rtp_stream,
            rtp_seq_manager: SeqManager::for_seqs(),
            rtp_timestamp_manager: SeqManager::for_timestamps(),
            sync_required: false,
            encoding_context: None,
            key_frame_supported: false,
            paused,
            producer_paused,
            transport_connected: false,
            producer_stream_bound: false,
            producer_score: 0,
            max_rtcp_interval_ms,
            last_rtcp_sent_ms: 0,
            events: VecDeque::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn typ(&self) -> ConsumerType {
        self.typ
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp_stream.ssrc()
    }

    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.rtp_stream.stream().params().rtx_ssrc
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_producer_paused(&self) -> bool {
        self.producer_paused
    }

    /// Codec-specific payload rewriter. Installing one also enables
    /// key-frame detection, which sync waits for.
    pub fn set_encoding_context(&mut self, context: Box<dyn EncodingContext>) {
        self.key_frame_supported = self.kind == MediaKind::Video;
        self.encoding_context = Some(context);
    }

    pub fn is_active(&self) -> bool {
        self.transport_connected
            && !self.paused
            && !self.producer_paused
            && self.producer_stream_bound
    }

    /// Forward one packet from the bound producer stream. On success the
    /// returned bytes are the marshaled rewritten packet ready for SRTP.
    ///
    /// The packet is always restored to its incoming state before this
    /// returns, so the caller can reuse it for the next consumer.
    pub fn send_rtp_packet(
        &mut self,
        packet: &mut rtp::packet::Packet,
        now_ms: u64,
    ) -> Option<Bytes> {
        if !self.is_active() {
            return None;
        }

        if !self
            .supported_codec_payload_types
            .contains(&packet.header.payload_type)
        {
            trace!(
                "payload type not supported [consumer:{}, pt:{}]",
                self.id,
                packet.header.payload_type
            );
            return None;
        }

        // Wait for a key frame after re-sync when we can recognize one.
        if self.sync_required && self.key_frame_supported && !self.is_key_frame(packet) {
            return None;
        }

        let is_sync_packet = self.sync_required;
        if is_sync_packet {
            self.rtp_seq_manager.sync(packet.header.sequence_number);
            self.rtp_timestamp_manager.sync(packet.header.timestamp);

            // Continue the output timestamp from where we left off, advanced
            // by the wall-clock silence since our last sent packet.
            if self.rtp_stream.stream().max_packet_ms() != 0 {
                let diff_ms = now_ms.saturating_sub(self.rtp_stream.stream().max_packet_ms());
                let diff_ts = diff_ms * self.rtp_stream.stream().clock_rate() as u64 / 1000;
                self.rtp_timestamp_manager.offset(diff_ts as u32);
            }

            if let Some(context) = &mut self.encoding_context {
                context.sync_required();
            }

            self.sync_required = false;
        }

        // Rewrite the payload if the codec needs it; a failed rewrite drops
        // the packet but keeps downstream numbering contiguous. The sync
        // latch stays cleared: the next key frame takes the normal path.
        let orig_payload = packet.payload.clone();
        if let Some(context) = &mut self.encoding_context {
            if !context.encode_payload(packet) {
                self.rtp_seq_manager
                    .drop_input(packet.header.sequence_number);
                self.rtp_timestamp_manager.drop_input(packet.header.timestamp);
                packet.payload = orig_payload;
                return None;
            }
        }

        let seq = self.rtp_seq_manager.input(packet.header.sequence_number);
        let timestamp = self.rtp_timestamp_manager.input(packet.header.timestamp);

        let orig_ssrc = packet.header.ssrc;
        let orig_seq = packet.header.sequence_number;
        let orig_timestamp = packet.header.timestamp;

        packet.header.ssrc = self.rtp_parameters.encodings[0].ssrc.unwrap_or(orig_ssrc);
        packet.header.sequence_number = seq;
        packet.header.timestamp = timestamp;

        if is_sync_packet {
            debug!(
                "sending sync packet [consumer:{}, ssrc:{}, seq:{}, ts:{}] from original [seq:{}, ts:{}]",
                self.id, packet.header.ssrc, seq, timestamp, orig_seq, orig_timestamp
            );
        }

        let result = if self.rtp_stream.receive_packet(packet, now_ms) {
            match packet.marshal() {
                Ok(raw) => Some(raw.freeze()),
                Err(err) => {
                    warn!("failed to marshal packet [consumer:{}]: {}", self.id, err);
                    None
                }
            }
        } else {
            warn!(
                "failed to send packet [consumer:{}, ssrc:{}, seq:{}]",
                self.id, packet.header.ssrc, seq
            );
            None
        };

        packet.header.ssrc = orig_ssrc;
        packet.header.sequence_number = orig_seq;
        packet.header.timestamp = orig_timestamp;
        packet.payload = orig_payload;

        result
    }

    /// SR plus SDES, rate limited with 15% slack.
    pub fn get_rtcp(
        &mut self,
        now_ms: u64,
        ntp_now: u64,
    ) -> Option<Vec<Box<dyn rtcp::packet::Packet>>> {
        if (now_ms.saturating_sub(self.last_rtcp_sent_ms) as f64 * 1.15)
            < self.max_rtcp_interval_ms as f64
        {
            return None;
        }

        let report = self.rtp_stream.get_rtcp_sender_report(now_ms, ntp_now)?;
        let sdes = self.rtp_stream.get_rtcp_sdes();
        self.last_rtcp_sent_ms = now_ms;

        Some(vec![Box::new(report), Box::new(sdes)])
    }

    pub fn receive_nack(
        &mut self,
        nack: &rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack,
        now_ms: u64,
    ) -> Vec<rtp::packet::Packet> {
        if !self.is_active() {
            return vec![];
        }
        self.rtp_stream.receive_nack(nack, now_ms)
    }

    pub fn receive_key_frame_request(&mut self) {
        if !self.is_active() {
            return;
        }
        self.rtp_stream.stream_mut().pli_count += 1;
        self.request_key_frame();
    }

    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &rtcp::reception_report::ReceptionReport,
        ntp_now: u64,
    ) {
        if let Some(_score) = self.rtp_stream.receive_rtcp_receiver_report(report, ntp_now) {
            self.emit_score();
        }
    }

    pub fn set_transport_connected(&mut self, connected: bool) {
        self.transport_connected = connected;
        if connected {
            self.request_key_frame();
        }
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.rtp_stream.stream_mut().pause();
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.on_resumed(false);
    }

    pub fn set_producer_paused(&mut self) {
        if self.producer_paused {
            return;
        }
        self.producer_paused = true;
        self.rtp_stream.stream_mut().pause();
    }

    pub fn set_producer_resumed(&mut self) {
        if !self.producer_paused {
            return;
        }
        self.producer_paused = false;
        self.on_resumed(true);
    }

    /// The producer created the stream this consumer forwards.
    pub fn producer_new_stream(&mut self, score: u8) {
        self.producer_stream_bound = true;
        self.producer_score = score;
        self.emit_score();
    }

    pub fn producer_score_changed(&mut self, score: u8) {
        self.producer_score = score;
        self.emit_score();
    }

    pub fn poll_event(&mut self) -> Option<ConsumerEvent> {
        self.events.pop_front()
    }

    pub fn dump(&self) -> ConsumerDump {
        let stream = self.rtp_stream.stream();
        ConsumerDump {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            typ: self.typ,
            paused: self.paused,
            producer_paused: self.producer_paused,
            ssrc: stream.ssrc(),
            score: stream.score(),
            producer_score: self.producer_score,
            packet_count: stream.transmission_counter.packet_count(),
            octet_count: stream.transmission_counter.octet_count(),
            nack_count: stream.nack_count,
            pli_count: stream.pli_count,
            rtt_ms: self.rtp_stream.rtt_ms(),
        }
    }

    fn on_resumed(&mut self, was_producer: bool) {
        if !self.paused && !self.producer_paused {
            self.rtp_stream.stream_mut().resume();
        }

        // Re-sync and wait for a key frame, otherwise the receiver floods us
        // with NACKs for packets it never saw.
        self.sync_required = true;

        // A producer resume already asked the publisher for a key frame.
        if !was_producer {
            self.request_key_frame();
        }
    }

    fn request_key_frame(&mut self) {
        if !self.is_active() || self.kind != MediaKind::Video {
            return;
        }
        self.events.push_back(ConsumerEvent::KeyFrameRequested);
    }

    fn is_key_frame(&self, packet: &rtp::packet::Packet) -> bool {
        self.encoding_context
            .as_ref()
            .map(|context| context.is_key_frame(packet))
            .unwrap_or(false)
    }

    fn emit_score(&mut self) {
        self.events.push_back(ConsumerEvent::Score {
            producer: self.producer_score,
            consumer: self.rtp_stream.score(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDump {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(rename = "type")]
    pub typ: ConsumerType,
    pub paused: bool,
    pub producer_paused: bool,
    pub ssrc: u32,
    pub score: u8,
    pub producer_score: u8,
    pub packet_count: u64,
    pub octet_count: u64,
    pub nack_count: u64,
    pub pli_count: u64,
    pub rtt_ms: f32,
}
