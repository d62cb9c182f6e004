use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::rtp::parameters::{MediaKind, RtpEncodingParameters, RtpParameters, RID_URI};
use crate::rtp::stream::RtpStreamParams;
use crate::rtp::stream_recv::RtpStreamRecv;
use crate::rtp::{MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS};

#[cfg(test)]
mod producer_test;

const UNKNOWN_SSRC_WARN_INTERVAL_MS: u64 = 1000;
const AUDIO_CHECK_INTERVAL_MS: u64 = 5000;
const VIDEO_CHECK_INTERVAL_MS: u64 = 1000;

/// Audio streams go unhealthy below this score; video only at zero.
const AUDIO_UNHEALTHY_SCORE: u8 = 3;
const HEALTHY_SCORE: u8 = 7;

#[derive(Debug)]
pub enum ProducerEvent {
    NewStream { ssrc: u32 },
    Score { ssrc: u32, score: u8 },
    StreamHealthy { ssrc: u32 },
    StreamUnhealthy { ssrc: u32 },
}

/// Ingress endpoint of one published media track: resolves SSRCs to streams,
/// keeps per-stream A.1 state, generates NACK/PLI/FIR feedback towards the
/// publisher and hands accepted packets upward for fan-out.
pub struct Producer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,

    streams: HashMap<u32, RtpStreamRecv>,
    rtx_ssrc_map: HashMap<u32, u32>,
    stream_healthy: HashMap<u32, bool>,
    rid_ext_id: Option<u8>,

    events: VecDeque<ProducerEvent>,
    pending_feedback: Vec<Box<dyn rtcp::packet::Packet>>,

    max_rtcp_interval_ms: u64,
    last_rtcp_sent_ms: u64,
    check_interval_ms: u64,
    last_check_ms: u64,
    last_unknown_ssrc_warn_ms: u64,
}

impl Producer {
    pub fn new(id: String, kind: MediaKind, rtp_parameters: RtpParameters, paused: bool) -> Self {
        let rid_ext_id = rtp_parameters.header_extension_id(RID_URI);
        let (max_rtcp_interval_ms, check_interval_ms) = match kind {
            MediaKind::Audio => (MAX_AUDIO_INTERVAL_MS, AUDIO_CHECK_INTERVAL_MS),
            MediaKind::Video => (MAX_VIDEO_INTERVAL_MS, VIDEO_CHECK_INTERVAL_MS),
        };

        Self {
            id,
            kind,
            rtp_parameters,
            paused,
            streams: HashMap::new(),
            rtx_ssrc_map: HashMap::new(),
            stream_healthy: HashMap::new(),
            rid_ext_id,
            events: VecDeque::new(),
            pending_feedback: vec![],
            max_rtcp_interval_ms,
            last_rtcp_sent_ms: 0,
            check_interval_ms,
            last_check_ms: 0,
            last_unknown_ssrc_warn_ms: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        // the publisher refreshes on its own; consumers are told via the
        // router so they re-sync
    }

    /// Best stream score, used by consumers for their `score` notification.
    pub fn score(&self) -> u8 {
        self.streams.values().map(|s| s.score()).max().unwrap_or(0)
    }

    pub fn stream_ssrcs(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// The SSRC belongs to one of this producer's streams (media or RTX).
    pub fn owns_ssrc(&self, ssrc: u32) -> bool {
        self.streams.contains_key(&ssrc) || self.rtx_ssrc_map.contains_key(&ssrc)
    }

    /// Whether this producer would accept the packet: an existing stream or
    /// a declared-but-unbound encoding matches it.
    pub fn recognizes(&self, packet: &rtp::packet::Packet) -> bool {
        self.owns_ssrc(packet.header.ssrc) || self.find_encoding(packet).is_some()
    }

    /// Process one decrypted RTP packet. Returns true when the packet must
    /// be fanned out to consumers. RTX packets are unwrapped in place into
    /// their media stream before forwarding.
    pub fn receive_rtp_packet(&mut self, packet: &mut rtp::packet::Packet, now_ms: u64) -> bool {
        let ssrc = packet.header.ssrc;

        if self.streams.contains_key(&ssrc) {
            if self.paused {
                self.count_discarded(ssrc);
                return false;
            }
            let stream = self.streams.get_mut(&ssrc).unwrap();
            let accepted = stream.receive_packet(packet, now_ms);
            self.collect_nack(ssrc, now_ms);
            return accepted;
        }

        if let Some(&media_ssrc) = self.rtx_ssrc_map.get(&ssrc) {
            if self.paused {
                self.count_discarded(media_ssrc);
                return false;
            }
            let stream = self.streams.get_mut(&media_ssrc).unwrap();
            let accepted = stream.receive_rtx_packet(packet, now_ms);
            self.collect_nack(media_ssrc, now_ms);
            return accepted;
        }

        // Unknown SSRC: maybe the first packet of a declared encoding.
        match self.find_encoding(packet) {
            Some(encoding) => {
                self.create_stream(ssrc, &encoding);
                if self.paused {
                    self.count_discarded(ssrc);
                    return false;
                }
                let stream = self.streams.get_mut(&ssrc).unwrap();
                stream.receive_packet(packet, now_ms)
            }
            None => {
                if now_ms.saturating_sub(self.last_unknown_ssrc_warn_ms)
                    >= UNKNOWN_SSRC_WARN_INTERVAL_MS
                {
                    self.last_unknown_ssrc_warn_ms = now_ms;
                    warn!(
                        "no stream found for received packet [producer:{}, ssrc:{}, pt:{}]",
                        self.id, ssrc, packet.header.payload_type
                    );
                } else {
                    debug!(
                        "no stream found for received packet [producer:{}, ssrc:{}]",
                        self.id, ssrc
                    );
                }
                false
            }
        }
    }

    /// Forward a key-frame request from a consumer to the publisher.
    pub fn request_key_frame(&mut self, mapped_ssrc: u32) {
        if self.kind != MediaKind::Video {
            return;
        }

        let ssrcs: Vec<u32> = if self.streams.contains_key(&mapped_ssrc) {
            vec![mapped_ssrc]
        } else {
            // unknown mapping: ask every stream rather than none
            self.streams.keys().copied().collect()
        };

        for ssrc in ssrcs {
            if let Some(stream) = self.streams.get_mut(&ssrc) {
                if let Some(request) = stream.request_key_frame() {
                    self.pending_feedback.push(request);
                }
            }
        }
    }

    pub fn receive_sender_report(
        &mut self,
        sr: &rtcp::sender_report::SenderReport,
        now_ms: u64,
    ) -> bool {
        match self.streams.get_mut(&sr.ssrc) {
            Some(stream) => {
                stream.receive_sender_report(sr, now_ms);
                true
            }
            None => false,
        }
    }

    /// Periodic work: silence detection, NACK retries and receiver reports.
    pub fn handle_timeout(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_check_ms) >= self.check_interval_ms {
            self.last_check_ms = now_ms;

            let ssrcs: Vec<u32> = self.streams.keys().copied().collect();
            for ssrc in ssrcs {
                let score_change = {
                    let stream = self.streams.get_mut(&ssrc).unwrap();
                    stream.check_inactivity()
                };
                if let Some(score) = score_change {
                    self.apply_score(ssrc, score);
                }
                self.collect_nack(ssrc, now_ms);
            }
        }

        if !self.paused
            && (now_ms.saturating_sub(self.last_rtcp_sent_ms) as f64 * 1.15)
                >= self.max_rtcp_interval_ms as f64
        {
            self.last_rtcp_sent_ms = now_ms;

            let ssrcs: Vec<u32> = self.streams.keys().copied().collect();
            let mut reports = vec![];
            let mut score_changes = vec![];
            for ssrc in ssrcs {
                let stream = self.streams.get_mut(&ssrc).unwrap();
                let (report, score_change) = stream.get_rtcp_reception_report(now_ms);
                reports.push(report);
                if let Some(score) = score_change {
                    score_changes.push((ssrc, score));
                }
            }
            for (ssrc, score) in score_changes {
                self.apply_score(ssrc, score);
            }

            if !reports.is_empty() {
                self.pending_feedback
                    .push(Box::new(rtcp::receiver_report::ReceiverReport {
                        reports,
                        ..Default::default()
                    }));
            }
        }
    }

    pub fn poll_timeout(&self, now_ms: u64) -> u64 {
        let check = self.last_check_ms + self.check_interval_ms;
        let rtcp = self.last_rtcp_sent_ms + self.max_rtcp_interval_ms;
        check.min(rtcp).max(now_ms)
    }

    pub fn poll_event(&mut self) -> Option<ProducerEvent> {
        self.events.pop_front()
    }

    /// RTCP packets owed to the publishing endpoint (NACK, PLI, FIR, RR).
    pub fn take_feedback(&mut self) -> Vec<Box<dyn rtcp::packet::Packet>> {
        std::mem::take(&mut self.pending_feedback)
    }

    pub fn dump(&self) -> ProducerDump {
        ProducerDump {
            id: self.id.clone(),
            kind: self.kind,
            paused: self.paused,
            rtp_streams: self
                .streams
                .values()
                .map(|s| {
                    let stream = s.stream();
                    RtpStreamDump {
                        ssrc: stream.ssrc(),
                        rid: stream.params().rid.clone(),
                        payload_type: stream.params().payload_type,
                        score: stream.score(),
                        packets_lost: stream.packets_lost,
                        fraction_lost: stream.fraction_lost,
                        packets_discarded: stream.packets_discarded,
                        packets_repaired: stream.packets_repaired,
                        nack_count: stream.nack_count,
                        pli_count: stream.pli_count,
                        fir_count: stream.fir_count,
                        packet_count: stream.transmission_counter.packet_count(),
                        octet_count: stream.transmission_counter.octet_count(),
                    }
                })
                .collect(),
        }
    }

    fn count_discarded(&mut self, ssrc: u32) {
        if let Some(stream) = self.streams.get_mut(&ssrc) {
            stream.stream_mut().packets_discarded += 1;
        }
    }

    fn collect_nack(&mut self, ssrc: u32, now_ms: u64) {
        if let Some(stream) = self.streams.get_mut(&ssrc) {
            if let Some(nack) = stream.poll_nack(now_ms) {
                self.pending_feedback.push(Box::new(nack));
            }
        }
    }

    /// Match an unknown SSRC against a declared encoding: by ssrc, by the
    /// rid header extension, or by payload type when there is a single
    /// encoding left unbound.
    fn find_encoding(&self, packet: &rtp::packet::Packet) -> Option<RtpEncodingParameters> {
        let ssrc = packet.header.ssrc;

        if let Some(encoding) = self
            .rtp_parameters
            .encodings
            .iter()
            .find(|e| e.ssrc == Some(ssrc))
        {
            return Some(encoding.clone());
        }

        if let Some(ext_id) = self.rid_ext_id {
            if let Some(payload) = packet.header.get_extension(ext_id) {
                let rid = String::from_utf8_lossy(&payload).to_string();
                if let Some(encoding) = self
                    .rtp_parameters
                    .encodings
                    .iter()
                    .find(|e| e.rid.as_deref() == Some(rid.as_str()))
                {
                    if !self.encoding_bound(encoding) {
                        return Some(encoding.clone());
                    }
                }
            }
        }

        // single unbound encoding, payload type matches a media codec
        if self.rtp_parameters.encodings.len() == 1 && self.streams.is_empty() {
            let encoding = &self.rtp_parameters.encodings[0];
            let pt = packet.header.payload_type;
            if self
                .rtp_parameters
                .codecs
                .iter()
                .any(|c| !c.is_rtx() && c.payload_type == pt)
            {
                return Some(encoding.clone());
            }
        }

        None
    }

    fn encoding_bound(&self, encoding: &RtpEncodingParameters) -> bool {
        match encoding.rid.as_deref() {
            Some(rid) => self
                .streams
                .values()
                .any(|s| s.stream().params().rid.as_deref() == Some(rid)),
            None => false,
        }
    }

    fn create_stream(&mut self, ssrc: u32, encoding: &RtpEncodingParameters) {
        let Some(codec) = self.rtp_parameters.media_codec() else {
            return;
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

        let rtx_codec = self.rtp_parameters.rtx_codec();
        let params = RtpStreamParams {
            ssrc,
            payload_type: codec.payload_type,
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            kind: self.kind,
            rid: encoding.rid.clone(),
            cname: self.rtp_parameters.rtcp.cname.clone(),
            rtx_ssrc: encoding.rtx.as_ref().map(|rtx| rtx.ssrc),
            rtx_payload_type: rtx_codec.map(|c| c.payload_type),
            use_nack,
            use_pli,
            use_fir,
        };

        debug!(
            "new RTP stream [producer:{}, ssrc:{}, rid:{:?}]",
            self.id, ssrc, encoding.rid
        );

        if let Some(rtx) = &encoding.rtx {
            self.rtx_ssrc_map.insert(rtx.ssrc, ssrc);
        }
        self.streams.insert(ssrc, RtpStreamRecv::new(params));
        self.stream_healthy.insert(ssrc, true);
        self.events.push_back(ProducerEvent::NewStream { ssrc });
    }

    fn apply_score(&mut self, ssrc: u32, score: u8) {
        self.events.push_back(ProducerEvent::Score { ssrc, score });

        let healthy = self.stream_healthy.entry(ssrc).or_insert(true);
        let unhealthy_now = match self.kind {
            MediaKind::Video => score == 0,
            MediaKind::Audio => score < AUDIO_UNHEALTHY_SCORE,
        };

        if *healthy && unhealthy_now {
            *healthy = false;
            self.events
                .push_back(ProducerEvent::StreamUnhealthy { ssrc });
        } else if !*healthy && score >= HEALTHY_SCORE {
            *healthy = true;
            self.events.push_back(ProducerEvent::StreamHealthy { ssrc });
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDump {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub rtp_streams: Vec<RtpStreamDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStreamDump {
    pub ssrc: u32,
    pub rid: Option<String>,
    pub payload_type: u8,
    pub score: u8,
    pub packets_lost: u32,
    pub fraction_lost: u8,
    pub packets_discarded: u64,
    pub packets_repaired: u64,
    pub nack_count: u64,
    pub pli_count: u64,
    pub fir_count: u64,
    pub packet_count: u64,
    pub octet_count: u64,
}
