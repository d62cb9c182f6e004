use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use shared::time::SystemInstant;
use shared::Transmit;
use stun::message::Message;

use crate::consumer::{Consumer, ConsumerEvent};
use crate::error::{Error, Result};
use crate::messages::{demux, Demuxed};
use crate::producer::{Producer, ProducerEvent};
use crate::rtp::parameters::{MediaKind, RtpParameters};
use crate::transport::certificate::Certificate;
use crate::transport::dtls::{DtlsParameters, DtlsRole, DtlsState, DtlsTransport};
use crate::transport::ice::{
    host_candidate_priority, IceCandidate, IceServer, IceServerEvent, IceState,
};
use crate::transport::tuple::{TransportTuple, TransportTupleDump};

pub mod certificate;
pub mod dtls;
pub mod ice;
pub mod tuple;

#[cfg(test)]
mod transport_test;

/// One local address a transport is reachable on. Sockets are owned by the
/// embedder; the transport only needs to know what exists so it can
/// synthesize candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenInfo {
    pub addr: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_infos: Vec<ListenInfo>,
}

/// Everything the supervisor needs to build the answer side of the
/// negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectInfo {
    pub ice_username_fragment: String,
    pub ice_password: String,
    pub ice_lite: bool,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_fingerprints: Vec<certificate::DtlsFingerprint>,
    pub dtls_role: DtlsRole,
}

#[derive(Debug)]
pub enum TransportEvent {
    IceStateChange(IceState),
    IceSelectedTupleChange(TransportTupleDump),
    DtlsStateChange(DtlsState),
    ProducerStream { producer_id: String, ssrc: u32 },
    ProducerScore { producer_id: String, ssrc: u32, score: u8 },
    ProducerStreamHealthy { producer_id: String, ssrc: u32 },
    ProducerStreamUnhealthy { producer_id: String, ssrc: u32 },
    ConsumerScore { consumer_id: String, producer_score: u8, consumer_score: u8 },
    ConsumerKeyFrameRequested { consumer_id: String },
    Remb { bitrate: u32 },
}

/// WebRTC server-side transport: demultiplexes incoming datagrams into
/// STUN / DTLS / SRTP / SRTCP, owns the ICE-lite server, the DTLS endpoint
/// and both SRTP contexts, and owns the producers and consumers living on
/// this peer connection.
pub struct WebRtcTransport {
    id: String,
    clock: SystemInstant,

    ice_server: IceServer,
    ice_candidates: Vec<IceCandidate>,
    dtls: DtlsTransport,
    srtp_recv: Option<srtp::context::Context>,
    srtp_send: Option<srtp::context::Context>,

    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    /// First-level demap of incoming RTP: declared and discovered SSRCs.
    ssrc_table: HashMap<u32, String>,

    transmits: VecDeque<Transmit<BytesMut>>,
    events: VecDeque<TransportEvent>,
    connected: bool,
    closed: bool,

    /// Burst detection for SRTP unprotect failures; a spike usually means a
    /// stale key during a rekey, not a broken transport.
    srtp_decrypt_failures: u32,
    srtp_decrypt_failure_window_ms: u64,
}

const SRTP_DECRYPT_FAILURE_THRESHOLD: u32 = 50;
const SRTP_DECRYPT_FAILURE_WINDOW_MS: u64 = 1000;

impl WebRtcTransport {
    pub fn new(id: String, options: WebRtcTransportOptions, clock: SystemInstant) -> Result<Self> {
        if options.listen_infos.is_empty() {
            return Err(Error::TypeError("missing listenInfos".to_owned()));
        }

        let certificate = Certificate::generate()?;

        let mut ice_candidates = vec![];
        for (index, info) in options.listen_infos.iter().enumerate() {
            let ip = info
                .announced_ip
                .clone()
                .unwrap_or_else(|| info.addr.ip().to_string());
            ice_candidates.push(IceCandidate {
                foundation: format!("rtcsfu{index}"),
                priority: host_candidate_priority(u16::MAX - index as u16),
                ip,
                port: info.addr.port(),
                protocol: match info.protocol {
                    TransportProtocol::Udp => "udp".to_owned(),
                    TransportProtocol::Tcp => "tcp".to_owned(),
                },
                typ: "host".to_owned(),
            });
        }

        Ok(Self {
            id,
            clock,
            ice_server: IceServer::new(),
            ice_candidates,
            dtls: DtlsTransport::new(certificate),
            srtp_recv: None,
            srtp_send: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            ssrc_table: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            connected: false,
            closed: false,
            srtp_decrypt_failures: 0,
            srtp_decrypt_failure_window_ms: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connect_info(&self) -> TransportConnectInfo {
        TransportConnectInfo {
            ice_username_fragment: self.ice_server.username_fragment().to_owned(),
            ice_password: self.ice_server.password().to_owned(),
            ice_lite: true,
            ice_candidates: self.ice_candidates.clone(),
            dtls_fingerprints: self.dtls.get_fingerprints(),
            dtls_role: DtlsRole::Auto,
        }
    }

    /// `transport.connect`: the remote DTLS parameters arrived.
    pub fn connect(&mut self, dtls_parameters: DtlsParameters) -> Result<DtlsRole> {
        self.dtls.set_remote_parameters(dtls_parameters)?;
        self.may_run_dtls();
        Ok(self.dtls.local_role())
    }

    /// `transport.restartIce`: new credentials, candidate state dropped.
    pub fn restart_ice(&mut self, now: Instant) -> (String, String) {
        self.ice_server.restart();
        self.drain_ice(now);
        (
            self.ice_server.username_fragment().to_owned(),
            self.ice_server.password().to_owned(),
        )
    }

    /// ICE connected or completed, DTLS done, SRTP keyed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.ice_server.state(),
            IceState::Connected | IceState::Completed
        ) && self.dtls.state() == DtlsState::Connected
            && self.srtp_recv.is_some()
            && self.srtp_send.is_some()
    }

    pub fn produce(
        &mut self,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    ) -> Result<()> {
        rtp_parameters.validate()?;

        if self.producers.contains_key(&producer_id) {
            return Err(Error::AlreadyExists(format!(
                "a Producer with same id \"{producer_id}\" exists"
            )));
        }

        let mut declared = vec![];
        for encoding in &rtp_parameters.encodings {
            if let Some(ssrc) = encoding.ssrc {
                declared.push(ssrc);
            }
            if let Some(rtx) = &encoding.rtx {
                declared.push(rtx.ssrc);
            }
        }
        for ssrc in &declared {
            if self.ssrc_table.contains_key(ssrc) {
                return Err(Error::AlreadyExists(format!(
                    "ssrc {ssrc} already handled by another Producer"
                )));
            }
        }

        for ssrc in declared {
            self.ssrc_table.insert(ssrc, producer_id.clone());
        }
        self.producers.insert(
            producer_id.clone(),
            Producer::new(producer_id, kind, rtp_parameters, paused),
        );

        Ok(())
    }

    pub fn consume(
        &mut self,
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        producer_paused: bool,
    ) -> Result<()> {
        if self.consumers.contains_key(&consumer_id) {
            return Err(Error::AlreadyExists(format!(
                "a Consumer with same id \"{consumer_id}\" exists"
            )));
        }

        let mut consumer = Consumer::new(
            consumer_id.clone(),
            producer_id,
            kind,
            rtp_parameters,
            paused,
            producer_paused,
        )?;
        if self.connected {
            consumer.set_transport_connected(true);
        }

        self.consumers.insert(consumer_id.clone(), consumer);
        self.drain_consumer(&consumer_id);

        Ok(())
    }

    pub fn get_producer(&self, producer_id: &str) -> Option<&Producer> {
        self.producers.get(producer_id)
    }

    pub fn get_producer_mut(&mut self, producer_id: &str) -> Option<&mut Producer> {
        self.producers.get_mut(producer_id)
    }

    pub fn get_consumer(&self, consumer_id: &str) -> Option<&Consumer> {
        self.consumers.get(consumer_id)
    }

    pub fn get_consumer_mut(&mut self, consumer_id: &str) -> Option<&mut Consumer> {
        self.consumers.get_mut(consumer_id)
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.keys().cloned().collect()
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    pub fn close_producer(&mut self, producer_id: &str) -> Result<()> {
        if self.producers.remove(producer_id).is_none() {
            return Err(Error::NotFound(format!(
                "Producer not found [id:{producer_id}]"
            )));
        }
        self.ssrc_table.retain(|_, id| id != producer_id);
        Ok(())
    }

    pub fn close_consumer(&mut self, consumer_id: &str) -> Result<()> {
        self.consumers
            .remove(consumer_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Consumer not found [id:{consumer_id}]")))
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.dtls.close();
        self.srtp_recv = None;
        self.srtp_send = None;
        self.producers.clear();
        self.consumers.clear();
        self.ssrc_table.clear();
    }

    /// One datagram / framed TCP payload in. Returns the producer id and
    /// parsed packet when the router must fan it out.
    pub fn handle_transmit(
        &mut self,
        msg: Transmit<BytesMut>,
    ) -> Option<(String, rtp::packet::Packet)> {
        if self.closed {
            return None;
        }

        let now = msg.now;
        let now_ms = self.unix_ms(now);
        let tuple = TransportTuple::from(&msg.transport);

        match demux(msg.message) {
            Demuxed::Stun(message) => {
                self.on_stun_data(message, tuple, now, now_ms);
                None
            }
            Demuxed::Dtls(message) => {
                self.on_dtls_data(message, tuple, now);
                None
            }
            Demuxed::Rtp(message) => self.on_rtp_data(message, tuple, now, now_ms),
            Demuxed::Rtcp(message) => {
                self.on_rtcp_data(message, tuple, now, now_ms);
                None
            }
            Demuxed::Unknown(message) => {
                trace!(
                    "ignoring wrong packet of {} bytes from {}",
                    message.len(),
                    tuple.remote_addr
                );
                None
            }
        }
    }

    /// Forward a packet to one of this transport's consumers: rewrite,
    /// encrypt, queue for the selected tuple.
    pub fn send_consumer_rtp(
        &mut self,
        consumer_id: &str,
        packet: &mut rtp::packet::Packet,
        now: Instant,
    ) {
        let now_ms = self.unix_ms(now);

        let Some(consumer) = self.consumers.get_mut(consumer_id) else {
            return;
        };
        let plaintext = consumer.send_rtp_packet(packet, now_ms);
        self.drain_consumer(consumer_id);

        if let Some(raw) = plaintext {
            self.send_rtp_raw(&raw, now);
        }
    }

    /// Encrypt and queue RTCP packets as one compound datagram.
    pub fn send_rtcp(&mut self, packets: &[Box<dyn rtcp::packet::Packet>], now: Instant) {
        if packets.is_empty() {
            return;
        }
        let Some(tuple) = self.ice_server.selected_tuple() else {
            trace!("no selected tuple, cannot send RTCP");
            return;
        };
        let Some(srtp_send) = self.srtp_send.as_mut() else {
            trace!("SRTP send session not ready, cannot send RTCP");
            return;
        };

        let compound = match rtcp::packet::marshal(packets) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to marshal RTCP compound: {}", err);
                return;
            }
        };

        match srtp_send.encrypt_rtcp(&compound) {
            Ok(encrypted) => self.transmits.push_back(Transmit {
                now,
                transport: tuple.to_context(),
                message: encrypted,
            }),
            Err(err) => warn!("RTCP encrypt failed: {}", err),
        }
    }

    /// Forward a key-frame request to one of this transport's producers and
    /// flush the resulting RTCP towards the publisher.
    pub fn request_producer_key_frame(&mut self, producer_id: &str, now: Instant) {
        if let Some(producer) = self.producers.get_mut(producer_id) {
            // 0 never matches a stream, so the producer asks all of them
            let mapped_ssrc = 0;
            producer.request_key_frame(mapped_ssrc);
        }
        self.drain_producer(producer_id, now);
    }

    /// The bitrate estimator reported a new value: tell the sender via REMB
    /// and surface it upward.
    pub fn on_remote_bitrate_estimate(&mut self, ssrcs: Vec<u32>, bitrate: u32, now: Instant) {
        let remb = rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: bitrate as f32,
            ssrcs,
        };
        let packets: Vec<Box<dyn rtcp::packet::Packet>> = vec![Box::new(remb)];
        self.send_rtcp(&packets, now);
        self.events.push_back(TransportEvent::Remb { bitrate });
    }

    /// Periodic work for every owned state machine.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        let now_ms = self.unix_ms(now);

        self.ice_server.handle_timeout(now_ms);
        self.drain_ice(now);

        self.dtls.handle_timeout(now);
        self.drain_dtls(now);

        let producer_ids = self.producer_ids();
        for producer_id in producer_ids {
            if let Some(producer) = self.producers.get_mut(&producer_id) {
                producer.handle_timeout(now_ms);
            }
            self.drain_producer(&producer_id, now);
        }

        let ntp_now = self.clock.ntp(now);
        let consumer_ids = self.consumer_ids();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                if let Some(rtcp) = consumer.get_rtcp(now_ms, ntp_now) {
                    self.send_rtcp(&rtcp, now);
                }
            }
            self.drain_consumer(&consumer_id);
        }
    }

    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        if self.closed {
            return None;
        }

        let mut eto = now + std::time::Duration::from_secs(3600);

        if let Some(deadline_ms) = self.ice_server.poll_timeout() {
            let deadline = self
                .clock
                .instant(std::time::Duration::from_millis(deadline_ms));
            if deadline < eto {
                eto = deadline;
            }
        }
        self.dtls.poll_timeout(&mut eto);

        let now_ms = self.unix_ms(now);
        for producer in self.producers.values() {
            let deadline = self
                .clock
                .instant(std::time::Duration::from_millis(producer.poll_timeout(now_ms)));
            if deadline < eto {
                eto = deadline;
            }
        }

        Some(eto)
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit<BytesMut>> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Test hook: mark the transport connected without running ICE/DTLS.
    #[cfg(test)]
    pub(crate) fn force_connected_for_test(&mut self) {
        self.connected = true;
        let consumer_ids = self.consumer_ids();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.set_transport_connected(true);
            }
            self.drain_consumer(&consumer_id);
        }
    }

    /// Test hook: feed an already-decrypted RTP packet into the producer
    /// path, skipping the SRTP layer.
    #[cfg(test)]
    pub(crate) fn receive_rtp_for_test(
        &mut self,
        packet: &mut rtp::packet::Packet,
        now: Instant,
    ) -> Option<(String, rtp::packet::Packet)> {
        let now_ms = self.unix_ms(now);
        let producer_id = self.find_producer_for_packet(packet)?;
        let forward = self
            .producers
            .get_mut(&producer_id)?
            .receive_rtp_packet(packet, now_ms);
        self.drain_producer(&producer_id, now);
        forward.then(|| (producer_id, packet.clone()))
    }

    pub fn dump(&self) -> TransportDump {
        TransportDump {
            id: self.id.clone(),
            ice_state: self.ice_server.state(),
            ice_selected_tuple: self.ice_server.selected_tuple().map(|t| t.dump()),
            ice_tuples: self.ice_server.tuple_dumps(),
            dtls_state: self.dtls.state(),
            producer_ids: self.producer_ids(),
            consumer_ids: self.consumer_ids(),
        }
    }

    fn unix_ms(&self, now: Instant) -> u64 {
        self.clock.unix(now).as_millis() as u64
    }

    fn on_stun_data(&mut self, message: BytesMut, tuple: TransportTuple, now: Instant, now_ms: u64) {
        let mut stun_message = Message {
            raw: message.to_vec(),
            ..Default::default()
        };
        if let Err(err) = stun_message.decode() {
            warn!("malformed STUN packet from {}: {}", tuple.remote_addr, err);
            return;
        }

        self.ice_server
            .process_stun_message(&mut stun_message, tuple, now, now_ms);
        self.drain_ice(now);
    }

    fn on_dtls_data(&mut self, message: BytesMut, tuple: TransportTuple, now: Instant) {
        if !self.dtls.is_running() {
            debug!(
                "ignoring DTLS data, transport not started [from:{}]",
                tuple.remote_addr
            );
            return;
        }

        // application data (SCTP) is out of scope; only the handshake and
        // key export matter here
        let _ = self.dtls.read(now, tuple.remote_addr, None, message);
        self.drain_dtls(now);
    }

    fn on_rtp_data(
        &mut self,
        message: BytesMut,
        tuple: TransportTuple,
        now: Instant,
        now_ms: u64,
    ) -> Option<(String, rtp::packet::Packet)> {
        let srtp_recv = match self.srtp_recv.as_mut() {
            Some(context) => context,
            None => {
                debug!("ignoring RTP packet, SRTP not ready [from:{}]", tuple.remote_addr);
                return None;
            }
        };

        let decrypted = match srtp_recv.decrypt_rtp(&message) {
            Ok(decrypted) => decrypted,
            Err(err) => {
                debug!("SRTP decrypt failed [from:{}]: {}", tuple.remote_addr, err);
                self.on_srtp_decrypt_failure(now_ms);
                return None;
            }
        };

        let mut buf = &decrypted[..];
        let mut packet = match <rtp::packet::Packet as shared::marshal::Unmarshal>::unmarshal(
            &mut buf,
        ) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("malformed RTP packet [from:{}]: {}", tuple.remote_addr, err);
                return None;
            }
        };

        let producer_id = match self.find_producer_for_packet(&packet) {
            Some(producer_id) => producer_id,
            None => {
                trace!(
                    "no producer for RTP packet [ssrc:{}, pt:{}]",
                    packet.header.ssrc,
                    packet.header.payload_type
                );
                return None;
            }
        };

        let forward = {
            let producer = self.producers.get_mut(&producer_id)?;
            producer.receive_rtp_packet(&mut packet, now_ms)
        };

        // newly discovered ssrcs (by rid or payload type) land in the demap
        if let Some(producer) = self.producers.get(&producer_id) {
            if producer.owns_ssrc(packet.header.ssrc) {
                self.ssrc_table
                    .entry(packet.header.ssrc)
                    .or_insert_with(|| producer_id.clone());
            }
        }

        self.drain_producer(&producer_id, now);

        if forward {
            Some((producer_id, packet))
        } else {
            None
        }
    }

    fn on_rtcp_data(&mut self, message: BytesMut, tuple: TransportTuple, now: Instant, now_ms: u64) {
        let srtp_recv = match self.srtp_recv.as_mut() {
            Some(context) => context,
            None => {
                debug!("ignoring RTCP packet, SRTP not ready [from:{}]", tuple.remote_addr);
                return;
            }
        };

        let decrypted = match srtp_recv.decrypt_rtcp(&message) {
            Ok(decrypted) => decrypted,
            Err(err) => {
                debug!("SRTCP decrypt failed [from:{}]: {}", tuple.remote_addr, err);
                self.on_srtp_decrypt_failure(now_ms);
                return;
            }
        };

        let mut buf = &decrypted[..];
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(err) => {
                warn!("malformed RTCP compound [from:{}]: {}", tuple.remote_addr, err);
                return;
            }
        };

        for packet in packets {
            self.dispatch_rtcp(packet.as_ref(), now, now_ms);
        }
    }

    fn dispatch_rtcp(
        &mut self,
        packet: &(dyn rtcp::packet::Packet),
        now: Instant,
        now_ms: u64,
    ) {
        let any = packet.as_any();
        let ntp_now = self.clock.ntp(now);

        if let Some(sr) = any.downcast_ref::<rtcp::sender_report::SenderReport>() {
            for producer in self.producers.values_mut() {
                if producer.receive_sender_report(sr, now_ms) {
                    return;
                }
            }
        } else if let Some(rr) = any.downcast_ref::<rtcp::receiver_report::ReceiverReport>() {
            for report in &rr.reports {
                let consumer_id = self
                    .consumers
                    .values()
                    .find(|c| c.ssrc() == report.ssrc)
                    .map(|c| c.id().to_owned());
                if let Some(consumer_id) = consumer_id {
                    if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                        consumer.receive_rtcp_receiver_report(report, ntp_now);
                    }
                    self.drain_consumer(&consumer_id);
                }
            }
        } else if let Some(nack) =
            any.downcast_ref::<rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack>()
        {
            let consumer_id = self
                .consumers
                .values()
                .find(|c| c.ssrc() == nack.media_ssrc)
                .map(|c| c.id().to_owned());
            if let Some(consumer_id) = consumer_id {
                let retransmissions = self
                    .consumers
                    .get_mut(&consumer_id)
                    .map(|c| c.receive_nack(nack, now_ms))
                    .unwrap_or_default();
                for rtx in retransmissions {
                    match <rtp::packet::Packet as shared::marshal::Marshal>::marshal(&rtx) {
                        Ok(raw) => self.send_rtp_raw(&raw, now),
                        Err(err) => warn!("failed to marshal RTX packet: {}", err),
                    }
                }
            }
        } else if let Some(pli) =
            any.downcast_ref::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
        {
            self.on_key_frame_request(pli.media_ssrc);
        } else if let Some(fir) =
            any.downcast_ref::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
        {
            for entry in &fir.fir {
                self.on_key_frame_request(entry.ssrc);
            }
        } else {
            trace!("unhandled RTCP packet type");
        }
    }

    fn on_key_frame_request(&mut self, media_ssrc: u32) {
        let consumer_id = self
            .consumers
            .values()
            .find(|c| c.ssrc() == media_ssrc)
            .map(|c| c.id().to_owned());
        if let Some(consumer_id) = consumer_id {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.receive_key_frame_request();
            }
            self.drain_consumer(&consumer_id);
        }
    }

    fn on_srtp_decrypt_failure(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.srtp_decrypt_failure_window_ms)
            >= SRTP_DECRYPT_FAILURE_WINDOW_MS
        {
            self.srtp_decrypt_failure_window_ms = now_ms;
            self.srtp_decrypt_failures = 0;
        }
        self.srtp_decrypt_failures += 1;
        if self.srtp_decrypt_failures == SRTP_DECRYPT_FAILURE_THRESHOLD {
            warn!(
                "{} SRTP decrypt failures within {} ms, possible stale key",
                self.srtp_decrypt_failures, SRTP_DECRYPT_FAILURE_WINDOW_MS
            );
            // surface as a dtls state "warning" without tearing anything down
            self.events
                .push_back(TransportEvent::DtlsStateChange(self.dtls.state()));
        }
    }

    fn find_producer_for_packet(&self, packet: &rtp::packet::Packet) -> Option<String> {
        if let Some(producer_id) = self.ssrc_table.get(&packet.header.ssrc) {
            return Some(producer_id.clone());
        }

        // by rid header extension or payload type fallback
        self.producers
            .values()
            .find(|p| p.recognizes(packet))
            .map(|p| p.id().to_owned())
    }

    fn send_rtp_raw(&mut self, plaintext: &[u8], now: Instant) {
        let Some(tuple) = self.ice_server.selected_tuple() else {
            trace!("no selected tuple, cannot send RTP");
            return;
        };
        let Some(srtp_send) = self.srtp_send.as_mut() else {
            trace!("SRTP send session not ready, cannot send RTP");
            return;
        };

        match srtp_send.encrypt_rtp(plaintext) {
            Ok(encrypted) => self.transmits.push_back(Transmit {
                now,
                transport: tuple.to_context(),
                message: encrypted,
            }),
            Err(err) => warn!("RTP encrypt failed: {}", err),
        }
    }

    fn may_run_dtls(&mut self) {
        if self.dtls.is_running() || !self.dtls.role_resolved() {
            return;
        }
        let Some(tuple) = self.ice_server.selected_tuple() else {
            return;
        };
        if !matches!(
            self.ice_server.state(),
            IceState::Connected | IceState::Completed
        ) {
            return;
        }

        if let Err(err) = self
            .dtls
            .run(tuple.local_addr, tuple.protocol, tuple.remote_addr)
        {
            warn!("failed to start DTLS transport: {}", err);
        }
    }

    fn drain_ice(&mut self, now: Instant) {
        while let Some(transmit) = self.ice_server.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        while let Some(event) = self.ice_server.poll_event() {
            match event {
                IceServerEvent::StateChange(state) => {
                    self.events.push_back(TransportEvent::IceStateChange(state));
                }
                IceServerEvent::SelectedTuple(tuple) => {
                    self.events
                        .push_back(TransportEvent::IceSelectedTupleChange(tuple.dump()));
                }
            }
        }
        self.may_run_dtls();
        self.update_connected(now);
    }

    fn drain_dtls(&mut self, now: Instant) {
        while let Some(transmit) = self.dtls.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        while let Some(state) = self.dtls.poll_state_change() {
            self.events.push_back(TransportEvent::DtlsStateChange(state));
        }
        if let Some((local_context, remote_context)) = self.dtls.take_srtp_contexts() {
            self.srtp_send = Some(local_context);
            self.srtp_recv = Some(remote_context);
        }
        self.update_connected(now);
    }

    fn update_connected(&mut self, _now: Instant) {
        let connected = self.is_connected();
        if connected == self.connected {
            return;
        }
        self.connected = connected;

        let consumer_ids = self.consumer_ids();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                consumer.set_transport_connected(connected);
            }
            self.drain_consumer(&consumer_id);
        }
    }

    fn drain_producer(&mut self, producer_id: &str, now: Instant) {
        let mut feedback = vec![];
        let mut events = vec![];
        if let Some(producer) = self.producers.get_mut(producer_id) {
            feedback = producer.take_feedback();
            while let Some(event) = producer.poll_event() {
                events.push(event);
            }
        }

        self.send_rtcp(&feedback, now);

        for event in events {
            let producer_id = producer_id.to_owned();
            match event {
                ProducerEvent::NewStream { ssrc } => {
                    self.ssrc_table.insert(ssrc, producer_id.clone());
                    self.events
                        .push_back(TransportEvent::ProducerStream { producer_id, ssrc });
                }
                ProducerEvent::Score { ssrc, score } => {
                    self.events.push_back(TransportEvent::ProducerScore {
                        producer_id,
                        ssrc,
                        score,
                    });
                }
                ProducerEvent::StreamHealthy { ssrc } => {
                    self.events
                        .push_back(TransportEvent::ProducerStreamHealthy { producer_id, ssrc });
                }
                ProducerEvent::StreamUnhealthy { ssrc } => {
                    self.events
                        .push_back(TransportEvent::ProducerStreamUnhealthy { producer_id, ssrc });
                }
            }
        }
    }

    fn drain_consumer(&mut self, consumer_id: &str) {
        let mut events = vec![];
        if let Some(consumer) = self.consumers.get_mut(consumer_id) {
            while let Some(event) = consumer.poll_event() {
                events.push(event);
            }
        }

        for event in events {
            let consumer_id = consumer_id.to_owned();
            match event {
                ConsumerEvent::Score { producer, consumer } => {
                    self.events.push_back(TransportEvent::ConsumerScore {
                        consumer_id,
                        producer_score: producer,
                        consumer_score: consumer,
                    });
                }
                ConsumerEvent::KeyFrameRequested => {
                    self.events
                        .push_back(TransportEvent::ConsumerKeyFrameRequested { consumer_id });
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDump {
    pub id: String,
    pub ice_state: IceState,
    pub ice_selected_tuple: Option<TransportTupleDump>,
    pub ice_tuples: Vec<TransportTupleDump>,
    pub dtls_state: DtlsState,
    pub producer_ids: Vec<String>,
    pub consumer_ids: Vec<String>,
}
