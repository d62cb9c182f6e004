use log::{debug, warn};

use crate::rtp::data_counter::RtpDataCounter;
use crate::rtp::monitor::RtpMonitor;
use crate::rtp::parameters::MediaKind;
use crate::rtp::seq_manager::SeqNum;
use crate::rtp::{MAX_DROPOUT, MAX_MISORDER, MIN_SEQUENTIAL, RTP_SEQ_MOD};


/// Static parameters a stream is created with, derived from the negotiated
/// codec and encoding.
#[derive(Debug, Clone, Default)]
pub struct RtpStreamParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub kind: MediaKind,
    pub rid: Option<String>,
    pub cname: String,
    pub rtx_ssrc: Option<u32>,
    pub rtx_payload_type: Option<u8>,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
}

/// Per-SSRC sequence state and accounting shared by the receive and send
/// directions.
///
/// The sequence machinery is RFC 3550 appendix A.1: probation for fresh
/// streams, cycle tracking across the 16 bit wrap, and a `bad_seq`
/// resynchronization handshake for large jumps.
#[derive(Debug)]
pub struct RtpStream {
    pub(crate) params: RtpStreamParams,

    started: bool,
    probation: u8,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    max_packet_ts: u32,
    max_packet_ms: u64,

    pub packets_lost: u32,
    pub fraction_lost: u8,
    pub packets_discarded: u64,
    pub packets_repaired: u64,
    pub nack_count: u64,
    pub nack_rtp_packet_count: u64,
    pub pli_count: u64,
    pub fir_count: u64,
    pub transmission_counter: RtpDataCounter,
    pub retransmission_counter: RtpDataCounter,

    paused: bool,
    monitor: RtpMonitor,
}

impl RtpStream {
    pub fn new(params: RtpStreamParams) -> Self {
        Self {
            params,
            started: false,
            probation: 0,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            bad_seq: RTP_SEQ_MOD + 1,
            max_packet_ts: 0,
            max_packet_ms: 0,
            packets_lost: 0,
            fraction_lost: 0,
            packets_discarded: 0,
            packets_repaired: 0,
            nack_count: 0,
            nack_rtp_packet_count: 0,
            pli_count: 0,
            fir_count: 0,
            transmission_counter: RtpDataCounter::new(),
            retransmission_counter: RtpDataCounter::new(),
            paused: false,
            monitor: RtpMonitor::new(),
        }
    }

    pub fn params(&self) -> &RtpStreamParams {
        &self.params
    }

    pub fn ssrc(&self) -> u32 {
        self.params.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.params.clock_rate
    }

    pub fn has_rtx(&self) -> bool {
        self.params.rtx_ssrc.is_some()
    }

    pub fn max_seq(&self) -> u16 {
        self.max_seq
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    pub fn bad_seq(&self) -> u32 {
        self.bad_seq
    }

    /// Extended highest sequence number received, `cycles | max_seq`.
    pub fn extended_highest_seq(&self) -> u32 {
        self.cycles | self.max_seq as u32
    }

    pub fn expected_packets(&self) -> u32 {
        (self.cycles + self.max_seq as u32)
            .wrapping_sub(self.base_seq)
            .wrapping_add(1)
    }

    pub fn max_packet_ts(&self) -> u32 {
        self.max_packet_ts
    }

    /// Wall-clock milliseconds of the highest-timestamped packet seen.
    pub fn max_packet_ms(&self) -> u64 {
        self.max_packet_ms
    }

    pub fn score(&self) -> u8 {
        self.monitor.score()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn get_bitrate(&mut self, now_ms: u64) -> u32 {
        self.transmission_counter.get_rate(now_ms) + self.retransmission_counter.get_rate(now_ms)
    }

    pub fn get_loss_percentage(&self) -> f32 {
        self.fraction_lost as f32 * 100.0 / 256.0
    }

    /// Run the packet through the A.1 machine and update data counters.
    /// Returns false if the packet must not be processed further.
    pub fn receive_packet(&mut self, packet: &rtp::packet::Packet, now_ms: u64) -> bool {
        if !self.update_seq(packet, now_ms) {
            warn!(
                "invalid packet dropped [ssrc:{}, seq:{}]",
                packet.header.ssrc, packet.header.sequence_number
            );
            return false;
        }

        self.transmission_counter
            .update(packet.payload.len(), now_ms);

        true
    }

    /// Feed a loss sample into the quality monitor. Returns the new score on
    /// change.
    pub fn update_score(&mut self, fraction_lost: u8) -> Option<u8> {
        self.monitor.add_sample(fraction_lost)
    }

    pub(crate) fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq as u32;
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
    }

    pub(crate) fn update_seq(&mut self, packet: &rtp::packet::Packet, now_ms: u64) -> bool {
        let seq = packet.header.sequence_number;
        let udelta = seq.wrapping_sub(self.max_seq);

        if !self.started {
            self.init_seq(seq);
            self.started = true;
            self.probation = MIN_SEQUENTIAL - 1;
            self.set_max_packet(packet.header.timestamp, now_ms, true);

            return true;
        }

        if self.probation > 0 {
            // Source is on probation: only strictly sequential packets count.
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                self.set_max_packet(packet.header.timestamp, now_ms, false);

                return true;
            }

            debug!(
                "non sequential packet during probation [ssrc:{}, seq:{}]",
                self.params.ssrc, seq
            );
            self.packets_discarded += 1;
            self.init_seq(seq);
            self.probation = MIN_SEQUENTIAL - 1;

            return false;
        }

        if udelta < MAX_DROPOUT {
            // In order, with a permissible gap.
            if seq < self.max_seq {
                // Sequence number wrapped, count another 64K cycle.
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
            self.set_max_packet(packet.header.timestamp, now_ms, false);
        } else if udelta <= (RTP_SEQ_MOD - MAX_MISORDER as u32) as u16 {
            // The sequence number made a very large jump.
            if seq as u32 == self.bad_seq {
                // Two sequential packets: assume the other side restarted
                // without telling us, so just re-sync.
                self.init_seq(seq);
                self.set_max_packet(packet.header.timestamp, now_ms, true);
            } else {
                self.bad_seq = (seq as u32).wrapping_add(1) & (RTP_SEQ_MOD - 1);
                self.packets_discarded += 1;

                return false;
            }
        } else {
            // Duplicate or reordered packet within the misorder window.
            self.set_max_packet(packet.header.timestamp, now_ms, false);
        }

        true
    }

    fn set_max_packet(&mut self, ts: u32, now_ms: u64, force: bool) {
        if force || ts.is_newer_than(self.max_packet_ts) || self.max_packet_ms == 0 {
            self.max_packet_ts = ts;
            self.max_packet_ms = now_ms;
        }
    }
}
