/// Seam for codec-specific payload handling (VP8/H264 picture and temporal
/// id rewriting, key-frame detection).
///
/// The core never parses payload descriptors itself; a consumer may carry an
/// implementation of this trait and the egress path drives it. A `None`
/// context means the codec needs no rewriting and cannot signal key frames,
/// so sync never waits for one.
pub trait EncodingContext {
    /// Whether the packet starts a decodable frame. Only meaningful for
    /// codecs that have key frames.
    fn is_key_frame(&self, packet: &rtp::packet::Packet) -> bool;

    /// Rewrite the packet payload for this consumer. Returning `false`
    /// drops the packet; the caller records the drop in its remappers.
    fn encode_payload(&mut self, packet: &mut rtp::packet::Packet) -> bool;

    /// Called when the consumer re-synced; implementations reset their
    /// rewriting state so the next key frame starts a fresh space.
    fn sync_required(&mut self);
}
