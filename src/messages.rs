use bytes::BytesMut;
use shared::util::{is_rtcp, match_dtls, match_srtp_or_srtcp};

/// Protocol class of an incoming datagram, as described in RFC 7983.
///
/// ```text
///              +----------------+
///              |        [0..3] -+--> STUN
///              |                |
///  packet -->  |      [20..63] -+--> DTLS
///              |                |
///              |    [128..191] -+--> SRTP / SRTCP
///              +----------------+
/// ```
#[derive(Debug)]
pub enum Demuxed {
    Stun(BytesMut),
    Dtls(BytesMut),
    Rtp(BytesMut),
    Rtcp(BytesMut),
    /// First byte outside every known range.
    Unknown(BytesMut),
}

pub fn demux(message: BytesMut) -> Demuxed {
    if message.is_empty() {
        return Demuxed::Unknown(message);
    }

    if match_dtls(&message) {
        Demuxed::Dtls(message)
    } else if match_srtp_or_srtcp(&message) {
        if is_rtcp(&message) {
            Demuxed::Rtcp(message)
        } else {
            Demuxed::Rtp(message)
        }
    } else if message[0] <= 3 {
        Demuxed::Stun(message)
    } else {
        Demuxed::Unknown(message)
    }
}
