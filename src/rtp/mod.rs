pub mod codecs;
pub mod data_counter;
pub mod monitor;
pub mod nack_generator;
pub mod parameters;
pub mod seq_manager;
pub mod stream;
pub mod stream_recv;
pub mod stream_send;

pub use data_counter::RtpDataCounter;
pub use monitor::RtpMonitor;
pub use parameters::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtensionParameters, RtpParameters, RtxParameters,
};
pub use seq_manager::SeqManager;
pub use stream::{RtpStream, RtpStreamParams};
pub use stream_recv::RtpStreamRecv;
pub use stream_send::RtpStreamSend;

/// RFC 3550 sequence number space.
pub const RTP_SEQ_MOD: u32 = 1 << 16;
pub const MAX_DROPOUT: u16 = 3000;
pub const MAX_MISORDER: u16 = 100;
pub const MIN_SEQUENTIAL: u8 = 2;

/// RTCP report pacing (milliseconds).
pub const MAX_AUDIO_INTERVAL_MS: u64 = 5000;
pub const MAX_VIDEO_INTERVAL_MS: u64 = 1000;
