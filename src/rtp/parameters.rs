use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Media kind of a producer or consumer.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A single negotiated RTCP feedback capability, e.g. `nack`, `nack pli`,
/// `ccm fir` or `goog-remb`.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub parameter: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// e.g. "audio/opus", "video/VP8", "video/rtx".
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_lowercase().ends_with("/rtx")
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// Negotiated RTP header extension, by URI and local id.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
}

pub const RID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const ABS_SEND_TIME_URI: &str =
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    pub cname: String,
    #[serde(default)]
    pub reduced_size: bool,
}

/// The negotiated parameter set a producer sends with or a consumer expects.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// Basic structural validation shared by produce and consume requests.
    pub fn validate(&self) -> Result<()> {
        if self.codecs.is_empty() {
            return Err(Error::TypeError("rtpParameters with no codecs".into()));
        }
        if self.encodings.is_empty() {
            return Err(Error::TypeError("rtpParameters with no encodings".into()));
        }

        let mut payload_types = HashSet::new();
        for codec in &self.codecs {
            if !payload_types.insert(codec.payload_type) {
                return Err(Error::TypeError(format!(
                    "duplicated payloadType {}",
                    codec.payload_type
                )));
            }
            if codec.clock_rate == 0 {
                return Err(Error::TypeError(format!(
                    "missing clockRate in codec {}",
                    codec.mime_type
                )));
            }
        }

        for encoding in &self.encodings {
            if encoding.ssrc.is_none() && encoding.rid.is_none() {
                return Err(Error::TypeError(
                    "encoding without ssrc nor rid".into(),
                ));
            }
        }

        Ok(())
    }

    /// The first non-RTX codec, which drives the stream parameters of an
    /// encoding in the Simple case.
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }

    /// The RTX codec paired with the given media payload type via `apt`, if
    /// any. With codec-specific parameter parsing out of scope, any RTX codec
    /// entry is taken as the pair.
    pub fn rtx_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| c.is_rtx())
    }

    /// Payload types a consumer built from these parameters will let through.
    pub fn supported_payload_types(&self) -> HashSet<u8> {
        self.codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .map(|c| c.payload_type)
            .collect()
    }

    /// Local id negotiated for a header extension URI.
    pub fn header_extension_id(&self, uri: &str) -> Option<u8> {
        self.header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .map(|ext| ext.id)
    }
}

#[cfg(test)]
mod parameters_test {
    use super::*;

    pub(crate) fn video_rtp_parameters() -> RtpParameters {
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
                        RtcpFeedback {
                            typ: "ccm".to_owned(),
                            parameter: "fir".to_owned(),
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
                cname: "test-cname".to_owned(),
                reduced_size: true,
            },
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(video_rtp_parameters().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_payload_type() {
        let mut params = video_rtp_parameters();
        params.codecs[1].payload_type = 96;
        assert!(matches!(params.validate(), Err(Error::TypeError(_))));
    }

    #[test]
    fn test_validate_rejects_bare_encoding() {
        let mut params = video_rtp_parameters();
        params.encodings[0].ssrc = None;
        assert!(matches!(params.validate(), Err(Error::TypeError(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let params = video_rtp_parameters();
        let json = serde_json::to_string(&params).unwrap();
        let parsed: RtpParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(params, parsed);
    }

    #[test]
    fn test_supported_payload_types_excludes_rtx() {
        let params = video_rtp_parameters();
        let pts = params.supported_payload_types();
        assert!(pts.contains(&96));
        assert!(!pts.contains(&97));
    }
}
