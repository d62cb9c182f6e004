use serde::{Deserialize, Serialize};

use crate::error::Error;

#[cfg(test)]
mod channel_test;

/// Control methods understood by the router, addressed at an entity through
/// [`Internal`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "router.createWebRtcTransport")]
    RouterCreateWebRtcTransport,
    #[serde(rename = "router.dump")]
    RouterDump,
    #[serde(rename = "transport.close")]
    TransportClose,
    #[serde(rename = "transport.connect")]
    TransportConnect,
    #[serde(rename = "transport.restartIce")]
    TransportRestartIce,
    #[serde(rename = "transport.produce")]
    TransportProduce,
    #[serde(rename = "transport.consume")]
    TransportConsume,
    #[serde(rename = "transport.dump")]
    TransportDump,
    #[serde(rename = "producer.close")]
    ProducerClose,
    #[serde(rename = "producer.pause")]
    ProducerPause,
    #[serde(rename = "producer.resume")]
    ProducerResume,
    #[serde(rename = "producer.dump")]
    ProducerDump,
    #[serde(rename = "consumer.close")]
    ConsumerClose,
    #[serde(rename = "consumer.pause")]
    ConsumerPause,
    #[serde(rename = "consumer.resume")]
    ConsumerResume,
    #[serde(rename = "consumer.requestKeyFrame")]
    ConsumerRequestKeyFrame,
    #[serde(rename = "consumer.dump")]
    ConsumerDump,
}

/// Entity addressing of a request.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
}

/// One framed request from the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub id: u32,
    pub method: Method,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Response to a [`ChannelRequest`], echoing its `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelResponse {
    Accepted {
        id: u32,
        accepted: bool,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
    Error {
        id: u32,
        error: String,
        reason: String,
    },
}

impl ChannelResponse {
    pub fn accepted(id: u32, data: serde_json::Value) -> Self {
        ChannelResponse::Accepted {
            id,
            accepted: true,
            data,
        }
    }

    pub fn error(id: u32, error: &Error) -> Self {
        ChannelResponse::Error {
            id,
            error: error.name().to_owned(),
            reason: error.to_string(),
        }
    }
}

/// Spontaneous event towards the supervisor; no `id`, never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub target_id: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
