use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use shared::{Protocol, TransportContext};

/// The four-tuple plus protocol identifying one peer path of a transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransportTuple {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub protocol: Protocol,
}

impl From<&TransportContext> for TransportTuple {
    fn from(ctx: &TransportContext) -> Self {
        Self {
            local_addr: ctx.local_addr,
            remote_addr: ctx.peer_addr,
            protocol: ctx.protocol,
        }
    }
}

impl TransportTuple {
    pub fn to_context(self) -> TransportContext {
        TransportContext {
            local_addr: self.local_addr,
            peer_addr: self.remote_addr,
            protocol: self.protocol,
            ecn: None,
        }
    }

    pub fn dump(&self) -> TransportTupleDump {
        TransportTupleDump {
            local_ip: self.local_addr.ip().to_string(),
            local_port: self.local_addr.port(),
            remote_ip: self.remote_addr.ip().to_string(),
            remote_port: self.remote_addr.port(),
            protocol: match self.protocol {
                Protocol::UDP => "udp".to_owned(),
                Protocol::TCP => "tcp".to_owned(),
            },
        }
    }
}

/// Wire shape of a tuple in dumps and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTupleDump {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol: String,
}
