use std::collections::VecDeque;
use std::fmt;

use bytes::BytesMut;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use shared::util::math_rand_alpha;
use shared::Transmit;
use stun::attributes::{ATTR_PRIORITY, ATTR_USERNAME, ATTR_USE_CANDIDATE};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Getter, Message, BINDING_SUCCESS, CLASS_REQUEST, METHOD_BINDING};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use crate::transport::tuple::{TransportTuple, TransportTupleDump};


const DISCONNECTED_TIMEOUT_MS: u64 = 30_000;

/// ICE-lite server state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceState::New => write!(f, "new"),
            IceState::Connected => write!(f, "connected"),
            IceState::Completed => write!(f, "completed"),
            IceState::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug)]
pub enum IceServerEvent {
    StateChange(IceState),
    SelectedTuple(TransportTuple),
}

/// A local host candidate synthesized from a configured listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Debug)]
struct IceTuple {
    tuple: TransportTuple,
    priority: u32,
    nominated: bool,
}

/// Lite ICE server: answers binding requests, tracks candidate tuples and
/// keeps the nominated one with the highest remote priority selected.
///
/// Full agent behavior (gathering, checks, pairing) lives on the client
/// side; the server never originates a check.
pub struct IceServer {
    username_fragment: String,
    password: String,
    state: IceState,
    tuples: Vec<IceTuple>,
    selected: Option<usize>,
    last_valid_request_ms: u64,
    transmits: VecDeque<Transmit<BytesMut>>,
    events: VecDeque<IceServerEvent>,
}

impl IceServer {
    pub fn new() -> Self {
        Self {
            username_fragment: math_rand_alpha(16),
            password: math_rand_alpha(32),
            state: IceState::New,
            tuples: vec![],
            selected: None,
            last_valid_request_ms: 0,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn username_fragment(&self) -> &str {
        &self.username_fragment
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn state(&self) -> IceState {
        self.state
    }

    /// ICE restart: fresh credentials, all candidate state dropped. The
    /// remote learns the new ufrag/pwd through signaling and re-binds.
    pub fn restart(&mut self) {
        self.username_fragment = math_rand_alpha(16);
        self.password = math_rand_alpha(32);
        self.tuples.clear();
        self.selected = None;
        self.set_state(IceState::New);
    }

    pub fn selected_tuple(&self) -> Option<TransportTuple> {
        self.selected.map(|index| self.tuples[index].tuple)
    }

    pub fn tuple_dumps(&self) -> Vec<TransportTupleDump> {
        self.tuples.iter().map(|t| t.tuple.dump()).collect()
    }

    /// Handle a decoded STUN message received on `tuple`.
    pub fn process_stun_message(
        &mut self,
        msg: &mut Message,
        tuple: TransportTuple,
        now: std::time::Instant,
        now_ms: u64,
    ) {
        if msg.typ.method != METHOD_BINDING || msg.typ.class != CLASS_REQUEST {
            trace!(
                "unhandled STUN message from {} class({}) method({})",
                tuple.remote_addr,
                msg.typ.class,
                msg.typ.method
            );
            return;
        }

        if let Err(err) = self.check_authentication(msg) {
            warn!("discarding STUN message from {}: {}", tuple.remote_addr, err);
            return;
        }

        let priority = read_priority(msg).unwrap_or(0);
        let use_candidate = msg.contains(ATTR_USE_CANDIDATE);

        self.last_valid_request_ms = now_ms;
        let index = self.upsert_tuple(tuple, priority, use_candidate);

        if use_candidate {
            self.nominate(index);
        } else if self.selected == Some(index)
            && (self.state == IceState::Connected || self.state == IceState::Completed)
        {
            // Nomination confirmed on the selected path.
            self.set_state(IceState::Completed);
        }

        self.send_binding_success(msg, tuple, now);
    }

    /// Disconnect when no valid request arrived within the timeout.
    pub fn handle_timeout(&mut self, now_ms: u64) {
        if (self.state == IceState::Connected || self.state == IceState::Completed)
            && now_ms.saturating_sub(self.last_valid_request_ms) >= DISCONNECTED_TIMEOUT_MS
        {
            self.set_state(IceState::Disconnected);
        }
    }

    pub fn poll_timeout(&self) -> Option<u64> {
        if self.state == IceState::Connected || self.state == IceState::Completed {
            Some(self.last_valid_request_ms + DISCONNECTED_TIMEOUT_MS)
        } else {
            None
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit<BytesMut>> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<IceServerEvent> {
        self.events.pop_front()
    }

    fn check_authentication(&self, msg: &mut Message) -> Result<(), String> {
        let mut username = Username::new(ATTR_USERNAME, String::new());
        username
            .get_from(msg)
            .map_err(|err| format!("no USERNAME attribute: {err}"))?;

        let value = username.to_string();
        let local_ufrag = value.split(':').next().unwrap_or("");
        if local_ufrag != self.username_fragment {
            return Err(format!("wrong username fragment ({local_ufrag})"));
        }

        MessageIntegrity(self.password.as_bytes().to_vec())
            .check(msg)
            .map_err(|err| format!("message integrity check failed: {err}"))
    }

    fn upsert_tuple(&mut self, tuple: TransportTuple, priority: u32, nominated: bool) -> usize {
        if let Some(index) = self.tuples.iter().position(|t| t.tuple == tuple) {
            let entry = &mut self.tuples[index];
            if priority != 0 {
                entry.priority = priority;
            }
            entry.nominated |= nominated;
            index
        } else {
            debug!(
                "new ICE tuple {} -> {} ({:?})",
                tuple.remote_addr, tuple.local_addr, tuple.protocol
            );
            self.tuples.push(IceTuple {
                tuple,
                priority,
                nominated,
            });
            self.tuples.len() - 1
        }
    }

    fn nominate(&mut self, index: usize) {
        let switch = match self.selected {
            None => true,
            Some(current) => {
                current != index && self.tuples[index].priority > self.tuples[current].priority
            }
        };

        if switch {
            self.selected = Some(index);
            self.events
                .push_back(IceServerEvent::SelectedTuple(self.tuples[index].tuple));
        }

        match self.state {
            IceState::New | IceState::Disconnected => self.set_state(IceState::Connected),
            IceState::Connected | IceState::Completed => {
                if !switch && self.selected == Some(index) {
                    self.set_state(IceState::Completed);
                }
            }
        }
    }

    fn set_state(&mut self, state: IceState) {
        if self.state != state {
            self.state = state;
            self.events.push_back(IceServerEvent::StateChange(state));
        }
    }

    fn send_binding_success(
        &mut self,
        request: &Message,
        tuple: TransportTuple,
        now: std::time::Instant,
    ) {
        let (ip, port) = (tuple.remote_addr.ip(), tuple.remote_addr.port());

        let mut response = Message::new();
        let result = response.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress { ip, port }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.password.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        match result {
            Ok(()) => {
                self.transmits.push_back(Transmit {
                    now,
                    transport: tuple.to_context(),
                    message: BytesMut::from(&response.raw[..]),
                });
            }
            Err(err) => {
                warn!(
                    "failed to build binding success for {}: {}",
                    tuple.remote_addr, err
                );
            }
        }
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_priority(msg: &Message) -> Option<u32> {
    let value = msg.get(ATTR_PRIORITY).ok()?;
    if value.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

/// RFC 8445 host candidate priority for component 1.
pub fn host_candidate_priority(local_preference: u16) -> u32 {
    const TYPE_PREFERENCE_HOST: u32 = 126;
    (TYPE_PREFERENCE_HOST << 24) | ((local_preference as u32) << 8) | 255
}
