use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use shared::time::SystemInstant;
use shared::Transmit;

use crate::channel::{ChannelRequest, ChannelResponse, Method, Notification};
use crate::error::{Error, Result};
use crate::rtp::parameters::{MediaKind, RtpParameters};
use crate::transport::dtls::DtlsParameters;
use crate::transport::{TransportEvent, WebRtcTransport, WebRtcTransportOptions};

#[cfg(test)]
mod router_test;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    #[serde(default)]
    paused: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    #[serde(default)]
    paused: bool,
}

/// Many-producer / many-consumer fan-out engine.
///
/// Owns its transports; transports own their producers and consumers. The
/// cross-indices below only hold ids, so closing anything is a map cleanup,
/// never a dangling reference.
pub struct Router {
    id: String,
    clock: SystemInstant,

    transports: HashMap<String, WebRtcTransport>,

    map_producer_consumers: HashMap<String, HashSet<String>>,
    map_consumer_producer: HashMap<String, String>,
    map_consumer_transport: HashMap<String, String>,
    /// producer id -> the transport it lives on; producer ids are unique
    /// router-wide.
    map_producers: HashMap<String, String>,

    notifications: VecDeque<Notification>,
}

impl Router {
    pub fn new(id: String) -> Self {
        Self {
            id,
            clock: SystemInstant::now(),
            transports: HashMap::new(),
            map_producer_consumers: HashMap::new(),
            map_consumer_producer: HashMap::new(),
            map_consumer_transport: HashMap::new(),
            map_producers: HashMap::new(),
            notifications: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process one control request; never panics, never propagates: every
    /// failure becomes an error response.
    pub fn handle_request(&mut self, request: ChannelRequest, now: Instant) -> ChannelResponse {
        match self.process_request(&request, now) {
            Ok(data) => ChannelResponse::accepted(request.id, data),
            Err(err) => {
                debug!("request {:?} failed: {}", request.method, err);
                ChannelResponse::error(request.id, &err)
            }
        }
    }

    /// One datagram arrived on a socket belonging to `transport_id`.
    pub fn handle_transmit(&mut self, transport_id: &str, msg: Transmit<BytesMut>) -> Result<()> {
        let now = msg.now;
        let forward = {
            let transport = self
                .transports
                .get_mut(transport_id)
                .ok_or_else(|| Error::NotFound(format!("Transport not found [id:{transport_id}]")))?;
            transport.handle_transmit(msg)
        };
        self.drain_transport(transport_id, now);

        if let Some((producer_id, mut packet)) = forward {
            self.fan_out(&producer_id, &mut packet, now);
        }

        Ok(())
    }

    /// Clock tick: timers of every owned entity.
    pub fn handle_timeout(&mut self, now: Instant) {
        let transport_ids: Vec<String> = self.transports.keys().cloned().collect();
        for transport_id in transport_ids {
            if let Some(transport) = self.transports.get_mut(&transport_id) {
                transport.handle_timeout(now);
            }
            self.drain_transport(&transport_id, now);
        }
    }

    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        self.transports
            .values()
            .filter_map(|t| t.poll_timeout(now))
            .min()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit<BytesMut>> {
        for transport in self.transports.values_mut() {
            if let Some(transmit) = transport.poll_transmit() {
                return Some(transmit);
            }
        }
        None
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    pub fn close(&mut self) {
        for transport in self.transports.values_mut() {
            transport.close();
        }
        self.transports.clear();
        self.map_producer_consumers.clear();
        self.map_consumer_producer.clear();
        self.map_consumer_transport.clear();
        self.map_producers.clear();
    }

    /// Forward a producer packet to every subscribed consumer. Consumers
    /// are isolated from each other: one failing (or being gone) never
    /// affects its siblings, and the packet leaves this function exactly as
    /// it came in.
    fn fan_out(&mut self, producer_id: &str, packet: &mut rtp::packet::Packet, now: Instant) {
        let Some(consumer_ids) = self.map_producer_consumers.get(producer_id) else {
            return;
        };
        let consumer_ids: Vec<String> = consumer_ids.iter().cloned().collect();

        for consumer_id in consumer_ids {
            let Some(transport_id) = self.map_consumer_transport.get(&consumer_id).cloned() else {
                continue;
            };
            if let Some(transport) = self.transports.get_mut(&transport_id) {
                transport.send_consumer_rtp(&consumer_id, packet, now);
            }
            self.drain_transport(&transport_id, now);
        }
    }

    fn process_request(
        &mut self,
        request: &ChannelRequest,
        now: Instant,
    ) -> Result<serde_json::Value> {
        match request.method {
            Method::RouterCreateWebRtcTransport => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                if self.transports.contains_key(&transport_id) {
                    return Err(Error::AlreadyExists(format!(
                        "a Transport with same id \"{transport_id}\" exists"
                    )));
                }

                let options: WebRtcTransportOptions =
                    serde_json::from_value(request.data.clone())
                        .map_err(|e| Error::TypeError(e.to_string()))?;
                let transport =
                    WebRtcTransport::new(transport_id.clone(), options, self.clock)?;
                let info = transport.connect_info();
                self.transports.insert(transport_id, transport);

                Ok(serde_json::to_value(info)?)
            }

            Method::RouterDump => Ok(json!({
                "id": self.id,
                "transportIds": self.transports.keys().collect::<Vec<_>>(),
                "mapProducerIdConsumerIds": self
                    .map_producer_consumers
                    .iter()
                    .map(|(producer_id, consumers)| {
                        (producer_id.clone(), consumers.iter().cloned().collect::<Vec<_>>())
                    })
                    .collect::<HashMap<_, _>>(),
                "mapConsumerIdProducerId": self.map_consumer_producer,
            })),

            Method::TransportClose => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                self.close_transport(&transport_id, now)?;
                Ok(serde_json::Value::Null)
            }

            Method::TransportConnect => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                let dtls_parameters: DtlsParameters =
                    serde_json::from_value(request.data.clone())
                        .map_err(|e| Error::TypeError(e.to_string()))?;

                let transport = self.get_transport_mut(&transport_id)?;
                let role = transport.connect(dtls_parameters)?;
                self.drain_transport(&transport_id, now);

                Ok(json!({ "dtlsLocalRole": role }))
            }

            Method::TransportRestartIce => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                let transport = self.get_transport_mut(&transport_id)?;
                let (username_fragment, password) = transport.restart_ice(now);
                self.drain_transport(&transport_id, now);

                Ok(json!({
                    "iceUsernameFragment": username_fragment,
                    "icePassword": password,
                    "iceLite": true,
                }))
            }

            Method::TransportDump => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                let transport = self.get_transport(&transport_id)?;
                Ok(serde_json::to_value(transport.dump())?)
            }

            Method::TransportProduce => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                if self.map_producers.contains_key(&producer_id) {
                    return Err(Error::AlreadyExists(format!(
                        "a Producer with same id \"{producer_id}\" exists"
                    )));
                }

                let data: ProduceData = serde_json::from_value(request.data.clone())
                    .map_err(|e| Error::TypeError(e.to_string()))?;

                let transport = self.get_transport_mut(&transport_id)?;
                transport.produce(producer_id.clone(), data.kind, data.rtp_parameters, data.paused)?;

                self.map_producers.insert(producer_id.clone(), transport_id);
                self.map_producer_consumers
                    .entry(producer_id)
                    .or_default();

                Ok(serde_json::Value::Null)
            }

            Method::TransportConsume => {
                let transport_id = required(&request.internal.transport_id, "transportId")?;
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                if self.map_consumer_producer.contains_key(&consumer_id) {
                    return Err(Error::AlreadyExists(format!(
                        "a Consumer with same id \"{consumer_id}\" exists"
                    )));
                }

                let data: ConsumeData = serde_json::from_value(request.data.clone())
                    .map_err(|e| Error::TypeError(e.to_string()))?;

                // the producer may live on any transport of this router
                let producer_transport_id = self
                    .map_producers
                    .get(&data.producer_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::NotFound(format!("Producer not found [id:{}]", data.producer_id))
                    })?;
                let (producer_paused, producer_score, producer_has_stream) = {
                    let producer = self
                        .get_transport(&producer_transport_id)?
                        .get_producer(&data.producer_id)
                        .ok_or_else(|| {
                            Error::NotFound(format!("Producer not found [id:{}]", data.producer_id))
                        })?;
                    (
                        producer.is_paused(),
                        producer.score(),
                        !producer.stream_ssrcs().is_empty(),
                    )
                };

                let transport = self.get_transport_mut(&transport_id)?;
                transport.consume(
                    consumer_id.clone(),
                    data.producer_id.clone(),
                    data.kind,
                    data.rtp_parameters,
                    data.paused,
                    producer_paused,
                )?;
                if producer_has_stream {
                    if let Some(consumer) = transport.get_consumer_mut(&consumer_id) {
                        consumer.producer_new_stream(producer_score);
                    }
                }

                self.map_producer_consumers
                    .entry(data.producer_id.clone())
                    .or_default()
                    .insert(consumer_id.clone());
                self.map_consumer_producer
                    .insert(consumer_id.clone(), data.producer_id);
                self.map_consumer_transport
                    .insert(consumer_id.clone(), transport_id.clone());

                self.drain_transport(&transport_id, now);

                Ok(json!({
                    "paused": data.paused,
                    "producerPaused": producer_paused,
                    "type": "simple",
                }))
            }

            Method::ProducerClose => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                self.close_producer(&producer_id, now)?;
                Ok(serde_json::Value::Null)
            }

            Method::ProducerPause | Method::ProducerResume => {
                let pause = request.method == Method::ProducerPause;
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let transport_id = self.producer_transport(&producer_id)?;

                {
                    let producer = self
                        .transports
                        .get_mut(&transport_id)
                        .and_then(|t| t.get_producer_mut(&producer_id))
                        .ok_or_else(|| {
                            Error::NotFound(format!("Producer not found [id:{producer_id}]"))
                        })?;
                    if pause {
                        producer.pause();
                    } else {
                        producer.resume();
                    }
                }

                let event = if pause { "producerpause" } else { "producerresume" };
                let consumer_ids: Vec<String> = self
                    .map_producer_consumers
                    .get(&producer_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for consumer_id in consumer_ids {
                    let Some(consumer_transport_id) =
                        self.map_consumer_transport.get(&consumer_id).cloned()
                    else {
                        continue;
                    };
                    if let Some(consumer) = self
                        .transports
                        .get_mut(&consumer_transport_id)
                        .and_then(|t| t.get_consumer_mut(&consumer_id))
                    {
                        if pause {
                            consumer.set_producer_paused();
                        } else {
                            consumer.set_producer_resumed();
                        }
                    }
                    self.notify(&consumer_id, event, serde_json::Value::Null);
                    self.drain_transport(&consumer_transport_id, now);
                }

                Ok(serde_json::Value::Null)
            }

            Method::ProducerDump => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let transport_id = self.producer_transport(&producer_id)?;
                let producer = self
                    .get_transport(&transport_id)?
                    .get_producer(&producer_id)
                    .ok_or_else(|| {
                        Error::NotFound(format!("Producer not found [id:{producer_id}]"))
                    })?;
                Ok(serde_json::to_value(producer.dump())?)
            }

            Method::ConsumerClose => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                self.close_consumer(&consumer_id)?;
                Ok(serde_json::Value::Null)
            }

            Method::ConsumerPause | Method::ConsumerResume => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let transport_id = self.consumer_transport(&consumer_id)?;
                {
                    let consumer = self
                        .transports
                        .get_mut(&transport_id)
                        .and_then(|t| t.get_consumer_mut(&consumer_id))
                        .ok_or_else(|| {
                            Error::NotFound(format!("Consumer not found [id:{consumer_id}]"))
                        })?;
                    if request.method == Method::ConsumerPause {
                        consumer.pause();
                    } else {
                        consumer.resume();
                    }
                }
                self.drain_transport(&transport_id, now);
                Ok(serde_json::Value::Null)
            }

            Method::ConsumerRequestKeyFrame => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                self.request_key_frame_for(&consumer_id, now)?;
                Ok(serde_json::Value::Null)
            }

            Method::ConsumerDump => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let transport_id = self.consumer_transport(&consumer_id)?;
                let consumer = self
                    .get_transport(&transport_id)?
                    .get_consumer(&consumer_id)
                    .ok_or_else(|| {
                        Error::NotFound(format!("Consumer not found [id:{consumer_id}]"))
                    })?;
                Ok(serde_json::to_value(consumer.dump())?)
            }
        }
    }

    fn close_transport(&mut self, transport_id: &str, now: Instant) -> Result<()> {
        let mut transport = self.transports.remove(transport_id).ok_or_else(|| {
            Error::NotFound(format!("Transport not found [id:{transport_id}]"))
        })?;

        // producers on this transport close their consumers everywhere
        for producer_id in transport.producer_ids() {
            self.map_producers.remove(&producer_id);
            let consumer_ids = self
                .map_producer_consumers
                .remove(&producer_id)
                .unwrap_or_default();
            for consumer_id in consumer_ids {
                self.map_consumer_producer.remove(&consumer_id);
                if let Some(consumer_transport_id) =
                    self.map_consumer_transport.remove(&consumer_id)
                {
                    if let Some(t) = self.transports.get_mut(&consumer_transport_id) {
                        let _ = t.close_consumer(&consumer_id);
                    }
                }
                self.notify(&consumer_id, "producerclose", serde_json::Value::Null);
            }
        }

        // consumers on this transport disappear from the indices
        for consumer_id in transport.consumer_ids() {
            if let Some(producer_id) = self.map_consumer_producer.remove(&consumer_id) {
                if let Some(set) = self.map_producer_consumers.get_mut(&producer_id) {
                    set.remove(&consumer_id);
                }
            }
            self.map_consumer_transport.remove(&consumer_id);
        }

        transport.close();
        let _ = now;

        Ok(())
    }

    fn close_producer(&mut self, producer_id: &str, _now: Instant) -> Result<()> {
        let transport_id = self.producer_transport(producer_id)?;
        self.transports
            .get_mut(&transport_id)
            .ok_or_else(|| Error::NotFound(format!("Transport not found [id:{transport_id}]")))?
            .close_producer(producer_id)?;
        self.map_producers.remove(producer_id);

        let consumer_ids = self
            .map_producer_consumers
            .remove(producer_id)
            .unwrap_or_default();
        for consumer_id in consumer_ids {
            if let Some(consumer_transport_id) = self.map_consumer_transport.remove(&consumer_id) {
                if let Some(t) = self.transports.get_mut(&consumer_transport_id) {
                    let _ = t.close_consumer(&consumer_id);
                }
            }
            self.map_consumer_producer.remove(&consumer_id);
            self.notify(&consumer_id, "producerclose", serde_json::Value::Null);
        }

        Ok(())
    }

    fn close_consumer(&mut self, consumer_id: &str) -> Result<()> {
        let transport_id = self.consumer_transport(consumer_id)?;
        self.transports
            .get_mut(&transport_id)
            .ok_or_else(|| Error::NotFound(format!("Transport not found [id:{transport_id}]")))?
            .close_consumer(consumer_id)?;

        self.map_consumer_transport.remove(consumer_id);
        if let Some(producer_id) = self.map_consumer_producer.remove(consumer_id) {
            if let Some(set) = self.map_producer_consumers.get_mut(&producer_id) {
                set.remove(consumer_id);
            }
        }

        Ok(())
    }

    /// A consumer asked its producer for a key frame; the producer's
    /// transport emits the RTCP towards the publisher.
    fn request_key_frame_for(&mut self, consumer_id: &str, now: Instant) -> Result<()> {
        let producer_id = self
            .map_consumer_producer
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Consumer not found [id:{consumer_id}]")))?;
        let transport_id = self.producer_transport(&producer_id)?;

        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.request_producer_key_frame(&producer_id, now);
        }
        self.drain_transport(&transport_id, now);

        Ok(())
    }

    fn drain_transport(&mut self, transport_id: &str, now: Instant) {
        loop {
            let Some(event) = self
                .transports
                .get_mut(transport_id)
                .and_then(|t| t.poll_event())
            else {
                break;
            };
            self.handle_transport_event(transport_id, event, now);
        }
    }

    fn handle_transport_event(&mut self, transport_id: &str, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::IceStateChange(state) => {
                self.notify(transport_id, "icestatechange", json!({ "iceState": state }));
            }
            TransportEvent::IceSelectedTupleChange(tuple) => {
                self.notify(
                    transport_id,
                    "iceselectedtuplechange",
                    json!({ "iceSelectedTuple": tuple }),
                );
            }
            TransportEvent::DtlsStateChange(state) => {
                self.notify(transport_id, "dtlsstatechange", json!({ "dtlsState": state }));
            }
            TransportEvent::ProducerStream { producer_id, ssrc } => {
                let score = self
                    .transports
                    .get(transport_id)
                    .and_then(|t| t.get_producer(&producer_id))
                    .map(|p| p.score())
                    .unwrap_or(0);
                let _ = ssrc;

                let consumer_ids: Vec<String> = self
                    .map_producer_consumers
                    .get(&producer_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for consumer_id in consumer_ids {
                    let Some(consumer_transport_id) =
                        self.map_consumer_transport.get(&consumer_id).cloned()
                    else {
                        continue;
                    };
                    if let Some(consumer) = self
                        .transports
                        .get_mut(&consumer_transport_id)
                        .and_then(|t| t.get_consumer_mut(&consumer_id))
                    {
                        consumer.producer_new_stream(score);
                    }
                    self.drain_transport(&consumer_transport_id, now);
                }
            }
            TransportEvent::ProducerScore {
                producer_id,
                ssrc,
                score,
            } => {
                self.notify(
                    &producer_id,
                    "score",
                    json!([{ "ssrc": ssrc, "score": score }]),
                );

                let consumer_ids: Vec<String> = self
                    .map_producer_consumers
                    .get(&producer_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for consumer_id in consumer_ids {
                    let Some(consumer_transport_id) =
                        self.map_consumer_transport.get(&consumer_id).cloned()
                    else {
                        continue;
                    };
                    if let Some(consumer) = self
                        .transports
                        .get_mut(&consumer_transport_id)
                        .and_then(|t| t.get_consumer_mut(&consumer_id))
                    {
                        consumer.producer_score_changed(score);
                    }
                    self.drain_transport(&consumer_transport_id, now);
                }
            }
            TransportEvent::ProducerStreamHealthy { producer_id, ssrc } => {
                self.notify(
                    &producer_id,
                    "producerstreamhealthy",
                    json!({ "ssrc": ssrc }),
                );
            }
            TransportEvent::ProducerStreamUnhealthy { producer_id, ssrc } => {
                self.notify(
                    &producer_id,
                    "producerstreamunhealthy",
                    json!({ "ssrc": ssrc }),
                );
            }
            TransportEvent::ConsumerScore {
                consumer_id,
                producer_score,
                consumer_score,
            } => {
                self.notify(
                    &consumer_id,
                    "score",
                    json!({ "producer": producer_score, "consumer": consumer_score }),
                );
            }
            TransportEvent::ConsumerKeyFrameRequested { consumer_id } => {
                if let Err(err) = self.request_key_frame_for(&consumer_id, now) {
                    warn!(
                        "cannot forward key frame request [consumer:{}]: {}",
                        consumer_id, err
                    );
                }
            }
            TransportEvent::Remb { bitrate } => {
                self.notify(transport_id, "remb", json!({ "bitrate": bitrate }));
            }
        }
    }

    fn notify(&mut self, target_id: &str, event: &str, data: serde_json::Value) {
        self.notifications.push_back(Notification {
            target_id: target_id.to_owned(),
            event: event.to_owned(),
            data,
        });
    }

    fn get_transport(&self, transport_id: &str) -> Result<&WebRtcTransport> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| Error::NotFound(format!("Transport not found [id:{transport_id}]")))
    }

    fn get_transport_mut(&mut self, transport_id: &str) -> Result<&mut WebRtcTransport> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| Error::NotFound(format!("Transport not found [id:{transport_id}]")))
    }

    fn producer_transport(&self, producer_id: &str) -> Result<String> {
        self.map_producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Producer not found [id:{producer_id}]")))
    }

    fn consumer_transport(&self, consumer_id: &str) -> Result<String> {
        self.map_consumer_transport
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Consumer not found [id:{consumer_id}]")))
    }

    #[cfg(test)]
    pub(crate) fn transport_for_test(&mut self, transport_id: &str) -> &mut WebRtcTransport {
        self.transports.get_mut(transport_id).unwrap()
    }

    #[cfg(test)]
    pub(crate) fn receive_rtp_for_test(
        &mut self,
        transport_id: &str,
        packet: &mut rtp::packet::Packet,
        now: Instant,
    ) {
        let forward = self
            .transports
            .get_mut(transport_id)
            .and_then(|t| t.receive_rtp_for_test(packet, now));
        self.drain_transport(transport_id, now);
        if let Some((producer_id, mut forwarded)) = forward {
            self.fan_out(&producer_id, &mut forwarded, now);
        }
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        // every consumer -> producer entry has the symmetric membership
        for (consumer_id, producer_id) in &self.map_consumer_producer {
            let Some(set) = self.map_producer_consumers.get(producer_id) else {
                return false;
            };
            if !set.contains(consumer_id) {
                return false;
            }
        }
        // and the reverse
        for (producer_id, consumers) in &self.map_producer_consumers {
            if !self.map_producers.contains_key(producer_id) {
                return false;
            }
            for consumer_id in consumers {
                if self.map_consumer_producer.get(consumer_id) != Some(producer_id) {
                    return false;
                }
            }
        }
        true
    }
}

fn required(field: &Option<String>, name: &str) -> Result<String> {
    field
        .clone()
        .ok_or_else(|| Error::TypeError(format!("missing internal.{name}")))
}
