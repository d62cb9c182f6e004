use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use dtls::config::ClientAuthType;
use dtls::endpoint::{Endpoint, EndpointEvent};
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use dtls::state::State;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::{EcnCodepoint, Protocol, Transmit};
use srtp::option::{srtcp_replay_protection, srtp_replay_protection};
use srtp::protection_profile::ProtectionProfile;

use crate::error::{Error, Result};
use crate::transport::certificate::{fingerprint_value, Certificate, DtlsFingerprint};

const DEFAULT_SESSION_SRTP_REPLAY_PROTECTION_WINDOW: usize = 64;
const DEFAULT_SESSION_SRTCP_REPLAY_PROTECTION_WINDOW: usize = 64;

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for DtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtlsState::New => write!(f, "new"),
            DtlsState::Connecting => write!(f, "connecting"),
            DtlsState::Connected => write!(f, "connected"),
            DtlsState::Failed => write!(f, "failed"),
            DtlsState::Closed => write!(f, "closed"),
        }
    }
}

/// Remote side of the DTLS negotiation, taken from a `transport.connect`
/// request.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS side of a WebRTC transport, driving a sans-io [`Endpoint`] in either
/// role and exporting the SRTP keying material once the handshake is done.
pub struct DtlsTransport {
    state: DtlsState,
    local_role: DtlsRole,
    certificate: Certificate,
    remote_parameters: Option<DtlsParameters>,
    endpoint: Option<Endpoint>,
    remote_addr: Option<SocketAddr>,
    pending_srtp: Option<(srtp::context::Context, srtp::context::Context)>,
    transmits: VecDeque<Transmit<BytesMut>>,
    state_changes: VecDeque<DtlsState>,
}

impl DtlsTransport {
    pub fn new(certificate: Certificate) -> Self {
        Self {
            state: DtlsState::New,
            local_role: DtlsRole::Auto,
            certificate,
            remote_parameters: None,
            endpoint: None,
            remote_addr: None,
            pending_srtp: None,
            transmits: VecDeque::new(),
            state_changes: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DtlsState {
        self.state
    }

    pub fn local_role(&self) -> DtlsRole {
        self.local_role
    }

    pub fn get_fingerprints(&self) -> Vec<DtlsFingerprint> {
        self.certificate.get_fingerprints()
    }

    /// Store remote fingerprints and resolve the local role. The remote
    /// advertising `auto` (actpass) leaves the client role to us.
    pub fn set_remote_parameters(&mut self, parameters: DtlsParameters) -> Result<()> {
        if self.remote_parameters.is_some() {
            return Err(Error::InvalidState(
                "transport already connected".to_owned(),
            ));
        }
        if parameters.fingerprints.is_empty() {
            return Err(Error::TypeError("missing DTLS fingerprints".to_owned()));
        }

        self.local_role = match parameters.role {
            DtlsRole::Client => DtlsRole::Server,
            DtlsRole::Server => DtlsRole::Client,
            DtlsRole::Auto => DtlsRole::Client,
        };
        self.remote_parameters = Some(parameters);

        Ok(())
    }

    pub fn role_resolved(&self) -> bool {
        self.local_role != DtlsRole::Auto
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Start the handshake towards `remote_addr`. Call once, after ICE is
    /// connected and the role is resolved.
    pub fn run(
        &mut self,
        local_addr: SocketAddr,
        protocol: Protocol,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        if self.endpoint.is_some() {
            return Err(Error::ErrDtlsAlreadyStarted);
        }
        if !self.role_resolved() {
            return Err(Error::InvalidState("DTLS role not resolved".to_owned()));
        }

        let is_client = self.local_role == DtlsRole::Client;
        let handshake_config = Arc::new(
            dtls::config::ConfigBuilder::default()
                .with_certificates(vec![self.certificate.dtls_certificate.clone()])
                .with_srtp_protection_profiles(vec![
                    SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm,
                    SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
                ])
                .with_client_auth(ClientAuthType::RequireAnyClientCert)
                .with_insecure_skip_verify(true)
                .build(is_client, None)?,
        );

        let mut endpoint = Endpoint::new(
            local_addr,
            protocol,
            (!is_client).then(|| handshake_config.clone()),
        );

        if is_client {
            endpoint.connect(remote_addr, handshake_config, None)?;
        }

        while let Some(transmit) = endpoint.poll_transmit() {
            self.transmits.push_back(transmit);
        }

        self.endpoint = Some(endpoint);
        self.remote_addr = Some(remote_addr);
        self.set_state(DtlsState::Connecting);

        Ok(())
    }

    /// Feed an incoming DTLS record. Returns decrypted application data, if
    /// any. Handshake completion flips the state and stages the SRTP
    /// contexts for [`take_srtp_contexts`](Self::take_srtp_contexts).
    pub fn read(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) -> Result<Vec<BytesMut>> {
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| Error::InvalidState("DTLS transport not started".to_owned()))?;

        let mut application_data = vec![];
        let mut handshake_complete = false;

        match endpoint.read(now, remote, ecn, data) {
            Ok(events) => {
                for event in events {
                    match event {
                        EndpointEvent::HandshakeComplete => handshake_complete = true,
                        EndpointEvent::ApplicationData(message) => application_data.push(message),
                    }
                }
            }
            Err(err) => {
                warn!("DTLS read failed from {}: {}", remote, err);
                self.fail();
                return Err(err.into());
            }
        }

        while let Some(transmit) = endpoint.poll_transmit() {
            self.transmits.push_back(transmit);
        }

        if handshake_complete {
            if let Err(err) = self.on_handshake_complete(remote) {
                warn!("DTLS post-handshake validation failed: {}", err);
                self.fail();
                return Err(err);
            }
        }

        Ok(application_data)
    }

    /// SRTP (local, remote) contexts, available exactly once after the
    /// handshake completed.
    pub fn take_srtp_contexts(
        &mut self,
    ) -> Option<(srtp::context::Context, srtp::context::Context)> {
        self.pending_srtp.take()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };

        let remotes: Vec<SocketAddr> = endpoint.get_connections_keys().copied().collect();
        for remote in remotes {
            let _ = endpoint.handle_timeout(remote, now);
        }
        while let Some(transmit) = endpoint.poll_transmit() {
            self.transmits.push_back(transmit);
        }
    }

    pub fn poll_timeout(&self, eto: &mut Instant) {
        if let Some(endpoint) = self.endpoint.as_ref() {
            for remote in endpoint.get_connections_keys() {
                let _ = endpoint.poll_timeout(*remote, eto);
            }
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit<BytesMut>> {
        self.transmits.pop_front()
    }

    pub fn poll_state_change(&mut self) -> Option<DtlsState> {
        self.state_changes.pop_front()
    }

    pub fn close(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            if let Some(remote) = self.remote_addr {
                let _ = endpoint.close(remote);
            }
        }
        if self.state != DtlsState::Failed {
            self.set_state(DtlsState::Closed);
        }
    }

    fn fail(&mut self) {
        self.endpoint = None;
        self.set_state(DtlsState::Failed);
    }

    fn on_handshake_complete(&mut self, remote: SocketAddr) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| Error::InvalidState("DTLS transport not started".to_owned()))?;

        let state = endpoint
            .get_connection_state(remote)
            .ok_or_else(|| Error::InvalidState("no DTLS connection state".to_owned()))?;

        validate_fingerprint(state, self.remote_parameters.as_ref())?;

        let is_client = self.local_role == DtlsRole::Client;
        let (local_context, remote_context) = extract_srtp_contexts(state, is_client)?;
        self.pending_srtp = Some((local_context, remote_context));

        debug!("DTLS connected ({:?} role)", self.local_role);
        self.set_state(DtlsState::Connected);

        Ok(())
    }

    fn set_state(&mut self, state: DtlsState) {
        if self.state != state {
            self.state = state;
            self.state_changes.push_back(state);
        }
    }
}

fn validate_fingerprint(state: &State, remote_parameters: Option<&DtlsParameters>) -> Result<()> {
    let parameters = remote_parameters
        .ok_or_else(|| Error::InvalidState("no remote DTLS parameters".to_owned()))?;

    let remote_cert = state
        .peer_certificates
        .first()
        .ok_or_else(|| Error::InvalidState("no remote certificate".to_owned()))?;

    for fingerprint in &parameters.fingerprints {
        if fingerprint.algorithm != "sha-256" {
            continue;
        }
        if fingerprint_value(remote_cert) == fingerprint.value.to_lowercase() {
            return Ok(());
        }
    }

    Err(Error::InvalidState(
        "no matching certificate fingerprint".to_owned(),
    ))
}

/// Map the negotiated profile and export both directions of SRTP keying
/// material out of the DTLS handshake state.
fn extract_srtp_contexts(
    state: &State,
    is_client: bool,
) -> Result<(srtp::context::Context, srtp::context::Context)> {
    let profile = match state.srtp_protection_profile() {
        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
            ProtectionProfile::Aes128CmHmacSha1_80
        }
        SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => ProtectionProfile::AeadAes128Gcm,
        _ => {
            return Err(Error::InvalidState(
                "no negotiated SRTP protection profile".to_owned(),
            ))
        }
    };

    let mut srtp_config = srtp::config::Config {
        profile,
        ..Default::default()
    };
    srtp_config.extract_session_keys_from_dtls(state, is_client)?;

    let local_context = srtp::context::Context::new(
        &srtp_config.keys.local_master_key,
        &srtp_config.keys.local_master_salt,
        srtp_config.profile,
        srtp_config.local_rtp_options,
        srtp_config.local_rtcp_options,
    )?;

    let remote_context = srtp::context::Context::new(
        &srtp_config.keys.remote_master_key,
        &srtp_config.keys.remote_master_salt,
        srtp_config.profile,
        Some(srtp_replay_protection(
            DEFAULT_SESSION_SRTP_REPLAY_PROTECTION_WINDOW,
        )),
        Some(srtcp_replay_protection(
            DEFAULT_SESSION_SRTCP_REPLAY_PROTECTION_WINDOW,
        )),
    )?;

    Ok((local_context, remote_context))
}
