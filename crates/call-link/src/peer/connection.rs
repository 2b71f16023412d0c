//! `webrtc`-backed peer link

use super::{
    CandidateType, LinkEventSink, LinkOptions, LinkState, LocalCandidate, NegotiationEvent,
    PeerLink, PeerLinkFactory, SignalingState,
};
use crate::config::{CallLinkConfig, TurnServerConfig};
use crate::media::MediaStream;
use crate::signaling::protocol::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Builds [`RtcPeerLink`]s from the configured STUN/TURN servers
#[derive(Debug, Clone)]
pub struct RtcPeerLinkFactory {
    stun_servers: Vec<String>,
    turn_servers: Vec<TurnServerConfig>,
}

impl RtcPeerLinkFactory {
    /// Create a factory for the servers in `config`
    pub fn new(config: &CallLinkConfig) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(
        &self,
        options: LinkOptions,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = RtcPeerLink::new(options, self.ice_servers(), events).await?;
        Ok(Arc::new(link))
    }
}

/// One `RTCPeerConnection` and the senders of its attached tracks
pub struct RtcPeerLink {
    generation: u64,
    relay_only: bool,
    peer_connection: Arc<RTCPeerConnection>,
    /// Retained so attached tracks are not cleaned up
    senders: RwLock<Vec<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

impl RtcPeerLink {
    /// Build a peer connection and wire its callbacks into `events`
    #[instrument(
        skip(ice_servers, events),
        fields(generation = options.generation, relay_only = options.relay_only)
    )]
    pub async fn new(
        options: LinkOptions,
        ice_servers: Vec<RTCIceServer>,
        events: LinkEventSink,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_transport_policy = if options.relay_only {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        };

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    if let Some(state) = map_connection_state(s) {
                        debug!(generation = events.generation(), ?state, "Link state changed");
                        events.emit(NegotiationEvent::StateChanged(state));
                    }
                })
            },
        ));

        let signaling_events = events.clone();
        peer_connection.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            let events = signaling_events.clone();
            Box::pin(async move {
                if let Some(state) = map_signaling_state(s) {
                    events.emit(NegotiationEvent::SignalingChanged(state));
                }
            })
        }));

        let candidate_events = events;
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            events.emit(NegotiationEvent::CandidateFound(LocalCandidate {
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_m_line_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                },
                                kind: map_candidate_type(candidate.typ),
                            }));
                        }
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    },
                    None => {
                        events.emit(NegotiationEvent::GatheringComplete);
                    }
                }
            })
        }));

        info!("Peer link created");

        Ok(Self {
            generation: options.generation,
            relay_only: options.relay_only,
            peer_connection,
            senders: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the link only uses relay candidates
    pub fn relay_only(&self) -> bool {
        self.relay_only
    }

    async fn local_sdp(&self, what: &str) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError(format!("No local description after setting {}", what)))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };

        let offer = self
            .peer_connection
            .create_offer(Some(options))
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!(generation = self.generation, ice_restart, "Created SDP offer");

        self.local_sdp("offer").await
    }

    async fn accept_offer(&self, sdp: String, rollback: bool) -> Result<String> {
        // Nothing to roll back if our offer never got applied
        if rollback && self.peer_connection.signaling_state() == RTCSignalingState::HaveLocalOffer {
            let mut description = RTCSessionDescription::default();
            description.sdp_type = RTCSdpType::Rollback;
            self.peer_connection
                .set_local_description(description)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)))?;
            debug!(generation = self.generation, "Rolled back local offer");
        }

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!(generation = self.generation, "Created SDP answer");

        self.local_sdp("answer").await
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn attach_stream(&self, stream: &MediaStream) -> Result<()> {
        let mut senders = self.senders.write().await;
        for track in stream.tracks() {
            let sender = self
                .peer_connection
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!("Failed to add track {}: {}", track.id(), e))
                })?;
            senders.push(sender);
        }

        debug!(
            generation = self.generation,
            tracks = stream.tracks().len(),
            "Attached capture stream"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(generation = self.generation, "Closing peer link");
        self.senders.write().await.clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            Some(SignalingState::HaveLocalOffer)
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            Some(SignalingState::HaveRemoteOffer)
        }
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        _ => None,
    }
}

fn map_candidate_type(typ: RTCIceCandidateType) -> CandidateType {
    match typ {
        RTCIceCandidateType::Srflx => CandidateType::ServerReflexive,
        RTCIceCandidateType::Prflx => CandidateType::PeerReflexive,
        RTCIceCandidateType::Relay => CandidateType::Relay,
        _ => CandidateType::Host,
    }
}
