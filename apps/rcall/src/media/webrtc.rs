use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::dtls::crypto::Certificate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::certificate::RTCCertificate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::sink::{MediaSinks, RemoteTrack, TrackKind};
use super::{
    EngineConfig, EngineError, MediaEngine, MediaEnvironment, PeerConnectionEvent,
    PeerConnectionState, SdpKind, SessionDescription,
};
use crate::negotiation::NegotiationError;
use crate::signaling::IceCandidateDescriptor;
use crate::signaling::envelope::UNKNOWN_M_LINE_INDEX;

const STREAM_ID: &str = "rcall";
const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Local tracks fed by the capture layer. Writing samples is up to the owner.
#[derive(Clone, Default)]
pub struct SampleTracks {
    pub audio: Option<Arc<TrackLocalStaticSample>>,
    pub video: Option<Arc<TrackLocalStaticSample>>,
}

impl SampleTracks {
    /// Opus audio and, when enabled, VP8 video.
    pub fn new(config: &EngineConfig) -> Self {
        let audio = config.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio0".to_owned(),
                STREAM_ID.to_owned(),
            ))
        });
        let video = config.video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video0".to_owned(),
                STREAM_ID.to_owned(),
            ))
        });
        Self { audio, video }
    }
}

/// [`MediaEngine`] backed by a `webrtc` peer connection.
///
/// `webrtc` has no local rollback, so rolling back a pending offer closes the
/// peer connection and builds a fresh one from the same setup. The DTLS
/// certificate is generated once per engine and reused, which keeps the
/// fingerprint stable across rebuilds.
pub struct WebRtcEngine {
    pc: RwLock<Arc<RTCPeerConnection>>,
    setup: PeerSetup,
    // Callbacks of a replaced peer connection compare against this and go quiet.
    generation: Arc<AtomicU64>,
    attached: Arc<Mutex<Vec<(TrackKind, String)>>>,
}

struct PeerSetup {
    env: Arc<MediaEnvironment>,
    rtc: RTCConfiguration,
    audio: bool,
    video: bool,
    local: SampleTracks,
    sinks: MediaSinks,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
}

impl PeerSetup {
    /// With no local track for an enabled kind a receive-only transceiver is
    /// added instead, so the remote side can still send.
    async fn build(
        &self,
        gate: Gate,
        attached: &Arc<Mutex<Vec<(TrackKind, String)>>>,
    ) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let pc = Arc::new(self.env.api().new_peer_connection(self.rtc.clone()).await?);

        let wanted = [
            (self.audio, self.local.audio.clone(), RTPCodecType::Audio),
            (self.video, self.local.video.clone(), RTPCodecType::Video),
        ];
        for (enabled, track, kind) in wanted {
            if !enabled {
                continue;
            }
            match track {
                Some(track) => {
                    let track: Arc<dyn TrackLocal + Send + Sync> = track;
                    pc.add_track(track).await?;
                }
                None => {
                    let init = RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    };
                    pc.add_transceiver_from_kind(kind, Some(init)).await?;
                }
            }
        }

        install_callbacks(&pc, &self.sinks, attached, self.events.clone(), gate);
        Ok(pc)
    }
}

/// Lets callbacks of one peer connection through only while it is current.
#[derive(Clone)]
struct Gate {
    current: Arc<AtomicU64>,
    mine: u64,
}

impl Gate {
    fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.mine
    }
}

impl WebRtcEngine {
    /// Builds the peer connection and wires its callbacks to `events`.
    pub async fn new(
        env: Arc<MediaEnvironment>,
        config: &EngineConfig,
        local: SampleTracks,
        sinks: MediaSinks,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Self, NegotiationError> {
        let create_failed = |err: webrtc::Error| NegotiationError::PeerConnectionCreate(err.to_string());
        let certificate = Certificate::generate_self_signed(vec![STREAM_ID.to_owned()])
            .map_err(|err| NegotiationError::PeerConnectionCreate(err.to_string()))?;
        let mut rtc = config.rtc_configuration();
        rtc.certificates = vec![RTCCertificate::from_existing(
            certificate,
            SystemTime::now() + CERTIFICATE_LIFETIME,
        )];

        let setup = PeerSetup {
            env,
            rtc,
            audio: config.audio,
            video: config.video,
            local,
            sinks,
            events,
        };
        let generation = Arc::new(AtomicU64::new(0));
        let attached = Arc::new(Mutex::new(Vec::new()));
        let gate = Gate {
            current: Arc::clone(&generation),
            mine: 0,
        };
        let pc = setup.build(gate, &attached).await.map_err(create_failed)?;

        tracing::debug!(
            target = "rcall::media",
            audio = config.audio,
            video = config.video,
            relay_only = config.relay_only,
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );

        Ok(Self {
            pc: RwLock::new(pc),
            setup,
            generation,
            attached,
        })
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.current().signaling_state()
    }

    /// The live peer connection. Replaced by a rollback.
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.current()
    }

    fn current(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.read())
    }

    fn detach_sinks(&self) {
        let detached: Vec<(TrackKind, String)> = std::mem::take(&mut *self.attached.lock());
        for (kind, id) in detached {
            if let Some(sink) = self.setup.sinks.for_kind(kind) {
                sink.detach(&id);
            }
        }
    }

    /// Discards the pending local offer by swapping in a fresh peer
    /// connection, which starts stable with no descriptions.
    async fn rollback(&self) -> Result<(), EngineError> {
        let old = self.current();
        let state = old.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(EngineError(format!("cannot roll back in state {state}")));
        }

        let next = self.generation.load(Ordering::SeqCst) + 1;
        let gate = Gate {
            current: Arc::clone(&self.generation),
            mine: next,
        };
        let fresh = self
            .setup
            .build(gate, &self.attached)
            .await
            .map_err(EngineError::new)?;
        *self.pc.write() = fresh;
        self.generation.store(next, Ordering::SeqCst);
        self.detach_sinks();

        if let Err(err) = old.close().await {
            tracing::warn!(
                target = "rcall::media",
                error = %err,
                "closing rolled-back peer connection failed"
            );
        }
        tracing::debug!(
            target = "rcall::media",
            generation = next,
            "local offer rolled back; peer connection rebuilt"
        );
        Ok(())
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(EngineError::new),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(EngineError::new),
        SdpKind::Rollback => Err(EngineError("rollback is not a wire description".into())),
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    sinks: &MediaSinks,
    attached: &Arc<Mutex<Vec<(TrackKind, String)>>>,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    gate: Gate,
) {
    let candidate_events = events.clone();
    let candidate_gate = gate.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let events = candidate_events.clone();
        let live = candidate_gate.is_live();
        Box::pin(async move {
            if !live {
                return;
            }
            let Some(candidate) = candidate else {
                tracing::trace!(target = "rcall::media", "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let descriptor = IceCandidateDescriptor::new(
                        init.candidate,
                        init.sdp_mid,
                        init.sdp_mline_index
                            .map(i32::from)
                            .unwrap_or(UNKNOWN_M_LINE_INDEX),
                    );
                    let _ = events.send(PeerConnectionEvent::LocalCandidate(descriptor));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "rcall::media",
                        error = %err,
                        "failed to serialise local ice candidate"
                    );
                }
            }
        })
    }));

    let state_events = events.clone();
    let state_gate = gate.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = state_events.clone();
        let live = state_gate.is_live();
        Box::pin(async move {
            if !live {
                tracing::trace!(target = "rcall::media", ?state, "ignoring replaced peer connection");
                return;
            }
            tracing::debug!(target = "rcall::media", ?state, "ice connection state changed");
            let mapped = match state {
                RTCIceConnectionState::Checking => PeerConnectionState::Checking,
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    PeerConnectionState::Connected
                }
                RTCIceConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCIceConnectionState::Failed => PeerConnectionState::Failed,
                RTCIceConnectionState::Closed => PeerConnectionState::Closed,
                _ => return,
            };
            let _ = events.send(PeerConnectionEvent::StateChanged(mapped));
        })
    }));

    let renegotiate_events = events;
    let renegotiate_gate = gate.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let events = renegotiate_events.clone();
        let live = renegotiate_gate.is_live();
        Box::pin(async move {
            if live {
                let _ = events.send(PeerConnectionEvent::RenegotiationNeeded);
            }
        })
    }));

    let sinks = sinks.clone();
    let attached = Arc::clone(attached);
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sinks = sinks.clone();
        let attached = Arc::clone(&attached);
        let live = gate.is_live();
        Box::pin(async move {
            if !live {
                return;
            }
            let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                return;
            };
            let remote = RemoteTrack {
                id: track.id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind,
                track,
            };
            tracing::debug!(
                target = "rcall::media",
                track_id = %remote.id,
                kind = ?kind,
                "remote track received"
            );
            if let Some(sink) = sinks.for_kind(kind) {
                attached.lock().push((kind, remote.id.clone()));
                sink.attach(remote);
            }
        })
    }));
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let pc = self.current();
        let offer = pc.create_offer(None).await.map_err(EngineError::new)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let pc = self.current();
        let answer = pc.create_answer(None).await.map_err(EngineError::new)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if desc.kind == SdpKind::Rollback {
            return self.rollback().await;
        }
        let desc = to_rtc(desc)?;
        let pc = self.current();
        pc.set_local_description(desc).await.map_err(EngineError::new)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc(desc)?;
        let pc = self.current();
        pc.set_remote_description(desc).await.map_err(EngineError::new)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateDescriptor) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: u16::try_from(candidate.sdp_m_line_index).ok(),
            username_fragment: None,
        };
        let pc = self.current();
        pc.add_ice_candidate(init).await.map_err(EngineError::new)
    }

    async fn has_remote_description(&self) -> bool {
        let pc = self.current();
        pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.detach_sinks();
        let pc = self.current();
        pc.close().await.map_err(EngineError::new)
    }
}
