use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::engine::{
    EngineError, EngineEvent, EventSink, IceConnectionState, MediaEngine, OfferOptions,
};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug)]
pub struct RtcEngineConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl RtcEngineConfig {
    /// Public STUN unless `SIGNAL_WEBRTC_DISABLE_STUN` is set.
    pub fn from_env() -> Self {
        if std::env::var("SIGNAL_WEBRTC_DISABLE_STUN").is_ok() {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    /// No STUN/TURN servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }
}

impl Default for RtcEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
        }
    }
}

/// [`MediaEngine`] backed by a webrtc-rs peer connection.
pub struct RtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(String, Arc<RTCRtpSender>)>>,
}

impl RtcEngine {
    pub async fn new(config: RtcEngineConfig) -> Result<Self, EngineError> {
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|err| EngineError::rejected("register codecs", err))?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(|err| EngineError::rejected("register interceptors", err))?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers,
            ..Default::default()
        };
        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|err| EngineError::rejected("create peer connection", err))?;

        Ok(Self {
            peer_connection: Arc::new(peer_connection),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    async fn ensure_video_receiver(&self) -> Result<(), EngineError> {
        let transceivers = self.peer_connection.get_transceivers().await;
        if transceivers
            .iter()
            .any(|transceiver| transceiver.kind() == RTPCodecType::Video)
        {
            return Ok(());
        }
        self.peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|err| EngineError::rejected("add video transceiver", err))?;
        Ok(())
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, EngineError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(EngineError::rejected(
                "parse description",
                "rollback is not supported",
            ))
        }
    };
    parsed.map_err(|err| EngineError::rejected("parse description", err))
}

fn from_rtc_description(description: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    type Track = LocalTrack;
    type RemoteTrack = Arc<TrackRemote>;

    fn track_id(track: &Self::Track) -> String {
        track.id().to_string()
    }

    fn attach_events(&self, sink: EventSink<Self::RemoteTrack>) {
        let candidates = sink.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = candidates.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = sink.send(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                        }
                    }
                })
            }));

        let states = sink.clone();
        self.peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                debug!(target = "webrtc", ?state, "ice connection state changed");
                let _ = states.send(EngineEvent::IceStateChanged(map_ice_state(state)));
                Box::pin(async {})
            },
        ));

        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                debug!(target = "webrtc", track_id = %track.id(), "remote track arrived");
                let _ = sink.send(EngineEvent::TrackReceived(track));
                Box::pin(async {})
            },
        ));
    }

    fn detach_events(&self) {
        self.peer_connection
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.peer_connection
            .on_ice_connection_state_change(Box::new(|_: RTCIceConnectionState| {
                Box::pin(async {})
            }));
        self.peer_connection.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.peer_connection.ice_connection_state())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, EngineError> {
        if options.offer_to_receive_video {
            self.ensure_video_receiver().await?;
        }
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| EngineError::rejected("create offer", err))?;
        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| EngineError::rejected("create answer", err))?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|err| EngineError::rejected("set local description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::rejected("set remote description", err))
    }

    async fn add_track(&self, track: Self::Track) -> Result<(), EngineError> {
        let id = Self::track_id(&track);
        let sender = self
            .peer_connection
            .add_track(track)
            .await
            .map_err(|err| EngineError::rejected("add track", err))?;

        // RTCP has to be drained for the interceptors to make progress.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().push((id, sender));
        Ok(())
    }

    async fn remove_track(&self, track: &Self::Track) -> Result<(), EngineError> {
        let id = Self::track_id(track);
        let sender = {
            let mut senders = self.senders.lock();
            let index = senders.iter().position(|(sender_id, _)| *sender_id == id);
            index.map(|index| senders.remove(index).1)
        };
        let Some(sender) = sender else {
            return Ok(());
        };
        self.peer_connection
            .remove_track(&sender)
            .await
            .map_err(|err| EngineError::rejected("remove track", err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| EngineError::rejected("add ice candidate", err))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|err| EngineError::rejected("close", err))
    }
}
