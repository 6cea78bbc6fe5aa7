use async_trait::async_trait;
use signal_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

/// Connectivity-check progress reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Checks have started or finished successfully.
    pub fn has_progressed(self) -> bool {
        matches!(
            self,
            IceConnectionState::Checking
                | IceConnectionState::Connected
                | IceConnectionState::Completed
        )
    }

    pub fn is_established(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub offer_to_receive_video: bool,
}

/// Notifications surfaced by the engine while a session is attached.
#[derive(Debug)]
pub enum EngineEvent<R> {
    TrackReceived(R),
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
}

pub type EventSink<R> = mpsc::UnboundedSender<EngineEvent<R>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{op} rejected by media engine: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("media engine closed")]
    Closed,
}

impl EngineError {
    pub fn rejected(op: &'static str, reason: impl ToString) -> Self {
        EngineError::Rejected {
            op,
            reason: reason.to_string(),
        }
    }
}

/// The peer-connection capability a negotiation session drives.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Outbound media track handle.
    type Track: Clone + Send + Sync + 'static;
    /// Inbound media track handle, fanned out to track listeners.
    type RemoteTrack: Send + Sync + 'static;

    fn track_id(track: &Self::Track) -> String;

    fn attach_events(&self, sink: EventSink<Self::RemoteTrack>);

    /// Stop surfacing events; called before the engine is closed.
    fn detach_events(&self);

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_track(&self, track: Self::Track) -> Result<(), EngineError>;

    async fn remove_track(&self, track: &Self::Track) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
