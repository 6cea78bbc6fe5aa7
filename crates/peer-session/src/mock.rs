//! In-memory [`MediaEngine`] for exercising sessions without a network.
//!
//! Every call is recorded, failures can be scripted per operation, slow
//! operations can be held until released, and ICE progress is stepped by
//! hand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::Semaphore;

use crate::engine::{
    EngineError, EngineEvent, EventSink, IceConnectionState, MediaEngine, OfferOptions,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockTrack {
    pub id: String,
}

impl MockTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddTrack,
    RemoveTrack,
    AddIceCandidate,
    Close,
}

impl MockOp {
    fn name(self) -> &'static str {
        match self {
            MockOp::CreateOffer => "create offer",
            MockOp::CreateAnswer => "create answer",
            MockOp::SetLocalDescription => "set local description",
            MockOp::SetRemoteDescription => "set remote description",
            MockOp::AddTrack => "add track",
            MockOp::RemoveTrack => "remove track",
            MockOp::AddIceCandidate => "add ice candidate",
            MockOp::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer { receive_video: bool },
    CreateAnswer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    AddTrack(String),
    RemoveTrack(String),
    AddIceCandidate(String),
    Close,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    tracks: Vec<MockTrack>,
    candidates: Vec<IceCandidate>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice_state: Option<IceConnectionState>,
    sink: Option<EventSink<MockTrack>>,
    failures: HashSet<MockOp>,
    holds: HashMap<MockOp, Arc<Semaphore>>,
    offers: u32,
    answers: u32,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail.
    pub fn fail_next(&self, op: MockOp) {
        self.state.lock().failures.insert(op);
    }

    /// Park calls to `op` until [`MockEngine::release`] is called.
    pub fn hold(&self, op: MockOp) {
        self.state
            .lock()
            .holds
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: MockOp) {
        if let Some(gate) = self.state.lock().holds.remove(&op) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Step connectivity checks and notify the attached session.
    pub fn set_ice_state(&self, state: IceConnectionState) {
        let sink = {
            let mut guard = self.state.lock();
            guard.ice_state = Some(state);
            guard.sink.clone()
        };
        if let Some(sink) = sink {
            let _ = sink.send(EngineEvent::IceStateChanged(state));
        }
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        if let Some(sink) = self.state.lock().sink.clone() {
            let _ = sink.send(EngineEvent::LocalCandidate(candidate));
        }
    }

    pub fn emit_remote_track(&self, track: MockTrack) {
        if let Some(sink) = self.state.lock().sink.clone() {
            let _ = sink.send(EngineEvent::TrackReceived(track));
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn tracks(&self) -> Vec<MockTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn has_event_sink(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Record the call, then honour scripted holds and failures.
    async fn enter(&self, op: MockOp, call: MockCall) -> Result<(), EngineError> {
        let gate = {
            let mut guard = self.state.lock();
            if guard.closed && op != MockOp::Close {
                return Err(EngineError::Closed);
            }
            guard.calls.push(call);
            guard.holds.get(&op).cloned()
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.state.lock().failures.remove(&op) {
            return Err(EngineError::rejected(op.name(), "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    type Track = MockTrack;
    type RemoteTrack = MockTrack;

    fn track_id(track: &Self::Track) -> String {
        track.id.clone()
    }

    fn attach_events(&self, sink: EventSink<Self::RemoteTrack>) {
        self.state.lock().sink = Some(sink);
    }

    fn detach_events(&self) {
        self.state.lock().sink = None;
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state
            .lock()
            .ice_state
            .unwrap_or(IceConnectionState::New)
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, EngineError> {
        self.enter(
            MockOp::CreateOffer,
            MockCall::CreateOffer {
                receive_video: options.offer_to_receive_video,
            },
        )
        .await?;
        let mut guard = self.state.lock();
        guard.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} 1 IN IP4 127.0.0.1\r\n",
            guard.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.enter(MockOp::CreateAnswer, MockCall::CreateAnswer).await?;
        let mut guard = self.state.lock();
        guard.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock-answer {} 1 IN IP4 127.0.0.1\r\n",
            guard.answers
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.enter(
            MockOp::SetLocalDescription,
            MockCall::SetLocalDescription(description.sdp_type),
        )
        .await?;
        self.state.lock().local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.enter(
            MockOp::SetRemoteDescription,
            MockCall::SetRemoteDescription(description.sdp_type),
        )
        .await?;
        self.state.lock().remote_description = Some(description);
        Ok(())
    }

    async fn add_track(&self, track: Self::Track) -> Result<(), EngineError> {
        self.enter(MockOp::AddTrack, MockCall::AddTrack(track.id.clone()))
            .await?;
        self.state.lock().tracks.push(track);
        Ok(())
    }

    async fn remove_track(&self, track: &Self::Track) -> Result<(), EngineError> {
        self.enter(MockOp::RemoveTrack, MockCall::RemoveTrack(track.id.clone()))
            .await?;
        self.state.lock().tracks.retain(|held| held.id != track.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.enter(
            MockOp::AddIceCandidate,
            MockCall::AddIceCandidate(candidate.candidate.clone()),
        )
        .await?;
        let mut guard = self.state.lock();
        if guard.remote_description.is_none() {
            return Err(EngineError::rejected(
                "add ice candidate",
                "no remote description",
            ));
        }
        guard.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.enter(MockOp::Close, MockCall::Close).await?;
        let mut guard = self.state.lock();
        guard.closed = true;
        guard.ice_state = Some(IceConnectionState::Closed);
        Ok(())
    }
}
