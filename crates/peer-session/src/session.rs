use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use signal_proto::{
    encode_payload, IceCandidate, MessageKind, SessionDescription, SignalingEnvelope,
};
use signal_relay::{EndpointChannel, SignalingLink};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{EngineEvent, IceConnectionState, MediaEngine, OfferOptions};
use crate::error::SessionError;
use crate::listeners::Listeners;
use crate::state::NegotiationState;

/// Invoked after every `end()`, once the closed event has been emitted.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    pub identity: String,
}

pub(crate) struct HeldTrack<T> {
    pub(crate) id: String,
    pub(crate) track: T,
    /// Added to the engine; cleared tracks must be removed from it again.
    pub(crate) attached: bool,
}

pub(crate) struct SessionInner<T> {
    pub(crate) outbound: Option<HeldTrack<T>>,
    /// Remote candidates by sender, held until a remote description from
    /// that sender is applied.
    pub(crate) pending_candidates: VecDeque<(String, IceCandidate)>,
    /// The engine holds a remote description.
    pub(crate) remote_applied: bool,
    pub(crate) answer_gate: Option<JoinHandle<()>>,
}

/// Offer/answer state machine for one endpoint.
///
/// Inbound envelopes are handled one at a time in delivery order by a
/// dedicated task; engine notifications by a second one. Both hold only a
/// weak reference, so dropping the last `Arc` stops them as well.
pub struct NegotiationSession<E: MediaEngine> {
    pub(crate) identity: String,
    pub(crate) link: SignalingLink,
    config: SessionConfig,
    pub(crate) engine: Mutex<Option<Arc<E>>>,
    pub(crate) inner: Mutex<SessionInner<E::Track>>,
    /// Bumped by `end()`; in-flight engine results from an older generation
    /// are discarded.
    pub(crate) generation: AtomicU64,
    state_tx: watch::Sender<NegotiationState>,
    ice_tx: watch::Sender<IceConnectionState>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) track_received: Listeners<E::RemoteTrack>,
    pub(crate) connection_closed: Listeners<SessionClosed>,
    state_changed: Listeners<NegotiationState>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl<E: MediaEngine> NegotiationSession<E> {
    /// Take ownership of `engine` and start consuming `channel`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        engine: E,
        channel: EndpointChannel,
        config: SessionConfig,
        on_complete: Option<CompletionCallback>,
    ) -> Arc<Self> {
        let EndpointChannel { link, inbound } = channel;
        let engine = Arc::new(engine);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        engine.attach_events(events_tx);
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (ice_tx, _) = watch::channel(engine.ice_connection_state());

        let session = Arc::new(Self {
            identity: link.identity().to_string(),
            link,
            config,
            engine: Mutex::new(Some(engine)),
            inner: Mutex::new(SessionInner {
                outbound: None,
                pending_candidates: VecDeque::new(),
                remote_applied: false,
                answer_gate: None,
            }),
            generation: AtomicU64::new(0),
            state_tx,
            ice_tx,
            tasks: Mutex::new(Vec::new()),
            track_received: Listeners::default(),
            connection_closed: Listeners::default(),
            state_changed: Listeners::default(),
            on_complete,
        });

        let signaling = tokio::spawn(Self::pump_signaling(Arc::downgrade(&session), inbound));
        let events = tokio::spawn(Self::pump_engine_events(
            Arc::downgrade(&session),
            events_rx,
        ));
        session.tasks.lock().extend([signaling, events]);
        if session.state().is_closed() {
            // end() may have run on the pump before the handles were stored.
            for task in session.tasks.lock().drain(..) {
                task.abort();
            }
        }
        debug!(target = "signaling", identity = %session.identity, "negotiation session started");
        session
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        *self.ice_tx.borrow()
    }

    /// Listeners for inbound media tracks.
    pub fn track_received(&self) -> &Listeners<E::RemoteTrack> {
        &self.track_received
    }

    /// Listeners notified every time `end()` runs.
    pub fn connection_closed(&self) -> &Listeners<SessionClosed> {
        &self.connection_closed
    }

    pub fn state_changes(&self) -> &Listeners<NegotiationState> {
        &self.state_changed
    }

    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending_candidates.len()
    }

    pub fn held_track_id(&self) -> Option<String> {
        self.inner.lock().outbound.as_ref().map(|held| held.id.clone())
    }

    /// Hold `track` for the next offer. Holding the same track again is a no-op;
    /// a different track replaces the held one and detaches it from the engine.
    pub async fn attach_track(&self, track: E::Track) -> Result<(), SessionError> {
        if self.state().is_closed() {
            return Err(SessionError::Closed);
        }
        let id = E::track_id(&track);
        let replaced = {
            let mut inner = self.inner.lock();
            if inner.outbound.as_ref().is_some_and(|held| held.id == id) {
                return Ok(());
            }
            inner.outbound.replace(HeldTrack {
                id,
                track,
                attached: false,
            })
        };
        match replaced {
            Some(previous) => self.detach_from_engine(previous).await,
            None => Ok(()),
        }
    }

    pub async fn remove_track(&self) -> Result<(), SessionError> {
        let held = self.inner.lock().outbound.take();
        match held {
            Some(held) => self.detach_from_engine(held).await,
            None => Ok(()),
        }
    }

    /// Offer the held track (if any) to `peer`, asking for inbound video.
    ///
    /// On failure nothing is sent and the state is left as it was.
    pub async fn send_track(&self, peer: &str) -> Result<(), SessionError> {
        let result = self.offer_to(peer).await;
        match &result {
            Ok(()) => info!(target = "signaling", identity = %self.identity, peer, "offer sent"),
            Err(SessionError::Stale) => {
                debug!(target = "signaling", identity = %self.identity, peer, "offer discarded, session ended")
            }
            Err(err) => warn!(
                target = "signaling",
                identity = %self.identity,
                peer,
                error = %err,
                state = %self.state(),
                "offer failed"
            ),
        }
        result
    }

    async fn offer_to(&self, peer: &str) -> Result<(), SessionError> {
        let engine = self.engine()?;
        let generation = self.generation();
        let current = self.state();
        if !current.can_transition_to(NegotiationState::OfferSent) {
            return Err(SessionError::InvalidTransition {
                from: current,
                to: NegotiationState::OfferSent,
            });
        }

        self.attach_held_track(&engine, generation).await?;
        let offer = engine
            .create_offer(OfferOptions {
                offer_to_receive_video: self.config.offer_to_receive_video,
            })
            .await?;
        self.ensure_current(generation)?;
        engine.set_local_description(offer.clone()).await?;
        self.ensure_current(generation)?;

        let payload = encode_payload(&offer)?;
        self.transition(Some(current), NegotiationState::OfferSent)?;
        self.inner.lock().pending_candidates.clear();
        if let Err(err) = self.link.send_to(peer, MessageKind::Offer, Some(payload)) {
            let _ = self.transition(Some(NegotiationState::OfferSent), NegotiationState::Idle);
            return Err(err.into());
        }
        Ok(())
    }

    async fn pump_signaling(
        session: Weak<Self>,
        mut inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    ) {
        while let Some(envelope) = inbound.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.handle_envelope(envelope).await;
            if session.state().is_closed() {
                break;
            }
        }
    }

    async fn pump_engine_events(
        session: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent<E::RemoteTrack>>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.handle_engine_event(event);
        }
    }

    pub(crate) async fn handle_envelope(self: &Arc<Self>, envelope: SignalingEnvelope) {
        if !envelope.is_addressed_to(&self.identity) {
            debug!(target = "signaling", identity = %self.identity, from = %envelope.sender, "ignoring envelope addressed elsewhere");
            return;
        }
        match envelope.kind {
            MessageKind::Offer => self.on_offer(envelope).await,
            MessageKind::Answer => self.on_answer(envelope),
            MessageKind::Candidate => self.on_candidate(envelope).await,
            MessageKind::End => {
                info!(target = "signaling", identity = %self.identity, from = %envelope.sender, "end received");
                self.end().await;
            }
            MessageKind::Log => {
                debug!(target = "signaling", identity = %self.identity, "log envelope ignored by session")
            }
        }
    }

    async fn on_offer(&self, envelope: SignalingEnvelope) {
        let offer: SessionDescription = match envelope.decode() {
            Ok(offer) => offer,
            Err(err) => {
                warn!(target = "signaling", identity = %self.identity, from = %envelope.sender, error = %err, "dropping offer");
                return;
            }
        };
        let peer = envelope.sender;
        match self.answer_offer(&peer, offer).await {
            Ok(()) => info!(target = "signaling", identity = %self.identity, peer = %peer, "answer sent"),
            Err(SessionError::Stale | SessionError::Closed) => {
                debug!(target = "signaling", identity = %self.identity, peer = %peer, "offer discarded, session ended")
            }
            Err(err) => warn!(
                target = "signaling",
                identity = %self.identity,
                peer = %peer,
                error = %err,
                state = %self.state(),
                "answering offer failed"
            ),
        }
    }

    async fn answer_offer(&self, peer: &str, offer: SessionDescription) -> Result<(), SessionError> {
        let engine = self.engine()?;
        let generation = self.generation();
        self.transition(None, NegotiationState::OfferReceived)?;
        if let Some(gate) = self.inner.lock().answer_gate.take() {
            gate.abort();
        }

        engine.set_remote_description(offer).await?;
        self.ensure_current(generation)?;
        self.flush_candidates(&engine, peer).await;
        self.attach_held_track(&engine, generation).await?;

        let answer = engine.create_answer().await?;
        self.ensure_current(generation)?;
        engine.set_local_description(answer.clone()).await?;
        self.ensure_current(generation)?;

        let payload = encode_payload(&answer)?;
        self.transition(
            Some(NegotiationState::OfferReceived),
            NegotiationState::AnswerPending,
        )?;
        self.link.send_to(peer, MessageKind::Answer, Some(payload))?;
        if self.ice_state().is_established() {
            let _ = self.transition(
                Some(NegotiationState::AnswerPending),
                NegotiationState::Connected,
            );
        }
        Ok(())
    }

    fn on_answer(self: &Arc<Self>, envelope: SignalingEnvelope) {
        let answer: SessionDescription = match envelope.decode() {
            Ok(answer) => answer,
            Err(err) => {
                warn!(target = "signaling", identity = %self.identity, from = %envelope.sender, error = %err, "dropping answer");
                return;
            }
        };
        if let Err(err) = self.transition(
            Some(NegotiationState::OfferSent),
            NegotiationState::AnswerPending,
        ) {
            warn!(target = "signaling", identity = %self.identity, from = %envelope.sender, error = %err, "ignoring unexpected answer");
            return;
        }
        debug!(target = "signaling", identity = %self.identity, from = %envelope.sender, "answer held until connectivity checks start");
        let generation = self.generation();
        let gate = tokio::spawn(Arc::clone(self).commit_answer_when_checking(
            envelope.sender,
            answer,
            generation,
        ));
        if let Some(previous) = self.inner.lock().answer_gate.replace(gate) {
            previous.abort();
        }
    }

    /// Apply a held answer once ICE reports `checking` or later.
    ///
    /// Applying the answer before local connectivity checks have begun races
    /// candidate gathering in some engines.
    async fn commit_answer_when_checking(
        self: Arc<Self>,
        peer: String,
        answer: SessionDescription,
        generation: u64,
    ) {
        let mut ice = self.ice_tx.subscribe();
        let limit = self.config.answer_commit_timeout;
        let progressed = timeout(limit, async move {
            ice.wait_for(|state| state.has_progressed())
                .await
                .map(|_| ())
        })
        .await;

        match progressed {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return,
            Err(_) => {
                if self.ensure_current(generation).is_ok()
                    && self
                        .transition(
                            Some(NegotiationState::AnswerPending),
                            NegotiationState::Idle,
                        )
                        .is_ok()
                {
                    warn!(
                        target = "signaling",
                        identity = %self.identity,
                        timeout_ms = limit.as_millis() as u64,
                        "connectivity checks never started, answer discarded"
                    );
                }
                return;
            }
        }

        if self.ensure_current(generation).is_err()
            || self.state() != NegotiationState::AnswerPending
        {
            debug!(target = "signaling", identity = %self.identity, "held answer is stale");
            return;
        }
        let Ok(engine) = self.engine() else {
            return;
        };
        match engine.set_remote_description(answer).await {
            Ok(()) => {
                if self.ensure_current(generation).is_err() {
                    return;
                }
                self.flush_candidates(&engine, &peer).await;
                if self
                    .transition(
                        Some(NegotiationState::AnswerPending),
                        NegotiationState::Connected,
                    )
                    .is_ok()
                {
                    info!(target = "signaling", identity = %self.identity, "remote answer applied");
                }
            }
            Err(err) => {
                warn!(target = "signaling", identity = %self.identity, error = %err, "applying remote answer failed");
                let _ = self.transition(
                    Some(NegotiationState::AnswerPending),
                    NegotiationState::OfferSent,
                );
            }
        }
    }

    async fn on_candidate(&self, envelope: SignalingEnvelope) {
        let candidate: IceCandidate = match envelope.decode() {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(target = "signaling", identity = %self.identity, from = %envelope.sender, error = %err, "dropping candidate");
                return;
            }
        };
        let Ok(engine) = self.engine() else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            if !inner.remote_applied {
                inner.pending_candidates.push_back((envelope.sender, candidate));
                let mut dropped = 0;
                while inner.pending_candidates.len() > self.config.max_pending_candidates {
                    inner.pending_candidates.pop_front();
                    dropped += 1;
                }
                debug!(
                    target = "signaling",
                    identity = %self.identity,
                    queued = inner.pending_candidates.len(),
                    dropped,
                    "candidate queued until a remote description is applied"
                );
                return;
            }
        }
        self.apply_candidate(&engine, candidate).await;
    }

    /// Apply the queued candidates sent by `peer`; the rest belong to other
    /// sessions and are dropped.
    async fn flush_candidates(&self, engine: &Arc<E>, peer: &str) {
        let (matching, foreign): (Vec<_>, Vec<_>) = {
            let mut inner = self.inner.lock();
            inner.remote_applied = true;
            std::mem::take(&mut inner.pending_candidates)
                .into_iter()
                .partition(|(sender, _)| sender == peer)
        };
        if !matching.is_empty() || !foreign.is_empty() {
            debug!(
                target = "signaling",
                identity = %self.identity,
                peer = %peer,
                applied = matching.len(),
                dropped = foreign.len(),
                "flushing queued candidates"
            );
        }
        for (_, candidate) in matching {
            self.apply_candidate(engine, candidate).await;
        }
    }

    async fn apply_candidate(&self, engine: &Arc<E>, candidate: IceCandidate) {
        if let Err(err) = engine.add_ice_candidate(candidate).await {
            warn!(target = "signaling", identity = %self.identity, error = %err, "remote candidate rejected");
        }
    }

    fn handle_engine_event(&self, event: EngineEvent<E::RemoteTrack>) {
        match event {
            EngineEvent::LocalCandidate(candidate) => self.broadcast_candidate(candidate),
            EngineEvent::IceStateChanged(state) => {
                self.ice_tx.send_replace(state);
                debug!(target = "signaling", identity = %self.identity, ?state, "ice state");
                let answered = {
                    let inner = self.inner.lock();
                    inner.remote_applied
                        && inner.answer_gate.as_ref().map_or(true, |gate| gate.is_finished())
                };
                if state.is_established()
                    && answered
                    && self
                        .transition(
                            Some(NegotiationState::AnswerPending),
                            NegotiationState::Connected,
                        )
                        .is_ok()
                {
                    info!(target = "signaling", identity = %self.identity, "connected");
                }
            }
            EngineEvent::TrackReceived(track) => {
                let notified = self.track_received.emit(&track);
                debug!(target = "signaling", identity = %self.identity, listeners = notified, "remote track received");
            }
        }
    }

    /// Local candidates go to every other endpoint; peers drop the ones that
    /// do not match their session.
    fn broadcast_candidate(&self, candidate: IceCandidate) {
        if self.state().is_closed() {
            return;
        }
        let payload = match encode_payload(&candidate) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "signaling", identity = %self.identity, error = %err, "failed to encode local candidate");
                return;
            }
        };
        if let Err(err) = self.link.broadcast(MessageKind::Candidate, Some(payload)) {
            warn!(target = "signaling", identity = %self.identity, error = %err, "failed to broadcast local candidate");
        }
    }

    async fn attach_held_track(&self, engine: &Arc<E>, generation: u64) -> Result<(), SessionError> {
        let pending = self
            .inner
            .lock()
            .outbound
            .as_ref()
            .filter(|held| !held.attached)
            .map(|held| (held.id.clone(), held.track.clone()));
        let Some((id, track)) = pending else {
            return Ok(());
        };
        engine.add_track(track).await?;
        self.ensure_current(generation)?;
        if let Some(held) = self.inner.lock().outbound.as_mut() {
            if held.id == id {
                held.attached = true;
            }
        }
        Ok(())
    }

    async fn detach_from_engine(&self, held: HeldTrack<E::Track>) -> Result<(), SessionError> {
        if !held.attached {
            return Ok(());
        }
        let Ok(engine) = self.engine() else {
            return Ok(());
        };
        engine.remove_track(&held.track).await?;
        Ok(())
    }

    pub(crate) fn engine(&self) -> Result<Arc<E>, SessionError> {
        self.engine.lock().clone().ok_or(SessionError::Closed)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_current(&self, generation: u64) -> Result<(), SessionError> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(SessionError::Stale)
        }
    }

    /// Move to `next`, optionally only from `expected`.
    pub(crate) fn transition(
        &self,
        expected: Option<NegotiationState>,
        next: NegotiationState,
    ) -> Result<NegotiationState, SessionError> {
        let mut outcome = Err(SessionError::Closed);
        self.state_tx.send_if_modified(|state| {
            let current = *state;
            let allowed = expected.map_or(true, |expected| expected == current)
                && current.can_transition_to(next);
            if allowed {
                *state = next;
                outcome = Ok(current);
            } else if !current.is_closed() {
                outcome = Err(SessionError::InvalidTransition {
                    from: current,
                    to: next,
                });
            }
            allowed
        });
        if let Ok(previous) = outcome {
            debug!(target = "signaling", identity = %self.identity, from = %previous, to = %next, "state");
            self.state_changed.emit(&next);
        }
        outcome
    }
}
