mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use peer_session::mock::{MockCall, MockEngine, MockOp, MockTrack};
use peer_session::{
    CompletionCallback, NegotiationSession, NegotiationState, SessionConfig, SessionError,
};
use signal_proto::{ChannelMessage, IceCandidate, SignalingEnvelope};
use signal_relay::{RelayConfig, RelayHost};

use support::{call, eventually, settle, wait_for_state};

fn counter() -> (Arc<AtomicUsize>, CompletionCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let callback: CompletionCallback = {
        let count = Arc::clone(&count);
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (count, callback)
}

#[test_timeout::tokio_timeout_test(30)]
async fn end_releases_the_engine_once_and_notifies_every_time() {
    let host = RelayHost::new(RelayConfig::default());
    let engine = MockEngine::new();
    let (completions, on_complete) = counter();
    let session = NegotiationSession::spawn(
        engine.clone(),
        host.connect("alice"),
        SessionConfig::default(),
        Some(on_complete),
    );
    assert!(engine.has_event_sink());

    let closed = Arc::new(Mutex::new(Vec::new()));
    {
        let closed = Arc::clone(&closed);
        session.connection_closed().add(move |event| {
            closed.lock().push(event.identity.clone());
        });
    }
    session.track_received().add(|_| {});

    session.end().await;
    assert_eq!(session.state(), NegotiationState::Closed);
    assert!(engine.is_closed());
    assert!(!engine.has_event_sink());
    assert!(session.track_received().is_empty());
    assert_eq!(*closed.lock(), vec!["alice".to_string()]);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    session.end().await;
    assert_eq!(engine.count(|call| *call == MockCall::Close), 1);
    assert_eq!(closed.lock().len(), 2);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
}

#[test_timeout::tokio_timeout_test(30)]
async fn closed_state_is_reported_once() {
    let call = call(SessionConfig::default());
    let alice = &call.alice;
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        alice.session.state_changes().add(move |state| transitions.lock().push(*state));
    }

    alice.session.send_track("bob").await.unwrap();
    alice.session.end().await;
    alice.session.end().await;
    assert_eq!(
        *transitions.lock(),
        vec![NegotiationState::OfferSent, NegotiationState::Closed]
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn operations_after_end_fail_closed() {
    let call = call(SessionConfig::default());
    let alice = &call.alice;
    alice.session.end().await;

    assert!(matches!(
        alice.session.send_track("bob").await,
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        alice.session.attach_track(MockTrack::new("camera")).await,
        Err(SessionError::Closed)
    ));
    assert!(alice.engine.calls().iter().all(|call| *call == MockCall::Close));
}

#[test_timeout::tokio_timeout_test(30)]
async fn hang_up_ends_both_sides() {
    let call = call(SessionConfig::default());
    let (alice, bob) = (&call.alice, &call.bob);

    alice.session.send_track("bob").await.unwrap();
    wait_for_state(&bob.session, NegotiationState::AnswerPending).await;

    alice.session.hang_up("bob").await;
    assert_eq!(alice.session.state(), NegotiationState::Closed);
    wait_for_state(&bob.session, NegotiationState::Closed).await;
    assert!(bob.engine.is_closed());
    assert!(alice.engine.is_closed());
}

#[test_timeout::tokio_timeout_test(30)]
async fn relay_close_ends_the_session() {
    let call = call(SessionConfig::default());
    assert!(call.host.close_client_connection("bob"));
    wait_for_state(&call.bob.session, NegotiationState::Closed).await;
    assert!(call.bob.engine.is_closed());
    assert_eq!(call.alice.session.state(), NegotiationState::Idle);
}

#[test_timeout::tokio_timeout_test(30)]
async fn offer_finishing_after_end_is_discarded() {
    let call = call(SessionConfig::default());
    let (alice, bob) = (&call.alice, &call.bob);

    alice.engine.hold(MockOp::CreateOffer);
    let pending = {
        let session = Arc::clone(&alice.session);
        tokio::spawn(async move { session.send_track("bob").await })
    };
    eventually("offer creation to start", || {
        alice
            .engine
            .count(|call| matches!(call, MockCall::CreateOffer { .. }))
            == 1
    })
    .await;

    alice.session.end().await;
    alice.engine.release(MockOp::CreateOffer);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::Stale)), "{result:?}");
    assert_eq!(alice.session.state(), NegotiationState::Closed);
    assert!(alice.engine.local_description().is_none());

    settle().await;
    assert!(bob.engine.calls().is_empty());
    assert_eq!(bob.session.state(), NegotiationState::Idle);
}

#[test_timeout::tokio_timeout_test(30)]
async fn answer_finishing_after_end_is_not_sent() {
    let call = call(SessionConfig::default());
    let (alice, bob) = (&call.alice, &call.bob);

    bob.engine.hold(MockOp::CreateAnswer);
    alice.session.send_track("bob").await.unwrap();
    eventually("answer creation to start", || {
        bob.engine.count(|call| *call == MockCall::CreateAnswer) == 1
    })
    .await;

    bob.session.end().await;
    bob.engine.release(MockOp::CreateAnswer);
    settle().await;

    assert_eq!(bob.session.state(), NegotiationState::Closed);
    assert_eq!(alice.session.state(), NegotiationState::OfferSent);
}

#[test_timeout::tokio_timeout_test(30)]
async fn events_after_end_are_ignored() {
    let host = RelayHost::new(RelayConfig::default());
    let engine = MockEngine::new();
    let session = NegotiationSession::spawn(
        engine.clone(),
        host.connect("alice"),
        SessionConfig::default(),
        None,
    );
    let mut watcher = host.connect("watcher");

    session.end().await;
    engine.emit_local_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
    engine.emit_remote_track(MockTrack::new("late"));
    settle().await;

    assert!(watcher.inbound.try_recv().is_err());
    assert_eq!(session.state(), NegotiationState::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn end_from_relay_does_not_leave_pending_candidates() {
    let call = call(SessionConfig::default());
    let (alice, bob) = (&call.alice, &call.bob);

    alice
        .engine
        .emit_local_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
    eventually("bob to queue the candidate", || bob.session.pending_candidates() == 1).await;

    call.host
        .dispatcher()
        .handle(ChannelMessage::Relay(SignalingEnvelope::end("alice", "bob")));
    wait_for_state(&bob.session, NegotiationState::Closed).await;
    assert_eq!(bob.session.pending_candidates(), 0);
    assert!(!bob
        .engine
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::AddIceCandidate(_))));
}

#[test_timeout::tokio_timeout_test(30)]
async fn end_queued_before_spawn_closes_the_session() {
    let host = RelayHost::new(RelayConfig::default());
    let mut watcher = host.connect("carol");
    let channel = host.connect("bob");
    host.dispatcher()
        .handle(ChannelMessage::Relay(SignalingEnvelope::end("alice", "bob")));

    let engine = MockEngine::new();
    let (completions, on_complete) = counter();
    let session = NegotiationSession::spawn(
        engine.clone(),
        channel,
        SessionConfig::default(),
        Some(on_complete),
    );
    wait_for_state(&session, NegotiationState::Closed).await;
    assert!(engine.is_closed());
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    engine.emit_local_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host"));
    settle().await;
    assert!(watcher.inbound.try_recv().is_err());
    assert_eq!(engine.calls(), vec![MockCall::Close]);
}
