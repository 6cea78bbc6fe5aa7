#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peer_session::mock::MockEngine;
use peer_session::{NegotiationSession, NegotiationState, SessionConfig};
use signal_relay::{RelayConfig, RelayHost};
use tokio::time::timeout;

pub type Session = Arc<NegotiationSession<MockEngine>>;

pub struct Endpoint {
    pub session: Session,
    pub engine: MockEngine,
}

pub fn endpoint(host: &RelayHost, identity: &str, config: SessionConfig) -> Endpoint {
    let engine = MockEngine::new();
    let session = NegotiationSession::spawn(engine.clone(), host.connect(identity), config, None);
    Endpoint { session, engine }
}

pub struct Call {
    pub host: RelayHost,
    pub alice: Endpoint,
    pub bob: Endpoint,
}

pub fn call(config: SessionConfig) -> Call {
    let host = RelayHost::new(RelayConfig::development());
    let alice = endpoint(&host, "alice", config.clone());
    let bob = endpoint(&host, "bob", config);
    Call { host, alice, bob }
}

pub async fn wait_for_state(session: &Session, want: NegotiationState) {
    let mut states = session.subscribe_state();
    timeout(Duration::from_secs(5), states.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {want}", session.identity()))
        .expect("state channel closed");
}

/// Poll `check` until it holds; the relay and sessions run on spawned tasks.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let polled = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Let queued relay and session work drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
