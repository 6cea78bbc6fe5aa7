use signal_proto::ProtoError;
use signal_relay::LinkError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::state::NegotiationState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },
    #[error("session ended while the operation was in flight")]
    Stale,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("signaling: {0}")]
    Link(#[from] LinkError),
    #[error("payload: {0}")]
    Payload(#[from] ProtoError),
}
