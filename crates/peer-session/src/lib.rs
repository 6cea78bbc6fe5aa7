//! Per-endpoint WebRTC negotiation driven over a signaling relay.
//!
//! A [`NegotiationSession`] owns one [`MediaEngine`], answers offers, holds
//! received answers until connectivity checks start, trickles candidates and
//! tears everything down on `end()`.

pub mod config;
pub mod engine;
pub mod error;
mod lifecycle;
pub mod listeners;
pub mod mock;
pub mod rtc;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use engine::{
    EngineError, EngineEvent, EventSink, IceConnectionState, MediaEngine, OfferOptions,
};
pub use error::SessionError;
pub use listeners::{ListenerId, Listeners};
pub use rtc::{LocalTrack, RtcEngine, RtcEngineConfig};
pub use session::{CompletionCallback, NegotiationSession, SessionClosed};
pub use state::NegotiationState;
