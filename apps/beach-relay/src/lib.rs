//! HTTP/WebSocket host for the signaling relay.
//!
//! Each endpoint connects to `/ws/:identity`; frames it sends are
//! `ChannelMessage` JSON and envelopes addressed to it come back as
//! `SignalingEnvelope` JSON.

pub mod config;
pub mod server;
pub mod telemetry;

pub use config::{Cli, ServerConfig};
pub use server::{decode_frame, router, run, serve, AppState, FrameError};
