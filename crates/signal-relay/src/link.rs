use serde_json::Value;
use signal_proto::{ChannelMessage, MessageKind, Recipient, SignalingEnvelope};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("relay channel closed")]
    Closed,
}

/// Endpoint-side sender onto the relay's inbound channel.
#[derive(Debug, Clone)]
pub struct SignalingLink {
    identity: String,
    upstream: mpsc::UnboundedSender<ChannelMessage>,
}

impl SignalingLink {
    pub fn new(identity: impl Into<String>, upstream: mpsc::UnboundedSender<ChannelMessage>) -> Self {
        Self {
            identity: identity.into(),
            upstream,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn send(
        &self,
        receiver: Recipient,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> Result<(), LinkError> {
        let envelope = SignalingEnvelope::new(self.identity.clone(), receiver, kind, payload);
        self.upstream
            .send(ChannelMessage::Relay(envelope))
            .map_err(|_| LinkError::Closed)
    }

    pub fn send_to(
        &self,
        peer: &str,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> Result<(), LinkError> {
        self.send(Recipient::peer(peer), kind, payload)
    }

    pub fn broadcast(&self, kind: MessageKind, payload: Option<Value>) -> Result<(), LinkError> {
        self.send(Recipient::Everyone, kind, payload)
    }

    pub fn log(&self, text: impl Into<String>) -> Result<(), LinkError> {
        self.upstream
            .send(ChannelMessage::Log(text.into()))
            .map_err(|_| LinkError::Closed)
    }
}

/// Both directions of one endpoint's signaling channel.
#[derive(Debug)]
pub struct EndpointChannel {
    pub link: SignalingLink,
    pub inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
}

impl EndpointChannel {
    pub fn new(link: SignalingLink, inbound: mpsc::UnboundedReceiver<SignalingEnvelope>) -> Self {
        Self { link, inbound }
    }

    pub fn identity(&self) -> &str {
        self.link.identity()
    }
}
