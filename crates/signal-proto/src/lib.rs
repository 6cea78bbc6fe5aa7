use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod sdp;

pub use sdp::{IceCandidate, SdpType, SessionDescription};

/// Sender identity used when the relay itself originates a message.
pub const RELAY_IDENTITY: &str = "relay";

/// Inner message kinds carried by a relayed envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
    End,
    Log,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::End => "end",
            MessageKind::Log => "log",
        }
    }
}

/// Addressing for a relayed envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "to", content = "identity", rename_all = "snake_case")]
pub enum Recipient {
    /// A single registered endpoint.
    Peer(String),
    /// Every registered endpoint except the sender.
    Everyone,
}

impl Recipient {
    pub fn peer(identity: impl Into<String>) -> Self {
        Recipient::Peer(identity.into())
    }
}

/// Signaling message exchanged between two endpoints through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingEnvelope {
    pub sender: String,
    pub receiver: Recipient,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalingEnvelope {
    pub fn new(
        sender: impl Into<String>,
        receiver: Recipient,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver,
            kind,
            payload,
        }
    }

    /// Teardown notice; End never carries a payload.
    pub fn end(sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self::new(sender, Recipient::peer(receiver), MessageKind::End, None)
    }

    /// Decode the payload into the type implied by `kind`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        decode_payload(self.kind, self.payload.as_ref())
    }

    pub fn is_addressed_to(&self, identity: &str) -> bool {
        match &self.receiver {
            Recipient::Peer(id) => id == identity,
            Recipient::Everyone => self.sender != identity,
        }
    }
}

/// Frames an endpoint pushes up to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Diagnostic line, printed by the relay in development mode only.
    Log(String),
    /// Envelope to forward to its receiver.
    Relay(SignalingEnvelope),
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("{0} message carries no payload")]
    MissingPayload(&'static str),
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Value, ProtoError> {
    Ok(serde_json::to_value(value)?)
}

pub fn decode_payload<T: DeserializeOwned>(
    kind: MessageKind,
    payload: Option<&Value>,
) -> Result<T, ProtoError> {
    let value = payload.ok_or(ProtoError::MissingPayload(kind.as_str()))?;
    T::deserialize(value).map_err(|source| ProtoError::Malformed {
        kind: kind.as_str(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn relay_frame_wire_shape() {
        let envelope = SignalingEnvelope::new(
            "window-a",
            Recipient::peer("window-b"),
            MessageKind::Offer,
            Some(json!({"type": "offer", "sdp": "v=0"})),
        );
        let value = serde_json::to_value(ChannelMessage::Relay(envelope)).unwrap();
        assert_eq!(value["type"], "relay");
        assert_eq!(value["data"]["sender"], "window-a");
        assert_eq!(value["data"]["receiver"]["to"], "peer");
        assert_eq!(value["data"]["receiver"]["identity"], "window-b");
        assert_eq!(value["data"]["kind"], "offer");
    }

    #[test_timeout::timeout]
    fn end_envelope_has_no_payload() {
        let envelope = SignalingEnvelope::end(RELAY_IDENTITY, "window-a");
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(!text.contains("payload"));
        assert_eq!(envelope.kind, MessageKind::End);
        assert!(envelope.is_addressed_to("window-a"));
    }

    #[test_timeout::timeout]
    fn broadcast_excludes_sender() {
        let envelope =
            SignalingEnvelope::new("window-a", Recipient::Everyone, MessageKind::Candidate, None);
        assert!(!envelope.is_addressed_to("window-a"));
        assert!(envelope.is_addressed_to("window-b"));
    }

    #[test_timeout::timeout]
    fn decode_reports_missing_and_malformed_payloads() {
        let missing = SignalingEnvelope::new(
            "window-a",
            Recipient::peer("window-b"),
            MessageKind::Answer,
            None,
        );
        assert!(matches!(
            missing.decode::<SessionDescription>(),
            Err(ProtoError::MissingPayload("answer"))
        ));

        let malformed = SignalingEnvelope::new(
            "window-a",
            Recipient::peer("window-b"),
            MessageKind::Candidate,
            Some(json!(42)),
        );
        assert!(matches!(
            malformed.decode::<IceCandidate>(),
            Err(ProtoError::Malformed { kind: "candidate", .. })
        ));
    }

    #[test_timeout::timeout]
    fn log_frame_carries_plain_text() {
        let parsed: ChannelMessage =
            serde_json::from_str(r#"{"type":"log","data":"renderer ready"}"#).unwrap();
        assert_eq!(parsed, ChannelMessage::Log("renderer ready".into()));
    }
}
