use metrics::counter;
use signal_proto::{ChannelMessage, Recipient, SignalingEnvelope};
use tracing::{debug, info, trace};

use crate::config::RelayConfig;
use crate::registry::ClientRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Forwards envelopes to the handle registered for their receiver.
///
/// Delivery is at-most-once: an envelope whose receiver is not registered
/// (or no longer reading) is dropped without telling the sender.
#[derive(Debug, Clone)]
pub struct RelayDispatcher {
    registry: ClientRegistry,
    config: RelayConfig,
}

impl RelayDispatcher {
    pub fn new(registry: ClientRegistry, config: RelayConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn handle(&self, message: ChannelMessage) -> RelayOutcome {
        match message {
            ChannelMessage::Log(text) => {
                self.log_message(&text);
                RelayOutcome::default()
            }
            ChannelMessage::Relay(envelope) => self.relay_message(envelope),
        }
    }

    pub fn log_message(&self, text: &str) {
        if self.config.dev_mode {
            info!(target = "relay", "[endpoint] {}", text);
        }
    }

    pub fn relay_message(&self, envelope: SignalingEnvelope) -> RelayOutcome {
        let kind = envelope.kind.as_str();
        let outcome = match envelope.receiver.clone() {
            Recipient::Peer(identity) => self.deliver_to(&identity, envelope),
            Recipient::Everyone => self.fan_out(envelope),
        };
        if outcome.delivered > 0 {
            counter!("signal_relay_delivered_total", outcome.delivered as u64, "kind" => kind);
        }
        if outcome.dropped > 0 {
            counter!("signal_relay_dropped_total", outcome.dropped as u64, "kind" => kind);
        }
        outcome
    }

    fn deliver_to(&self, identity: &str, envelope: SignalingEnvelope) -> RelayOutcome {
        let sender = envelope.sender.clone();
        let kind = envelope.kind;
        match self.registry.lookup(identity) {
            Some(handle) if handle.deliver(envelope) => {
                trace!(target = "relay", from = %sender, to = identity, kind = kind.as_str(), "relayed");
                RelayOutcome {
                    delivered: 1,
                    dropped: 0,
                }
            }
            _ => {
                debug!(target = "relay", from = %sender, to = identity, kind = kind.as_str(), "receiver unavailable, dropping");
                RelayOutcome {
                    delivered: 0,
                    dropped: 1,
                }
            }
        }
    }

    fn fan_out(&self, envelope: SignalingEnvelope) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        for identity in self.registry.identities() {
            if identity == envelope.sender {
                continue;
            }
            let single = self.deliver_to(&identity, envelope.clone());
            outcome.delivered += single.delivered;
            outcome.dropped += single.dropped;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientHandle;
    use serde_json::json;
    use signal_proto::MessageKind;

    fn dispatcher() -> RelayDispatcher {
        RelayDispatcher::new(ClientRegistry::new(), RelayConfig::development())
    }

    #[test_timeout::timeout]
    fn delivers_only_to_named_receiver() {
        let relay = dispatcher();
        let (a, mut a_rx) = ClientHandle::channel();
        let (b, mut b_rx) = ClientHandle::channel();
        relay.registry().add_client("window-a", a);
        relay.registry().add_client("window-b", b);

        let envelope = SignalingEnvelope::new(
            "window-a",
            Recipient::peer("window-b"),
            MessageKind::Offer,
            Some(json!({"type": "offer", "sdp": "v=0"})),
        );
        let outcome = relay.relay_message(envelope.clone());

        assert_eq!(outcome.delivered, 1);
        assert_eq!(b_rx.try_recv().unwrap(), envelope);
        assert!(a_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn unknown_receiver_is_dropped_silently() {
        let relay = dispatcher();
        let (a, mut a_rx) = ClientHandle::channel();
        relay.registry().add_client("window-a", a);

        let outcome = relay.relay_message(SignalingEnvelope::end("window-a", "ghost"));

        assert_eq!(outcome, RelayOutcome { delivered: 0, dropped: 1 });
        assert!(a_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn broadcast_skips_sender() {
        let relay = dispatcher();
        let mut receivers = Vec::new();
        for identity in ["window-a", "window-b", "window-c"] {
            let (handle, rx) = ClientHandle::channel();
            relay.registry().add_client(identity, handle);
            receivers.push((identity, rx));
        }

        let outcome = relay.relay_message(SignalingEnvelope::new(
            "window-a",
            Recipient::Everyone,
            MessageKind::Candidate,
            Some(json!({"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0})),
        ));

        assert_eq!(outcome.delivered, 2);
        for (identity, rx) in receivers.iter_mut() {
            let got = rx.try_recv();
            if *identity == "window-a" {
                assert!(got.is_err());
            } else {
                assert_eq!(got.unwrap().kind, MessageKind::Candidate);
            }
        }
    }

    #[test_timeout::timeout]
    fn log_frames_never_reach_clients() {
        let relay = dispatcher();
        let (a, mut a_rx) = ClientHandle::channel();
        relay.registry().add_client("window-a", a);
        let outcome = relay.handle(ChannelMessage::Log("hello".into()));
        assert_eq!(outcome, RelayOutcome::default());
        assert!(a_rx.try_recv().is_err());
    }
}
