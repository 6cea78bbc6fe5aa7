use std::fmt;

/// Negotiation progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    /// Local offer set and sent; waiting for the answer.
    OfferSent,
    /// Remote offer being applied and answered.
    OfferReceived,
    /// Answer exchanged, waiting for connectivity. On the offering side the
    /// received answer is held here until ICE checks start.
    AnswerPending,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle | Connected, OfferSent) => true,
            (Idle | Connected | OfferReceived, OfferReceived) => true,
            (OfferSent | OfferReceived, AnswerPending) => true,
            (AnswerPending, Connected) => true,
            // A fresh remote offer replaces a round that never connected.
            (AnswerPending, OfferReceived) => true,
            // Held answer could not be committed, or never could be.
            (AnswerPending, OfferSent | Idle) => true,
            // Offer never reached the relay.
            (OfferSent, Idle) => true,
            _ => false,
        }
    }

    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerPending => "answer-pending",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}
