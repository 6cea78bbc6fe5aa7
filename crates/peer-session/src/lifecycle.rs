use std::sync::atomic::Ordering;

use signal_proto::MessageKind;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::session::{NegotiationSession, SessionClosed};
use crate::state::NegotiationState;

impl<E: MediaEngine> NegotiationSession<E> {
    /// Tear the session down.
    ///
    /// The engine is closed and released on the first call only; every call
    /// emits the closed event and runs the completion callback.
    pub async fn end(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let engine = self.engine.lock().take();
        if let Some(engine) = engine {
            engine.detach_events();
            if let Err(err) = engine.close().await {
                warn!(target = "signaling", identity = %self.identity, error = %err, "closing media engine failed");
            }
            info!(target = "signaling", identity = %self.identity, "media session closed");
        } else {
            debug!(target = "signaling", identity = %self.identity, "end on an already closed session");
        }

        let _ = self.transition(None, NegotiationState::Closed);
        self.detach_subscriptions();

        self.connection_closed.emit(&SessionClosed {
            identity: self.identity.clone(),
        });
        if let Some(on_complete) = &self.on_complete {
            on_complete();
        }
    }

    /// Tell `peer` the call is over, then end locally.
    pub async fn hang_up(&self, peer: &str) {
        if let Err(err) = self.link.send_to(peer, MessageKind::End, None) {
            warn!(target = "signaling", identity = %self.identity, peer, error = %err, "end could not be sent");
        }
        self.end().await;
    }

    /// Synchronous so it is safe when `end()` runs on one of the aborted tasks.
    fn detach_subscriptions(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let gate = {
            let mut inner = self.inner.lock();
            inner.pending_candidates.clear();
            inner.answer_gate.take()
        };
        for task in tasks.into_iter().chain(gate) {
            task.abort();
        }
        self.track_received.clear();
    }
}
