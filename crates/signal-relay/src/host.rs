use parking_lot::Mutex;
use signal_proto::ChannelMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RelayConfig;
use crate::dispatcher::RelayDispatcher;
use crate::link::{EndpointChannel, SignalingLink};
use crate::registry::{ClientHandle, ClientRegistry};

struct Pump {
    upstream: mpsc::UnboundedSender<ChannelMessage>,
    task: JoinHandle<()>,
}

/// The relay as seen by the host process.
///
/// Owns the client registry and, once [`RelayHost::init_channel`] has been
/// called, a single task that drains every endpoint's upstream frames in
/// arrival order.
pub struct RelayHost {
    dispatcher: RelayDispatcher,
    pump: Mutex<Option<Pump>>,
}

impl RelayHost {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            dispatcher: RelayDispatcher::new(ClientRegistry::new(), config),
            pump: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &RelayDispatcher {
        &self.dispatcher
    }

    pub fn add_client(&self, identity: impl Into<String>, handle: ClientHandle) -> bool {
        self.registry().add_client(identity, handle)
    }

    pub fn remove_client(&self, identity: &str) {
        self.registry().remove_client(identity);
    }

    pub fn close_client_connection(&self, identity: &str) -> bool {
        self.registry().close_client_connection(identity)
    }

    /// Subscribe the relay handlers and return the sender endpoints push onto.
    ///
    /// Must be called from within a tokio runtime. Later calls return another
    /// sender onto the already running pump.
    pub fn init_channel(&self) -> mpsc::UnboundedSender<ChannelMessage> {
        let mut guard = self.pump.lock();
        if let Some(pump) = guard.as_ref() {
            if !pump.task.is_finished() {
                return pump.upstream.clone();
            }
        }

        let (upstream, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                dispatcher.handle(message);
            }
            debug!(target = "relay", "relay channel drained");
        });
        *guard = Some(Pump {
            upstream: upstream.clone(),
            task,
        });
        upstream
    }

    /// Register an in-process endpoint and hand back its channel pair.
    pub fn connect(&self, identity: impl Into<String>) -> EndpointChannel {
        let identity = identity.into();
        let upstream = self.init_channel();
        let (handle, inbound) = ClientHandle::channel();
        self.add_client(identity.clone(), handle);
        EndpointChannel::new(SignalingLink::new(identity, upstream), inbound)
    }

    /// Unsubscribe the relay handlers and forget every client.
    pub fn dispose(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.task.abort();
        }
        self.registry().clear();
        debug!(target = "relay", "relay disposed");
    }
}

impl Drop for RelayHost {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.task.abort();
        }
    }
}
