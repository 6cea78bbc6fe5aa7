//! Signaling relay: a directory of endpoints and the dispatcher that forwards
//! envelopes between them.

pub mod config;
pub mod dispatcher;
pub mod host;
pub mod link;
pub mod registry;

pub use config::RelayConfig;
pub use dispatcher::{RelayDispatcher, RelayOutcome};
pub use host::RelayHost;
pub use link::{EndpointChannel, LinkError, SignalingLink};
pub use registry::{ClientHandle, ClientInfo, ClientRegistry};
