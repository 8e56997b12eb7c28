//! Port Forwarding Module
//!
//! Local listeners forward accepted connections over direct-tcpip channels;
//! remote clients ask the server to listen and bridge `forwarded-tcpip`
//! channels back to a local target.

mod client;
mod events;
mod listener;

pub(crate) use client::ForwardRouter;
pub use client::{InboundForward, RemoteForward, RemoteForwardClient};
pub use events::{ForwardEvent, ForwardEventEmitter, ForwardEvents};
pub use listener::{is_transient_resolver_failure, LocalForward, PortForwardListener, RestartPolicy};
