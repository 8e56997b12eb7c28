//! oxide-ssh-core - SSH session and channel multiplexing
//!
//! Sessions run on their own event loop; channels are exposed as Streams
//! with flow-controlled, demand-driven pipelines. On top of that sit the
//! agent emulator, local and remote port forwarding, and ProxyJump chains.

pub mod agent;
pub mod config;
pub mod forwarding;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use agent::SshAgent;
pub use config::{HostResolver, SshConfigResolver};
pub use forwarding::{
    ForwardEvent, LocalForward, PortForwardListener, RemoteForward, RemoteForwardClient,
};
pub use ssh::{
    delete_known_host, dial, AuthMethod, LogVerbosity, SessionPool, SshClientConfig, SshError,
    SshSession, Stream,
};

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(verbosity: LogVerbosity) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.as_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_once() {
        init_logging(LogVerbosity::Debug);
        assert!(!init_logging(LogVerbosity::Quiet));
    }
}
