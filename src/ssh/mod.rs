//! SSH module - sessions, channels and flow control over russh
//!
//! # Features
//! - Dial on a dedicated session loop per connection
//! - Channel Streams with independent stdout/stderr/stdin pipelines
//! - Demand-driven, window-aware reading and writing
//! - ProxyJump / ProxyCommand chains (SSH-over-SSH)
//! - Host key verification via ~/.ssh/known_hosts
//! - Session pool with control-master reuse

mod agent;
pub mod channel_io;
mod client;
mod config;
mod error;
mod event_loop;
pub mod flow;
pub mod handle_owner;
pub mod io;
pub mod known_hosts;
mod pool;
pub mod proxy;
mod pump;
pub(crate) mod session;
mod stream;

pub use agent::{is_agent_available, AgentAuthenticator};
pub use channel_io::{ChannelIo, Side};
pub use client::{dial, ClientHandler};
pub use config::{AuthMethod, LogVerbosity, SshClientConfig};
pub use error::SshError;
pub use event_loop::SessionLoop;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use io::{AsyncReadProducer, AsyncWriteConsumer, Consumer, Producer};
pub use known_hosts::{delete_known_host, HostKeyVerification, KnownHostsStore};
pub use pool::{PoolUsage, SessionPool};
pub use proxy::{HopConnector, ProxyCommand, ProxyHop, ProxyTunnel};
pub use pump::PumpedChannel;
pub use session::{ChannelOpener, PtyRequest, SftpChannel, SshSession};
pub use stream::{Stream, StreamArena, StreamId, StreamOwner, StreamState};
