//! SSH Session Pool
//!
//! Keeps dialed sessions and what runs on them:
//!
//! ```text
//! SessionPool
//!   └── PoolEntry (per session id)
//!         ├── session + the config it was dialed with
//!         ├── local listeners
//!         ├── remote forward clients
//!         └── command streams
//! ```
//!
//! With control master on, a dial for a host whose connected session was
//! dialed with an equivalent config reuses it. Deregistering the last
//! listener, client or stream of a connection drops the entry and cancels
//! the session.

use dashmap::DashMap;
use tracing::{debug, info};

use super::client::dial;
use super::config::SshClientConfig;
use super::error::SshError;
use super::session::SshSession;
use super::stream::Stream;
use crate::forwarding::{PortForwardListener, RemoteForwardClient};

struct PoolEntry {
    session: SshSession,
    config: SshClientConfig,
    listeners: Vec<PortForwardListener>,
    clients: Vec<RemoteForwardClient>,
    streams: Vec<Stream>,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        self.listeners.is_empty() && self.clients.is_empty() && self.streams.is_empty()
    }
}

/// What is registered on one pooled session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub listeners: usize,
    pub clients: usize,
    pub streams: usize,
}

#[derive(Default)]
pub struct SessionPool {
    entries: DashMap<String, PoolEntry>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial `host`, reusing a pooled session when `control_master` is set.
    pub async fn dial(
        &self,
        host: &str,
        config: SshClientConfig,
        control_master: bool,
    ) -> Result<SshSession, SshError> {
        if control_master {
            if let Some(session) = self.find(host, &config) {
                info!("Reusing session {} for {}", session.id(), host);
                return Ok(session);
            }
        }
        let session = dial(host, config.clone()).await?;
        self.insert(session.clone(), config);
        Ok(session)
    }

    /// A connected pooled session to `host` that can serve `config`.
    pub fn find(&self, host: &str, config: &SshClientConfig) -> Option<SshSession> {
        self.entries
            .iter()
            .find(|entry| {
                entry.session.host() == host
                    && entry.session.is_connected()
                    && entry.config.same_connection(config)
            })
            .map(|entry| entry.session.clone())
    }

    pub(crate) fn insert(&self, session: SshSession, config: SshClientConfig) {
        debug!("Pooling session {} ({})", session.id(), session.host());
        self.entries.insert(
            session.id().to_string(),
            PoolEntry {
                session,
                config,
                listeners: Vec::new(),
                clients: Vec::new(),
                streams: Vec::new(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usage(&self, session: &SshSession) -> Option<PoolUsage> {
        self.entries.get(session.id()).map(|entry| PoolUsage {
            listeners: entry.listeners.len(),
            clients: entry.clients.len(),
            streams: entry.streams.len(),
        })
    }

    fn with_entry<T>(
        &self,
        session: &SshSession,
        f: impl FnOnce(&mut PoolEntry) -> T,
    ) -> Result<T, SshError> {
        let mut entry = self.entries.get_mut(session.id()).ok_or_else(|| {
            SshError::ChannelError(format!("Session {} is not pooled", session.id()))
        })?;
        Ok(f(&mut *entry))
    }

    pub fn register_listener(
        &self,
        session: &SshSession,
        listener: PortForwardListener,
    ) -> Result<(), SshError> {
        self.with_entry(session, |entry| entry.listeners.push(listener))
    }

    pub fn register_client(
        &self,
        session: &SshSession,
        client: RemoteForwardClient,
    ) -> Result<(), SshError> {
        self.with_entry(session, |entry| entry.clients.push(client))
    }

    pub fn register_stream(&self, session: &SshSession, stream: Stream) -> Result<(), SshError> {
        self.with_entry(session, |entry| entry.streams.push(stream))
    }

    /// Close `listener` and forget it.
    pub fn deregister_listener(&self, session: &SshSession, listener: &PortForwardListener) {
        listener.close();
        let _ = self.with_entry(session, |entry| {
            entry.listeners.retain(|l| !l.same_listener(listener))
        });
        self.release_if_idle(session);
    }

    /// Cancel `client`'s remote bind and forget it.
    pub async fn deregister_client(
        &self,
        session: &SshSession,
        client: &RemoteForwardClient,
    ) -> Result<(), SshError> {
        let closed = client.close().await;
        let _ = self.with_entry(session, |entry| {
            entry.clients.retain(|c| !c.same_client(client))
        });
        self.release_if_idle(session);
        closed
    }

    pub fn deregister_stream(&self, session: &SshSession, stream: &Stream) {
        let _ = self.with_entry(session, |entry| {
            entry.streams.retain(|s| s.id() != stream.id())
        });
        self.release_if_idle(session);
    }

    /// Stop every listener and remote forward on `session`.
    pub async fn deregister_all_tunnels(&self, session: &SshSession) {
        let Ok((listeners, clients)) = self.with_entry(session, |entry| {
            (
                std::mem::take(&mut entry.listeners),
                std::mem::take(&mut entry.clients),
            )
        }) else {
            return;
        };
        info!(
            "Stopping {} listener(s) and {} remote forward(s) on {}",
            listeners.len(),
            clients.len(),
            session.host()
        );
        for listener in &listeners {
            listener.close();
        }
        for client in &clients {
            if let Err(e) = client.close().await {
                debug!("Remote forward close on {} failed: {}", session.host(), e);
            }
        }
        self.release_if_idle(session);
    }

    fn release_if_idle(&self, session: &SshSession) {
        let removed = self
            .entries
            .remove_if(session.id(), |_, entry| entry.is_idle());
        if let Some((id, entry)) = removed {
            info!("Session {} has nothing registered, closing it", id);
            entry.session.cancel();
        }
    }

    /// Cancel every pooled session.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                for listener in &entry.listeners {
                    listener.close();
                }
                entry.session.cancel();
            }
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.entries.len())
            .finish()
    }
}
