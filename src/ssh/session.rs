//! SSH Session
//!
//! One authenticated connection. The session owns the handle owner task (via
//! its [`HandleController`]), the session loop and, for proxied dials, the
//! tunnel its transport runs through. Streams are tracked weakly in a
//! [`StreamArena`]; they hold the shared part of the session for cleanup,
//! never the reverse.
//!
//! Cancelling a session cascades downwards: live streams, reverse forwards,
//! the transport, the proxy tunnel, then the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::Msg;
use russh::Channel;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::event_loop::SessionLoop;
use super::handle_owner::HandleController;
use super::proxy::ProxyTunnel;
use super::pump::PumpedChannel;
use super::stream::{Stream, StreamId, StreamArena, StreamOwner};
use crate::agent::SshAgent;
use crate::forwarding::ForwardRouter;

/// How long a cancelled session waits for the disconnect to go out
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// PTY parameters for an interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".into(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Opens forwarded channels.
///
/// Port forward listeners and proxy hops only need this much of a session.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// direct-tcpip channel to `to:port`, reported as coming from `from:local_port`
    async fn open_forward(
        &self,
        to: &str,
        port: u16,
        from: &str,
        local_port: u16,
    ) -> Result<Stream, SshError>;
}

/// The part of a session its Streams and the russh handler hold on to.
pub(crate) struct SessionShared {
    id: String,
    host: String,
    spawner: Handle,
    arena: StreamArena,
    router: ForwardRouter,
    agent: Option<SshAgent>,
    forward_agent: bool,
}

impl SessionShared {
    pub(crate) fn new(
        host: &str,
        spawner: Handle,
        agent: Option<SshAgent>,
        forward_agent: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            host: host.to_string(),
            spawner,
            arena: StreamArena::default(),
            router: ForwardRouter::default(),
            agent,
            forward_agent,
        })
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn router(&self) -> &ForwardRouter {
        &self.router
    }

    /// Agent serving `auth-agent@openssh.com` channels, if forwarding is on.
    pub(crate) fn forwarding_agent(&self) -> Option<&SshAgent> {
        self.agent.as_ref().filter(|_| self.forward_agent)
    }

    /// Wrap an opened channel in a Stream tracked by this session.
    pub(crate) fn adopt(self: &Arc<Self>, channel: Channel<Msg>, label: impl Into<String>) -> Stream {
        let io = PumpedChannel::spawn(channel, &self.spawner);
        let owner: Arc<dyn StreamOwner> = self.clone();
        let stream = Stream::new(io, label, self.spawner.clone(), Some(owner));
        self.arena.insert(&stream);
        debug!(
            "Session {} opened stream {} ({})",
            self.id,
            stream.id(),
            stream.label()
        );
        stream
    }

    async fn request_agent_forwarding(&self, channel: &Channel<Msg>) {
        if self.forwarding_agent().is_none() {
            return;
        }
        if let Err(e) = channel.agent_forward(false).await {
            warn!("Agent forwarding request failed on {}: {}", self.host, e);
        }
    }
}

impl StreamOwner for SessionShared {
    fn stream_closed(&self, id: StreamId) {
        self.arena.remove(id);
        debug!("Session {} released stream {}", self.id, id);
    }
}

fn request_error(what: &str, err: russh::Error) -> SshError {
    match err {
        russh::Error::Disconnect => SshError::Disconnected,
        other => SshError::ChannelError(format!("{} request failed: {}", what, other)),
    }
}

/// An `sftp` subsystem channel. The SFTP protocol runs on top of the Stream.
#[derive(Debug, Clone)]
pub struct SftpChannel {
    stream: Stream,
}

impl SftpChannel {
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn into_stream(self) -> Stream {
        self.stream
    }
}

struct SessionInner {
    shared: Arc<SessionShared>,
    controller: HandleController,
    session_loop: Arc<SessionLoop>,
    proxy: Mutex<Option<ProxyTunnel>>,
    cancelled: AtomicBool,
}

impl SessionInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cancelling session {} ({})", self.shared.id, self.shared.host);

        for stream in self.shared.arena.live() {
            stream.session_cancelled();
        }
        self.shared.router.close_all();

        let connected = self.controller.is_connected();
        let mut disconnected = self.controller.subscribe_disconnect();
        self.controller.disconnect();

        let proxy = self.proxy.lock().take();
        let session_loop = self.session_loop.clone();
        if !connected {
            if let Some(tunnel) = proxy {
                tunnel.cancel();
            }
            session_loop.shutdown();
            return;
        }

        // The disconnect message still has to travel through the tunnel.
        let host = self.shared.host.clone();
        self.session_loop.spawn(async move {
            if tokio::time::timeout(DISCONNECT_GRACE, disconnected.recv())
                .await
                .is_err()
            {
                debug!("Disconnect from {} not confirmed in time", host);
            }
            if let Some(tunnel) = proxy {
                tunnel.cancel();
            }
            session_loop.shutdown();
        });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Handle to an authenticated connection. Clones share the connection; the
/// last one dropped cancels it.
#[derive(Clone)]
pub struct SshSession {
    inner: Arc<SessionInner>,
}

impl SshSession {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        controller: HandleController,
        session_loop: Arc<SessionLoop>,
        proxy: Option<ProxyTunnel>,
    ) -> Self {
        info!("Session {} established to {}", shared.id, shared.host);
        Self {
            inner: Arc::new(SessionInner {
                shared,
                controller,
                session_loop,
                proxy: Mutex::new(proxy),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.shared.id
    }

    pub fn host(&self) -> &str {
        &self.inner.shared.host
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.cancelled.load(Ordering::Acquire) && self.inner.controller.is_connected()
    }

    /// Streams opened on this session that are still alive
    pub fn open_streams(&self) -> usize {
        self.inner.shared.arena.live().len()
    }

    pub fn controller(&self) -> &HandleController {
        &self.inner.controller
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.inner.shared
    }

    pub(crate) fn session_loop(&self) -> &Arc<SessionLoop> {
        &self.inner.session_loop
    }

    /// Whether both handles refer to one connection.
    pub fn same_session(&self, other: &SshSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn run<F, T>(&self, fut: F) -> Result<T, SshError>
    where
        F: std::future::Future<Output = Result<T, SshError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(SshError::Disconnected);
        }
        self.inner.session_loop.run(fut).await
    }

    /// Run `command` on a new session channel.
    pub async fn request_exec(&self, command: &str) -> Result<Stream, SshError> {
        let shared = self.inner.shared.clone();
        let controller = self.inner.controller.clone();
        let command = command.to_string();
        self.run(async move {
            let channel = controller.open_session_channel().await?;
            shared.request_agent_forwarding(&channel).await;
            channel
                .exec(true, command.as_str())
                .await
                .map_err(|e| request_error("exec", e))?;
            Ok(shared.adopt(channel, format!("exec: {}", command)))
        })
        .await
    }

    /// Interactive shell, with a PTY when `pty` is given.
    pub async fn request_shell(&self, pty: Option<PtyRequest>) -> Result<Stream, SshError> {
        let shared = self.inner.shared.clone();
        let controller = self.inner.controller.clone();
        self.run(async move {
            let channel = controller.open_session_channel().await?;
            shared.request_agent_forwarding(&channel).await;
            if let Some(pty) = pty {
                channel
                    .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                    .await
                    .map_err(|e| request_error("pty", e))?;
            }
            channel
                .request_shell(true)
                .await
                .map_err(|e| request_error("shell", e))?;
            Ok(shared.adopt(channel, "shell"))
        })
        .await
    }

    /// Open the `sftp` subsystem.
    pub async fn request_sftp(&self) -> Result<SftpChannel, SshError> {
        let shared = self.inner.shared.clone();
        let controller = self.inner.controller.clone();
        self.run(async move {
            let channel = controller.open_session_channel().await?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| request_error("sftp subsystem", e))?;
            Ok(SftpChannel {
                stream: shared.adopt(channel, "sftp"),
            })
        })
        .await
    }

    /// direct-tcpip channel to `to:port`.
    pub async fn request_forward(
        &self,
        to: &str,
        port: u16,
        from: &str,
        local_port: u16,
    ) -> Result<Stream, SshError> {
        let shared = self.inner.shared.clone();
        let controller = self.inner.controller.clone();
        let (to, from) = (to.to_string(), from.to_string());
        self.run(async move {
            let channel = controller
                .open_direct_tcpip(&to, u32::from(port), &from, u32::from(local_port))
                .await?;
            Ok(shared.adopt(channel, format!("forward {}:{}", to, port)))
        })
        .await
    }

    /// Tear the session down. Idempotent.
    ///
    /// Streams already finishing complete; streams mid-transfer fail with
    /// `Disconnected`.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

#[async_trait]
impl ChannelOpener for SshSession {
    async fn open_forward(
        &self,
        to: &str,
        port: u16,
        from: &str,
        local_port: u16,
    ) -> Result<Stream, SshError> {
        self.request_forward(to, port, from, local_port).await
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id())
            .field("host", &self.host())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Sessions backed by a scripted command channel instead of a transport.

    use tokio::sync::mpsc;

    use super::*;
    use crate::ssh::handle_owner::HandleCommand;

    pub(crate) fn detached(host: &str) -> (SshSession, mpsc::Receiver<HandleCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let shared = SessionShared::new(host, Handle::current(), None, false);
        let session_loop = SessionLoop::attach(host, Handle::current());
        let session = SshSession::new(shared, HandleController::new(cmd_tx), session_loop, None);
        (session, cmd_rx)
    }
}
