//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port.
//! Example: remote server:9000 -> local:3000 (expose a local service)
//!
//! The client sends `tcpip-forward` through the session's controller. The
//! server then opens one `forwarded-tcpip` channel per inbound connection;
//! the session's [`ForwardRouter`] hands each one to the client registered
//! for the bound port, which dials the local target and bridges the two.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ForwardEvent, ForwardEventEmitter, ForwardEvents};
use crate::ssh::{SshError, SshSession, Stream};

/// A `forwarded-tcpip` channel opened by the server
#[derive(Debug)]
pub struct InboundForward {
    pub stream: Stream,
    pub originator: String,
    pub originator_port: u32,
}

/// Per-session table from bound remote port to the client serving it.
#[derive(Default)]
pub(crate) struct ForwardRouter {
    routes: DashMap<u32, mpsc::UnboundedSender<InboundForward>>,
}

impl ForwardRouter {
    pub(crate) fn register(&self, port: u32) -> mpsc::UnboundedReceiver<InboundForward> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.insert(port, tx).is_some() {
            warn!("Remote port {} re-registered, previous client detached", port);
        }
        rx
    }

    pub(crate) fn unregister(&self, port: u32) {
        self.routes.remove(&port);
    }

    /// Deliver `inbound` to the client bound to `port`. Hands it back when
    /// nobody is.
    pub(crate) fn route(&self, port: u32, inbound: InboundForward) -> Result<(), InboundForward> {
        match self.routes.get(&port) {
            Some(tx) => tx.send(inbound).map_err(|e| e.0),
            None => Err(inbound),
        }
    }

    pub(crate) fn close_all(&self) {
        self.routes.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }
}

/// Remote port forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteForward {
    /// Remote bind address (e.g. "0.0.0.0" or "localhost")
    #[serde(default = "default_remote_bind")]
    pub remote_bind: String,
    /// 0 lets the server pick
    pub remote_port: u16,
    /// Local target dialed for each inbound connection
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_remote_bind() -> String {
    "localhost".into()
}

impl RemoteForward {
    pub fn new(remote_port: u16, forward_host: impl Into<String>, forward_port: u16) -> Self {
        Self {
            remote_bind: default_remote_bind(),
            remote_port,
            forward_host: forward_host.into(),
            forward_port,
            description: None,
        }
    }

    pub fn with_remote_bind(mut self, bind: impl Into<String>) -> Self {
        self.remote_bind = bind.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    fn label(&self) -> String {
        format!(
            "remote {}:{} -> {}:{}",
            self.remote_bind, self.remote_port, self.forward_host, self.forward_port
        )
    }
}

struct ClientInner {
    session: SshSession,
    config: RemoteForward,
    bound: OnceCell<u16>,
    started: AtomicBool,
    connections: DashMap<u64, Stream>,
    next_connection: AtomicU64,
    stop: CancellationToken,
}

impl ClientInner {
    async fn serve_inbound(
        self: Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<InboundForward>,
        emitter: ForwardEventEmitter,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = self.stop.cancelled() => break,
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            tokio::spawn(self.clone().bridge_inbound(inbound, emitter.clone()));
        }
        // Channels routed after the stop are refused.
        inbound_rx.close();
        while let Ok(late) = inbound_rx.try_recv() {
            late.stream.cancel();
        }
        debug!("Forward {} stopped serving", emitter.label());
    }

    async fn bridge_inbound(self: Arc<Self>, inbound: InboundForward, emitter: ForwardEventEmitter) {
        let target = format!("{}:{}", self.config.forward_host, self.config.forward_port);
        debug!(
            "Forwarded connection from {}:{} -> {}",
            inbound.originator, inbound.originator_port, target
        );

        let socket = match TcpStream::connect(&target).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to reach local target {}: {}", target, e);
                inbound.stream.cancel();
                emitter.emit(ForwardEvent::Error(SshError::ConnectionError(format!(
                    "Failed to connect to {}: {}",
                    target, e
                ))));
                return;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let stream = inbound.stream;
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, stream.clone());
        match stream.bridge(socket) {
            Ok(done) => {
                if let Ok(Err(e)) = done.await {
                    debug!("Forwarded connection to {} failed: {}", target, e);
                }
            }
            Err(e) => warn!("Forwarded connection to {} not bridged: {}", target, e),
        }
        self.connections.remove(&id);
        stream.cancel();
    }

    fn cancel_connections(&self) {
        let streams: Vec<Stream> = self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        for stream in streams {
            stream.cancel();
        }
    }
}

/// Reverse forward on one session.
#[derive(Clone)]
pub struct RemoteForwardClient {
    inner: Arc<ClientInner>,
}

impl RemoteForwardClient {
    pub fn new(session: SshSession, config: RemoteForward) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session,
                config,
                bound: OnceCell::new(),
                started: AtomicBool::new(false),
                connections: DashMap::new(),
                next_connection: AtomicU64::new(0),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RemoteForward {
        &self.inner.config
    }

    pub fn session(&self) -> &SshSession {
        &self.inner.session
    }

    pub fn same_client(&self, other: &RemoteForwardClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves with the bound remote port once the server acknowledged
    /// `tcpip-forward`. The request is sent once.
    pub async fn ready(&self) -> Result<u16, SshError> {
        let inner = &self.inner;
        inner
            .bound
            .get_or_try_init(|| async {
                let requested = inner.config.remote_port;
                let granted = inner
                    .session
                    .controller()
                    .tcpip_forward(&inner.config.remote_bind, u32::from(requested))
                    .await?;
                // Servers only report the port when asked for port 0.
                let port = if requested == 0 {
                    u16::try_from(granted).map_err(|_| {
                        SshError::ProtocolError(format!("Server bound invalid port {}", granted))
                    })?
                } else {
                    requested
                };
                info!(
                    "Remote forward {}:{} bound on {}",
                    inner.config.remote_bind,
                    port,
                    inner.session.host()
                );
                Ok(port)
            })
            .await
            .copied()
    }

    /// Bind remotely and start bridging inbound connections.
    ///
    /// The returned receiver sees `Starting`, `Ready`, and an `Error` for
    /// each local dial that fails; it ends once the client is closed.
    pub async fn connect(&self) -> Result<ForwardEvents, SshError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SshError::ChannelError(format!(
                "Forward {} already started",
                self.inner.config.label()
            )));
        }

        let (emitter, events) = ForwardEventEmitter::new(self.inner.config.label());
        emitter.emit(ForwardEvent::Starting);
        let port = self.ready().await?;

        let inbound_rx = self.inner.session.shared().router().register(u32::from(port));
        emitter.emit(ForwardEvent::Ready { port });
        tokio::spawn(self.inner.clone().serve_inbound(inbound_rx, emitter));
        Ok(events)
    }

    /// Cancel the remote bind and every bridged connection.
    pub async fn close(&self) -> Result<(), SshError> {
        self.inner.stop.cancel();
        self.inner.cancel_connections();

        let Some(port) = self.inner.bound.get().copied() else {
            return Ok(());
        };
        self.inner.session.shared().router().unregister(u32::from(port));
        if !self.inner.session.is_connected() {
            return Ok(());
        }
        self.inner
            .session
            .controller()
            .cancel_tcpip_forward(&self.inner.config.remote_bind, u32::from(port))
            .await?;
        info!("Remote forward {}:{} cancelled", self.inner.config.remote_bind, port);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.stop.is_cancelled()
    }

    /// Connections currently bridged
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }
}

impl std::fmt::Debug for RemoteForwardClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteForwardClient")
            .field("forward", &self.inner.config.label())
            .field("bound", &self.inner.bound.get())
            .field("connections", &self.connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::runtime::Handle;

    use super::*;
    use crate::ssh::channel_io::mock::MockChannel;
    use crate::ssh::handle_owner::HandleCommand;
    use crate::ssh::session::testing::detached;
    use crate::ssh::Side;

    fn inbound(channel: &Arc<MockChannel>) -> InboundForward {
        InboundForward {
            stream: Stream::new(channel.io(), "forwarded", Handle::current(), None),
            originator: "10.0.0.9".into(),
            originator_port: 51000,
        }
    }

    #[tokio::test]
    async fn test_router_hands_back_unclaimed_channels() {
        let router = ForwardRouter::default();
        let channel = MockChannel::new(0);
        let unclaimed = router.route(9000, inbound(&channel)).unwrap_err();
        assert_eq!(unclaimed.originator_port, 51000);

        let mut rx = router.register(9000);
        assert!(router.route(9000, inbound(&channel)).is_ok());
        assert_eq!(rx.recv().await.unwrap().originator, "10.0.0.9");

        router.close_all();
        assert_eq!(router.len(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ready_binds_once_and_bridges_inbound() {
        let (session, mut cmd_rx) = detached("web01");
        let script = tokio::spawn(async move {
            let mut forwards = Vec::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::TcpipForward {
                        address,
                        port,
                        reply_tx,
                    } => {
                        forwards.push(format!("forward {}:{}", address, port));
                        let _ = reply_tx.send(Ok(40022));
                    }
                    HandleCommand::CancelTcpipForward {
                        address,
                        port,
                        reply_tx,
                    } => {
                        forwards.push(format!("cancel {}:{}", address, port));
                        let _ = reply_tx.send(Ok(()));
                        break;
                    }
                    _ => {}
                }
            }
            forwards
        });

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let client = RemoteForwardClient::new(
            session.clone(),
            RemoteForward::new(0, "127.0.0.1", target_port),
        );

        assert_eq!(client.ready().await.unwrap(), 40022);
        let mut events = client.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(ForwardEvent::Starting));
        assert_eq!(events.recv().await, Some(ForwardEvent::Ready { port: 40022 }));
        assert!(client.connect().await.is_err());

        let channel = MockChannel::new(1 << 16);
        session
            .shared()
            .router()
            .route(40022, inbound(&channel))
            .unwrap();
        let (mut local, _) = target.accept().await.unwrap();
        channel.push(Side::Stdout, b"hello");
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(client.connections(), 1);

        client.close().await.unwrap();
        assert_eq!(client.connections(), 0);
        assert_eq!(
            script.await.unwrap(),
            vec!["forward localhost:0", "cancel localhost:40022"]
        );
        tokio::time::timeout(Duration::from_secs(1), async {
            while events.recv().await.is_some() {}
        })
        .await
        .unwrap();
        assert_eq!(channel.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_bind_is_reported() {
        let (session, mut cmd_rx) = detached("web01");
        tokio::spawn(async move {
            if let Some(HandleCommand::TcpipForward { reply_tx, .. }) = cmd_rx.recv().await {
                let _ = reply_tx.send(Err(russh::Error::RequestDenied));
            }
        });
        let client = RemoteForwardClient::new(session, RemoteForward::new(8080, "localhost", 80));
        assert!(matches!(client.connect().await, Err(SshError::ChannelError(_))));
    }
}
