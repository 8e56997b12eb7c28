//! Local Port Forward Listener
//!
//! Binds a local port and, for every accepted connection, opens one
//! direct-tcpip Stream to the destination and bridges the two until either
//! side closes.
//! Example: forward 127.0.0.1:8888 -> jupyter host localhost:8888

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ForwardEvent, ForwardEventEmitter, ForwardEvents};
use crate::ssh::{ChannelOpener, SshError, Stream};

/// Local port forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalForward {
    /// Local address to bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// 0 lets the OS pick
    pub local_port: u16,
    /// Host to reach from the remote side
    pub destination_host: String,
    pub destination_port: u16,
    /// Description for display
    #[serde(default)]
    pub description: Option<String>,
}

fn default_bind_host() -> String {
    "127.0.0.1".into()
}

impl LocalForward {
    pub fn new(local_port: u16, destination_host: impl Into<String>, destination_port: u16) -> Self {
        Self {
            bind_host: default_bind_host(),
            local_port,
            destination_host: destination_host.into(),
            destination_port,
            description: None,
        }
    }

    /// Jupyter notebook forward (common HPC use case)
    pub fn jupyter(local_port: u16, remote_port: u16) -> Self {
        Self::new(local_port, "localhost", remote_port)
            .with_description(format!("Jupyter Notebook (port {})", remote_port))
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.local_port)
    }

    fn label(&self) -> String {
        format!(
            "{} -> {}:{}",
            self.bind_addr(),
            self.destination_host,
            self.destination_port
        )
    }
}

/// Whether `err` is the resolver's "try again" failure (`EAI_AGAIN`).
pub fn is_transient_resolver_failure(err: &io::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("temporary failure in name resolution")
}

/// Listener failures allow exactly one restart, and only for a transient
/// resolver failure.
#[derive(Debug, Default)]
pub struct RestartPolicy {
    used: bool,
}

impl RestartPolicy {
    pub fn should_restart(&mut self, err: &io::Error) -> bool {
        if self.used || !is_transient_resolver_failure(err) {
            return false;
        }
        self.used = true;
        true
    }
}

fn bind_error(addr: &str, e: io::Error) -> SshError {
    match e.kind() {
        io::ErrorKind::AddrInUse => SshError::PortInUse(addr.to_string()),
        io::ErrorKind::PermissionDenied => SshError::ConnectionError(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        io::ErrorKind::AddrNotAvailable => {
            SshError::ConnectionError(format!("Address not available: {}", addr))
        }
        _ => SshError::ConnectionError(format!("Failed to bind to {}: {}", addr, e)),
    }
}

struct ListenerInner {
    opener: Arc<dyn ChannelOpener>,
    config: LocalForward,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    restart: Mutex<RestartPolicy>,
    connections: DashMap<u64, Stream>,
    next_connection: AtomicU64,
    stop: CancellationToken,
}

impl ListenerInner {
    async fn bind(&self) -> Result<TcpListener, io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        *self.local_addr.lock() = Some(listener.local_addr()?);
        Ok(listener)
    }

    fn bound_port(&self) -> u16 {
        self.local_addr
            .lock()
            .map(|a| a.port())
            .unwrap_or(self.config.local_port)
    }

    fn may_restart(&self, err: &io::Error) -> bool {
        self.restart.lock().should_restart(err)
    }

    /// Bind, restarting once on a transient resolver failure.
    async fn bind_with_restart(&self, emitter: &ForwardEventEmitter) -> Result<TcpListener, SshError> {
        match self.bind().await {
            Ok(listener) => Ok(listener),
            Err(e) if self.may_restart(&e) => {
                warn!("Forward {} bind hit '{}', restarting once", emitter.label(), e);
                emitter.emit(ForwardEvent::Starting);
                self.bind()
                    .await
                    .map_err(|e| bind_error(&self.config.bind_addr(), e))
            }
            Err(e) => Err(bind_error(&self.config.bind_addr(), e)),
        }
    }

    async fn accept_loop(self: Arc<Self>, mut listener: TcpListener, emitter: ForwardEventEmitter) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => {
                    info!("Forward {} stopped by request", emitter.label());
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => self.clone().spawn_connection(socket, peer),
                Err(e) if self.may_restart(&e) => {
                    warn!("Forward {} accept hit '{}', restarting once", emitter.label(), e);
                    emitter.emit(ForwardEvent::Starting);
                    drop(listener);
                    match self.bind().await {
                        Ok(rebound) => {
                            listener = rebound;
                            emitter.emit(ForwardEvent::Ready {
                                port: self.bound_port(),
                            });
                        }
                        Err(e) => {
                            error!("Forward {} restart failed: {}", emitter.label(), e);
                            emitter.emit(ForwardEvent::Error(bind_error(
                                &self.config.bind_addr(),
                                e,
                            )));
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Forward {} accept error: {}", emitter.label(), e);
                    emitter.emit(ForwardEvent::Error(SshError::ConnectionError(format!(
                        "Accept failed on {}: {}",
                        self.config.bind_addr(),
                        e
                    ))));
                    break;
                }
            }
        }

        self.stop.cancel();
        self.cancel_connections();
    }

    fn spawn_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Accepted connection from {} for {}", peer, self.config.label());

        tokio::spawn(async move {
            let stream = match self
                .opener
                .open_forward(
                    &self.config.destination_host,
                    self.config.destination_port,
                    &peer.ip().to_string(),
                    peer.port(),
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Forward channel for {} failed: {}", peer, e);
                    return;
                }
            };
            if self.stop.is_cancelled() {
                stream.cancel();
                return;
            }

            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            self.connections.insert(id, stream.clone());
            match stream.bridge(socket) {
                Ok(done) => match done.await {
                    Ok(Ok(())) => debug!("Forward connection {} closed", peer),
                    Ok(Err(e)) => debug!("Forward connection {} failed: {}", peer, e),
                    Err(_) => debug!("Forward connection {} cancelled", peer),
                },
                Err(e) => warn!("Forward connection {} not bridged: {}", peer, e),
            }
            self.connections.remove(&id);
            stream.cancel();
        });
    }

    fn cancel_connections(&self) {
        let streams: Vec<Stream> = self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        for stream in streams {
            stream.cancel();
        }
    }
}

/// A local port forwarded over a session (or any [`ChannelOpener`]).
#[derive(Clone)]
pub struct PortForwardListener {
    inner: Arc<ListenerInner>,
}

impl PortForwardListener {
    pub fn new(opener: Arc<dyn ChannelOpener>, config: LocalForward) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                opener,
                config,
                started: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                restart: Mutex::new(RestartPolicy::default()),
                connections: DashMap::new(),
                next_connection: AtomicU64::new(0),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &LocalForward {
        &self.inner.config
    }

    /// Whether both handles refer to one listener.
    pub fn same_listener(&self, other: &PortForwardListener) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind and start accepting.
    ///
    /// Fails with `PortInUse` before accepting anything when the port is
    /// taken. The returned receiver sees `Starting`, `Ready` and any later
    /// `Error`, and ends once the listener stops.
    pub async fn connect(&self) -> Result<ForwardEvents, SshError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SshError::ChannelError(format!(
                "Forward {} already started",
                self.inner.config.label()
            )));
        }

        let (emitter, events) = ForwardEventEmitter::new(self.inner.config.label());
        emitter.emit(ForwardEvent::Starting);
        let listener = self.inner.bind_with_restart(&emitter).await?;

        info!(
            "Started local port forward: {} -> {}:{}",
            self.inner.bound_port(),
            self.inner.config.destination_host,
            self.inner.config.destination_port
        );
        emitter.emit(ForwardEvent::Ready {
            port: self.inner.bound_port(),
        });
        tokio::spawn(self.inner.clone().accept_loop(listener, emitter));
        Ok(events)
    }

    /// Stop accepting and cancel every bridged connection.
    pub fn close(&self) {
        self.inner.stop.cancel();
        self.inner.cancel_connections();
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.stop.is_cancelled()
    }

    /// Connections currently bridged
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

impl std::fmt::Debug for PortForwardListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwardListener")
            .field("forward", &self.inner.config.label())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::runtime::Handle;

    use super::*;
    use crate::ssh::channel_io::mock::MockChannel;
    use crate::ssh::Side;

    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<(String, u16, Arc<MockChannel>)>>,
    }

    #[async_trait]
    impl ChannelOpener for FakeOpener {
        async fn open_forward(
            &self,
            to: &str,
            port: u16,
            from: &str,
            _local_port: u16,
        ) -> Result<Stream, SshError> {
            assert_eq!(from, "127.0.0.1");
            let channel = MockChannel::new(1 << 16);
            let stream = Stream::new(channel.io(), "fake forward", Handle::current(), None);
            self.opened.lock().push((to.to_string(), port, channel));
            Ok(stream)
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_listener_on_same_port_fails_fast() {
        let opener: Arc<dyn ChannelOpener> = Arc::new(FakeOpener::default());
        let first = PortForwardListener::new(opener.clone(), LocalForward::new(0, "localhost", 80));
        let mut events = first.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(ForwardEvent::Starting));
        let port = first.local_addr().unwrap().port();
        assert_eq!(events.recv().await, Some(ForwardEvent::Ready { port }));

        let second = PortForwardListener::new(opener, LocalForward::new(port, "localhost", 80));
        assert!(matches!(second.connect().await, Err(SshError::PortInUse(_))));
        assert!(second.local_addr().is_none());

        assert!(first.connect().await.is_err());
        first.close();
    }

    #[tokio::test]
    async fn test_bridges_accepted_connections() {
        let fake = Arc::new(FakeOpener::default());
        let listener = PortForwardListener::new(fake.clone(), LocalForward::jupyter(0, 8888));
        let mut events = listener.connect().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        eventually(|| listener.connections() == 1).await;
        let channel = {
            let opened = fake.opened.lock();
            assert_eq!((opened[0].0.as_str(), opened[0].1), ("localhost", 8888));
            opened[0].2.clone()
        };
        eventually(|| channel.written() == b"ping").await;

        channel.push(Side::Stdout, b"pong");
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        listener.close();
        eventually(|| channel.close_calls() == 1).await;
        assert_eq!(listener.connections(), 0);

        assert_eq!(events.recv().await, Some(ForwardEvent::Starting));
        assert!(matches!(events.recv().await, Some(ForwardEvent::Ready { .. })));
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn test_restart_policy_is_narrow_and_single() {
        let transient = io::Error::other(
            "failed to lookup address information: Temporary failure in name resolution",
        );
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);

        let mut policy = RestartPolicy::default();
        assert!(!policy.should_restart(&refused));
        assert!(policy.should_restart(&transient));
        assert!(!policy.should_restart(&transient));
    }

    #[test]
    fn test_bind_error_mapping() {
        assert!(matches!(
            bind_error("127.0.0.1:80", io::Error::from(io::ErrorKind::AddrInUse)),
            SshError::PortInUse(addr) if addr == "127.0.0.1:80"
        ));
        assert!(matches!(
            bind_error("127.0.0.1:80", io::Error::from(io::ErrorKind::PermissionDenied)),
            SshError::ConnectionError(_)
        ));
    }
}
