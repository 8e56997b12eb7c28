//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Sessions, streams,
//! forwards and proxy hops talk to it through a cloneable [`HandleController`]
//! that sends commands over an mpsc channel and waits on a oneshot reply.
//! The task runs on the session loop.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "web01".into(), session_loop.handle());
//! let channel = controller.open_session_channel().await?;
//! let bound_port = controller.tcpip_forward("127.0.0.1", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::runtime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; the connection may still recover
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Session channel (exec, shell, subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// direct-tcpip channel (local forward, proxy hop)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

fn channel_error(err: russh::Error) -> SshError {
    match err {
        russh::Error::Disconnect => SshError::Disconnected,
        other => SshError::ChannelError(other.to_string()),
    }
}

/// Cloneable front end of the Handle Owner Task.
///
/// Holding a controller grants full control of the connection; it never
/// leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a raw command channel (tests drive the receiver).
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receives `()` once the connection is closed.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
            .await?
            .map_err(channel_error)
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port,
            originator_host: originator_host.to_string(),
            originator_port,
            reply_tx,
        })
        .await?
        .map_err(channel_error)
    }

    /// Ask the server to listen on `address:port`. Returns the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        self.request(|reply_tx| HandleCommand::TcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(channel_error)
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(channel_error)
    }

    pub async fn ping(&self) -> PingResult {
        self.request(|reply_tx| HandleCommand::Ping { reply_tx })
            .await
            .unwrap_or(PingResult::IoError)
    }

    /// Request disconnection without waiting.
    pub fn disconnect(&self) {
        if self.cmd_tx.try_send(HandleCommand::Disconnect).is_err() {
            debug!("Disconnect not queued, owner task already gone or busy");
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task on `spawner` and return the controller.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    label: String,
    spawner: &runtime::Handle,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);

    spawner.spawn(run_owner(handle, label, cmd_rx, disconnect_tx.clone()));

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

async fn run_owner(
    handle: Handle<ClientHandler>,
    label: String,
    mut cmd_rx: mpsc::Receiver<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
) {
    let mut handle = handle;
    info!("Handle owner task started for {}", label);

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let result = handle.channel_open_session().await;
                if reply_tx.send(result).is_err() {
                    warn!("Caller dropped before receiving session channel on {}", label);
                }
            }

            HandleCommand::ChannelOpenDirectTcpip {
                host,
                port,
                originator_host,
                originator_port,
                reply_tx,
            } => {
                debug!("Opening direct-tcpip to {}:{} on {}", host, port, label);
                let result = handle
                    .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                    .await;
                if reply_tx.send(result).is_err() {
                    warn!("Caller dropped before receiving direct-tcpip channel on {}", label);
                }
            }

            HandleCommand::TcpipForward {
                address,
                port,
                reply_tx,
            } => {
                let result = handle.tcpip_forward(&address, port).await;
                if let Ok(bound_port) = result {
                    if reply_tx.send(Ok(bound_port)).is_err() {
                        // Nobody owns this bind anymore.
                        warn!(
                            "Caller dropped after tcpip_forward succeeded, cancelling {}:{}",
                            address, bound_port
                        );
                        let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                    }
                } else {
                    let _ = reply_tx.send(result);
                }
            }

            HandleCommand::CancelTcpipForward {
                address,
                port,
                reply_tx,
            } => {
                let result = handle.cancel_tcpip_forward(&address, port).await;
                let _ = reply_tx.send(result);
            }

            HandleCommand::Ping { reply_tx } => {
                let result =
                    match tokio::time::timeout(KEEPALIVE_TIMEOUT, handle.send_keepalive(true)).await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) => PingResult::IoError,
                        Ok(Err(e)) => {
                            warn!("Keepalive error on {}: {}", label, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout on {}", label);
                            PingResult::Timeout
                        }
                    };
                let _ = reply_tx.send(result);
            }

            HandleCommand::Disconnect => {
                info!("Disconnect requested for {}", label);
                break;
            }
        }
    }

    drain_pending_commands(&mut cmd_rx);

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
        .await;
    let _ = disconnect_tx.send(());
    info!("Handle owner task terminated for {}", label);
}

/// Answer every queued command with a disconnect error.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
