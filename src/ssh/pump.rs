//! russh channel pump
//!
//! Adapts a `russh::Channel<Msg>` to the non-blocking [`ChannelIo`] interface.
//! One pump task per channel runs on the session loop and is the only code that
//! touches the channel:
//!
//! ```text
//!   channel.wait() ──► per-side buffers ──► read_nonblocking()
//!                          │
//!                          └─► callbacks (Data / Eof / Closed)
//!
//!   write() ──► command queue ──► channel.data() ──► credit returned ──► WindowAdjusted
//! ```
//!
//! Writes are capped by a fixed in-flight credit that stands in for the remote
//! window; the credit is returned once russh has accepted the bytes. Reading
//! from the channel pauses while buffered output exceeds a high-water mark so
//! a slow consumer throttles the remote through the SSH window.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::channel_io::{
    CallbackId, CallbackTable, ChannelCallback, ChannelEvent, ChannelIo, NonBlockingRead, Side,
};
use super::error::SshError;

/// Write credit: bytes queued to russh but not yet accepted
pub const MAX_IN_FLIGHT: usize = 2 * 1024 * 1024;

/// Buffered output above which the pump stops pulling from the channel
const HIGH_WATER_MARK: usize = 4 * 1024 * 1024;

enum PumpCommand {
    Data(Bytes),
    Eof,
    WindowChange { cols: u32, rows: u32 },
    Close,
}

#[derive(Default)]
struct PumpState {
    stdout: BytesMut,
    stderr: BytesMut,
    eof: bool,
    closed: bool,
    in_flight: usize,
    exit_status: Option<u32>,
    error: Option<SshError>,
}

impl PumpState {
    fn buffered(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

struct PumpShared {
    label: String,
    state: Mutex<PumpState>,
    callbacks: CallbackTable,
    drained: Notify,
}

impl PumpShared {
    fn push(&self, side: Side, data: &[u8]) {
        {
            let mut state = self.state.lock();
            match side {
                Side::Stdout => state.stdout.extend_from_slice(data),
                Side::Stderr => state.stderr.extend_from_slice(data),
            }
        }
        self.callbacks.notify(ChannelEvent::Data(side));
    }

    fn is_backlogged(&self) -> bool {
        self.state.lock().buffered() > HIGH_WATER_MARK
    }

    fn mark_eof(&self) {
        self.state.lock().eof = true;
        self.callbacks.notify(ChannelEvent::Eof);
    }

    fn mark_closed(&self) {
        let newly_closed = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.callbacks.notify(ChannelEvent::Closed);
        }
    }

    fn fail(&self, err: SshError) {
        warn!("Channel {} failed: {}", self.label, err);
        self.state.lock().error = Some(err);
        self.mark_closed();
    }

    fn release_credit(&self, len: usize) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(len);
        }
        self.callbacks.notify(ChannelEvent::WindowAdjusted);
    }
}

/// A russh channel driven by a pump task
pub struct PumpedChannel {
    shared: Arc<PumpShared>,
    cmd_tx: mpsc::UnboundedSender<PumpCommand>,
}

impl PumpedChannel {
    /// Start pumping `channel` on `spawner` (the owning session loop).
    pub fn spawn(channel: Channel<Msg>, spawner: &Handle) -> Arc<Self> {
        let label = format!("{:?}", channel.id());
        let shared = Arc::new(PumpShared {
            label,
            state: Mutex::new(PumpState::default()),
            callbacks: CallbackTable::default(),
            drained: Notify::new(),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        spawner.spawn(drive(channel, shared.clone(), cmd_rx));
        Arc::new(Self { shared, cmd_tx })
    }
}

async fn drive(
    mut channel: Channel<Msg>,
    shared: Arc<PumpShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
) {
    debug!("Channel pump started for {}", shared.label);

    loop {
        let backlogged = shared.is_backlogged();
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PumpCommand::Data(data)) => {
                        let len = data.len();
                        let result = channel.data(&data[..]).await;
                        shared.release_credit(len);
                        if let Err(e) = result {
                            shared.fail(SshError::ChannelError(format!("write failed: {}", e)));
                            break;
                        }
                    }
                    Some(PumpCommand::Eof) => {
                        if let Err(e) = channel.eof().await {
                            shared.fail(SshError::ChannelError(format!("EOF failed: {}", e)));
                            break;
                        }
                        trace!("EOF sent on {}", shared.label);
                    }
                    Some(PumpCommand::WindowChange { cols, rows }) => {
                        if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                            warn!("Failed to resize PTY on {}: {}", shared.label, e);
                        }
                    }
                    Some(PumpCommand::Close) | None => {
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait(), if !backlogged => {
                match msg {
                    Some(ChannelMsg::Data { data }) => shared.push(Side::Stdout, &data[..]),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            shared.push(Side::Stderr, &data[..]);
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        debug!("Remote EOF on {}", shared.label);
                        shared.mark_eof();
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Exit status {} on {}", exit_status, shared.label);
                        shared.state.lock().exit_status = Some(exit_status);
                    }
                    Some(ChannelMsg::WindowAdjusted { .. }) => {
                        shared.callbacks.notify(ChannelEvent::WindowAdjusted);
                    }
                    Some(ChannelMsg::Close) | None => {
                        debug!("Remote closed {}", shared.label);
                        break;
                    }
                    Some(_) => {}
                }
            }

            _ = shared.drained.notified(), if backlogged => {}
        }
    }

    shared.mark_closed();
    debug!("Channel pump terminated for {}", shared.label);
}

impl ChannelIo for PumpedChannel {
    fn read_nonblocking(&self, side: Side, max: usize) -> NonBlockingRead {
        let mut state = self.shared.state.lock();
        let was_backlogged = state.buffered() > HIGH_WATER_MARK;
        let finished = state.eof || state.closed;
        let error = state.error.clone();
        let buffer = match side {
            Side::Stdout => &mut state.stdout,
            Side::Stderr => &mut state.stderr,
        };
        if buffer.is_empty() {
            if let Some(err) = error {
                return NonBlockingRead::Failed(err);
            }
            return if finished {
                NonBlockingRead::Eof
            } else {
                NonBlockingRead::WouldBlock
            };
        }
        let n = buffer.len().min(max);
        let chunk = buffer.split_to(n).freeze();
        if was_backlogged && state.buffered() <= HIGH_WATER_MARK {
            self.shared.drained.notify_one();
        }
        NonBlockingRead::Data(chunk)
    }

    fn is_eof(&self, side: Side) -> bool {
        let state = self.shared.state.lock();
        let buffer = match side {
            Side::Stdout => &state.stdout,
            Side::Stderr => &state.stderr,
        };
        (state.eof || state.closed) && buffer.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn window_size(&self) -> usize {
        let state = self.shared.state.lock();
        if state.closed {
            0
        } else {
            MAX_IN_FLIGHT.saturating_sub(state.in_flight)
        }
    }

    fn write(&self, data: Bytes) -> Result<usize, SshError> {
        let n = {
            let mut state = self.shared.state.lock();
            if let Some(err) = state.error.clone() {
                return Err(err);
            }
            if state.closed {
                return Err(SshError::ChannelError("channel closed".into()));
            }
            let n = data.len().min(MAX_IN_FLIGHT.saturating_sub(state.in_flight));
            state.in_flight += n;
            n
        };
        if n == 0 {
            return Ok(0);
        }
        self.cmd_tx
            .send(PumpCommand::Data(data.slice(..n)))
            .map_err(|_| SshError::ChannelError("channel pump stopped".into()))?;
        Ok(n)
    }

    fn send_eof(&self) -> Result<(), SshError> {
        self.cmd_tx
            .send(PumpCommand::Eof)
            .map_err(|_| SshError::ChannelError("channel pump stopped".into()))
    }

    fn change_pty_size(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.cmd_tx
            .send(PumpCommand::WindowChange { cols, rows })
            .map_err(|_| SshError::ChannelError("channel pump stopped".into()))
    }

    fn add_callbacks(&self, callback: ChannelCallback) -> CallbackId {
        self.shared.callbacks.add(callback)
    }

    fn remove_callbacks(&self, id: CallbackId) {
        self.shared.callbacks.remove(id);
    }

    fn exit_status(&self) -> Option<u32> {
        self.shared.state.lock().exit_status
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(PumpCommand::Close);
        self.shared.mark_closed();
    }
}

impl Drop for PumpedChannel {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PumpCommand::Close);
    }
}
