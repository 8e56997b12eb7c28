//! Flow-controlled Reading and Writing
//!
//! A Reading operation is an actor with its own mailbox. It owns the byte
//! budget, the consumer demand and, only while a read would block, one callback
//! registration on the channel. Callbacks never touch reader state; they post
//! `DataAvailable` / `Eof` / `Closed` to the mailbox and the actor reacts on
//! the session loop.
//!
//! Demand model:
//! - bounded demand: one chunk per request, then demand drops back to `None`
//!   and nothing is taken from the channel until the consumer asks again
//! - unbounded demand: the actor keeps rescheduling itself after every chunk
//!   until the budget is spent or the channel reaches EOF
//!
//! Writing is capped by the channel window. A zero window parks the write on a
//! `WindowAdjusted` callback instead of spinning; partial writes continue with
//! the remainder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::channel_io::{
    CallbackRegistration, ChannelCallback, ChannelEvent, ChannelIo, NonBlockingRead, Side,
};
use super::error::SshError;
use super::io::Consumer;

/// Largest chunk taken from the channel in one non-blocking read
pub const MAX_READ_CHUNK: usize = 1_280_000;

/// Consumer demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    None,
    Max(usize),
    Unlimited,
}

impl Demand {
    /// Accumulate a new request. Unlimited demand stays unlimited.
    pub fn add(self, other: Demand) -> Demand {
        match (self, other) {
            (Demand::Unlimited, _) | (_, Demand::Unlimited) => Demand::Unlimited,
            (Demand::None, d) | (d, Demand::None) => d,
            (Demand::Max(a), Demand::Max(b)) => Demand::Max(a.saturating_add(b)),
        }
    }
}

/// How many bytes a Reading operation may deliver in total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBudget {
    Bytes(usize),
    UntilEof,
}

enum ReadingMsg {
    Demand(Demand),
    DataAvailable,
    Eof,
    Closed,
    Cancel,
}

enum ReadingEvent {
    Data(Bytes),
    Finished,
    Failed(SshError),
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Done,
}

struct Reading {
    io: Arc<dyn ChannelIo>,
    side: Side,
    bytes_left: Option<usize>,
    bytes_read: usize,
    demand: Demand,
    registration: Option<CallbackRegistration>,
    mailbox: mpsc::UnboundedSender<ReadingMsg>,
    output: mpsc::UnboundedSender<ReadingEvent>,
}

impl Reading {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ReadingMsg>) {
        loop {
            let msg = tokio::select! {
                msg = inbox.recv() => msg,
                _ = self.output.closed() => None,
            };
            let step = match msg {
                Some(ReadingMsg::Demand(demand)) => {
                    self.demand = self.demand.add(demand);
                    self.read_async()
                }
                Some(ReadingMsg::DataAvailable) | Some(ReadingMsg::Eof) | Some(ReadingMsg::Closed) => {
                    self.read_async()
                }
                Some(ReadingMsg::Cancel) | None => Step::Done,
            };
            if step == Step::Done {
                break;
            }
        }
        self.registration = None;
        trace!("Reading on {:?} stopped after {} bytes", self.side, self.bytes_read);
    }

    fn read_async(&mut self) -> Step {
        if self.bytes_left == Some(0) {
            return self.complete();
        }
        if self.demand == Demand::None {
            // Leave the bytes buffered in the channel until the consumer asks.
            return Step::Continue;
        }

        let size = self
            .bytes_left
            .map_or(MAX_READ_CHUNK, |left| left.min(MAX_READ_CHUNK));
        let mut delivered = false;
        match self.io.read_nonblocking(self.side, size) {
            NonBlockingRead::Data(data) if !data.is_empty() => {
                delivered = true;
                if self.deliver(data) == Step::Done {
                    return Step::Done;
                }
            }
            NonBlockingRead::Data(_) | NonBlockingRead::WouldBlock => {}
            NonBlockingRead::Eof => return self.complete(),
            NonBlockingRead::Failed(err) => return self.fail(err),
        }

        if self.io.is_eof(self.side) {
            return self.complete();
        }

        if delivered {
            if self.demand == Demand::Unlimited {
                self.reschedule();
            }
        } else {
            self.arm_callbacks();
        }
        Step::Continue
    }

    fn deliver(&mut self, data: Bytes) -> Step {
        let n = data.len();
        self.bytes_read += n;
        if let Some(left) = self.bytes_left.as_mut() {
            *left -= n.min(*left);
        }
        if self.output.send(ReadingEvent::Data(data)).is_err() {
            return Step::Done;
        }
        if self.demand != Demand::Unlimited {
            self.demand = Demand::None;
        }
        if self.bytes_left == Some(0) {
            return self.complete();
        }
        Step::Continue
    }

    fn reschedule(&self) {
        let _ = self.mailbox.send(ReadingMsg::DataAvailable);
    }

    fn arm_callbacks(&mut self) {
        if self.registration.is_some() {
            return;
        }
        let mailbox = self.mailbox.clone();
        let side = self.side;
        let callback: ChannelCallback = Arc::new(move |event| {
            let msg = match event {
                ChannelEvent::Data(from) if from == side => ReadingMsg::DataAvailable,
                ChannelEvent::Data(_) | ChannelEvent::WindowAdjusted => return,
                ChannelEvent::Eof => ReadingMsg::Eof,
                ChannelEvent::Closed => ReadingMsg::Closed,
            };
            let _ = mailbox.send(msg);
        });
        self.registration = Some(CallbackRegistration::install(&self.io, callback));
        // Data may have landed between the failed read and the registration.
        self.reschedule();
    }

    fn complete(&mut self) -> Step {
        self.registration = None;
        debug!("Reading on {:?} complete ({} bytes)", self.side, self.bytes_read);
        let _ = self.output.send(ReadingEvent::Finished);
        Step::Done
    }

    fn fail(&mut self, err: SshError) -> Step {
        self.registration = None;
        debug!("Reading on {:?} failed: {}", self.side, err);
        let _ = self.output.send(ReadingEvent::Failed(err));
        Step::Done
    }
}

/// Consumer side of a Reading actor.
///
/// Dropping the handle stops the actor and unregisters its callbacks.
pub struct ReadingHandle {
    mailbox: mpsc::UnboundedSender<ReadingMsg>,
    events: mpsc::UnboundedReceiver<ReadingEvent>,
    done: bool,
}

impl ReadingHandle {
    /// Spawn a Reading actor for `side` on `spawner`.
    pub fn start(io: Arc<dyn ChannelIo>, side: Side, budget: ReadBudget, spawner: &Handle) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (output, events) = mpsc::unbounded_channel();
        let bytes_left = match budget {
            ReadBudget::Bytes(n) => Some(n),
            ReadBudget::UntilEof => None,
        };
        let reading = Reading {
            io,
            side,
            bytes_left,
            bytes_read: 0,
            demand: Demand::None,
            registration: None,
            mailbox: mailbox.clone(),
            output,
        };
        spawner.spawn(reading.run(inbox));
        Self {
            mailbox,
            events,
            done: false,
        }
    }

    pub fn request(&self, demand: Demand) {
        let _ = self.mailbox.send(ReadingMsg::Demand(demand));
    }

    pub fn cancel(&self) {
        let _ = self.mailbox.send(ReadingMsg::Cancel);
    }

    /// Next delivered chunk; `None` once the operation completed.
    pub async fn next(&mut self) -> Option<Result<Bytes, SshError>> {
        if self.done {
            return None;
        }
        match self.events.recv().await {
            Some(ReadingEvent::Data(data)) => Some(Ok(data)),
            Some(ReadingEvent::Finished) => {
                self.done = true;
                None
            }
            Some(ReadingEvent::Failed(err)) => {
                self.done = true;
                Some(Err(err))
            }
            None => {
                self.done = true;
                Some(Err(SshError::ChannelError("read cancelled".into())))
            }
        }
    }
}

/// Read up to `max` bytes, stopping early only at EOF.
pub async fn read_budget(
    io: Arc<dyn ChannelIo>,
    side: Side,
    max: usize,
    spawner: &Handle,
) -> Result<Bytes, SshError> {
    let mut reading = ReadingHandle::start(io, side, ReadBudget::Bytes(max), spawner);
    reading.request(Demand::Unlimited);
    let mut out = BytesMut::new();
    while let Some(chunk) = reading.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out.freeze())
}

/// Copy `side` into `consumer` until EOF.
///
/// With `Demand::Max(_)` every chunk waits for the consumer before the next
/// one is taken from the channel; with `Demand::Unlimited` the channel is
/// drained as fast as it produces.
pub async fn pipe_to(
    io: Arc<dyn ChannelIo>,
    side: Side,
    consumer: &mut dyn Consumer,
    demand: Demand,
    counter: &AtomicU64,
    spawner: &Handle,
) -> Result<u64, SshError> {
    let mut reading = ReadingHandle::start(io, side, ReadBudget::UntilEof, spawner);
    reading.request(demand);
    let mut total = 0u64;
    while let Some(chunk) = reading.next().await {
        let chunk = chunk?;
        let len = chunk.len() as u64;
        consumer.write(chunk).await?;
        total += len;
        counter.fetch_add(len, Ordering::Relaxed);
        if demand != Demand::Unlimited {
            reading.request(demand);
        }
    }
    consumer.finish().await?;
    Ok(total)
}

/// Write all of `data`, never more than the channel window at a time.
pub async fn write_all(
    io: &Arc<dyn ChannelIo>,
    data: Bytes,
    cancel: &CancellationToken,
) -> Result<usize, SshError> {
    let mut remaining = data;
    let mut written = 0;
    let mut wakeups: Option<(CallbackRegistration, mpsc::UnboundedReceiver<()>)> = None;

    while !remaining.is_empty() {
        if cancel.is_cancelled() {
            return Err(SshError::ChannelError("write cancelled".into()));
        }

        let window = io.window_size();
        if window == 0 {
            if io.is_closed() {
                return Err(SshError::ChannelError("channel closed".into()));
            }
            match wakeups.as_mut() {
                None => {
                    trace!("Window depleted, waiting for adjustment");
                    let (tx, rx) = mpsc::unbounded_channel();
                    let callback: ChannelCallback = Arc::new(move |event| {
                        if matches!(event, ChannelEvent::WindowAdjusted | ChannelEvent::Closed) {
                            let _ = tx.send(());
                        }
                    });
                    wakeups = Some((CallbackRegistration::install(io, callback), rx));
                    // Re-check: the window may have opened before the registration.
                    continue;
                }
                Some((_, rx)) => {
                    tokio::select! {
                        _ = rx.recv() => {}
                        _ = cancel.cancelled() => {
                            return Err(SshError::ChannelError("write cancelled".into()));
                        }
                    }
                    continue;
                }
            }
        }

        let size = remaining.len().min(window);
        let n = io.write(remaining.slice(..size))?;
        written += n;
        remaining = remaining.slice(n..);
        if !remaining.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    Ok(written)
}
