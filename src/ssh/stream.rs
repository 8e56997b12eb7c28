//! Channel Stream
//!
//! One multiplexed pipe inside a session (exec, shell, forwarded socket,
//! agent channel, subsystem). A Stream wraps a [`ChannelIo`] and, once
//! `connect`ed, drives three independent pipelines on the session loop:
//!
//! ```text
//!   stdout:  Reading(Stdout) ──► Consumer
//!   stderr:  Reading(Stderr) ──► Consumer        (optional)
//!   stdin:   Producer ──► Writing ──► EOF        (optional)
//! ```
//!
//! The completion callback fires once, after stdout and stderr both reached
//! EOF. Any pipeline error fires the failure callback instead and cancels the
//! Stream. Completion and failure are mutually exclusive and fire at most once.
//!
//! Cancellation aborts the pipeline tasks and closes the channel exactly once.
//! It performs no I/O of its own, so it is safe to call from inside a
//! completion or failure callback.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel_io::{CallbackRegistration, ChannelEvent, ChannelIo, Side};
use super::error::SshError;
use super::flow::{self, Demand};
use super::io::{AsyncReadProducer, AsyncWriteConsumer, Consumer, Producer};

pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a Stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Channel open, no pipelines wired
    Open,
    /// `connect` wired producers/consumers
    Connected,
    /// stdin finished and EOF was sent
    Completing,
    Closed,
}

/// Receives close notifications from its Streams (the owning session).
pub trait StreamOwner: Send + Sync {
    fn stream_closed(&self, id: StreamId);
}

type CompletionCallback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(SshError) + Send>;

#[derive(Default)]
struct Callbacks {
    completion: Option<CompletionCallback>,
    failure: Option<FailureCallback>,
    fired: bool,
}

#[derive(Default)]
struct Pipelines {
    stdout: Option<JoinHandle<()>>,
    stdin: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl Pipelines {
    fn abort_all(&mut self) {
        for handle in [self.stdout.take(), self.stdin.take(), self.stderr.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct ByteCounters {
    stdout: AtomicU64,
    stdin: AtomicU64,
    stderr: AtomicU64,
}

struct StreamInner {
    id: StreamId,
    label: String,
    io: Arc<dyn ChannelIo>,
    spawner: Handle,
    owner: Option<Arc<dyn StreamOwner>>,
    state: Mutex<StreamState>,
    pipelines: Mutex<Pipelines>,
    callbacks: Mutex<Callbacks>,
    /// Pipelines that must finish before completion fires
    pending: AtomicUsize,
    counters: ByteCounters,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StreamInner {
    fn set_state(&self, next: StreamState) {
        let mut state = self.state.lock();
        if *state != StreamState::Closed {
            *state = next;
        }
    }

    fn take_callbacks(&self) -> Option<(Option<CompletionCallback>, Option<FailureCallback>)> {
        let mut callbacks = self.callbacks.lock();
        if callbacks.fired {
            return None;
        }
        callbacks.fired = true;
        Some((callbacks.completion.take(), callbacks.failure.take()))
    }

    fn complete(&self) {
        if let Some((completion, _)) = self.take_callbacks() {
            info!("Stream {} ({}) completed", self.id, self.label);
            if let Some(callback) = completion {
                callback();
            }
        }
        self.cancel();
    }

    fn fail(&self, err: SshError) {
        if let Some((_, failure)) = self.take_callbacks() {
            warn!("Stream {} ({}) failed: {}", self.id, self.label, err);
            if let Some(callback) = failure {
                callback(err);
            }
        }
        self.cancel();
    }

    fn pipeline_finished(&self, result: Result<u64, SshError>) {
        match result {
            Ok(_) => {
                if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.complete();
                }
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Cancelling stream {} ({})", self.id, self.label);
        // Unfired callbacks are dropped, never run.
        drop(self.take_callbacks());
        self.cancel.cancel();
        self.pipelines.lock().abort_all();
        *self.state.lock() = StreamState::Closed;
        self.io.close();
        if let Some(owner) = &self.owner {
            owner.stream_closed(self.id);
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Stream {} ({}) dropped, closing channel", self.id, self.label);
            self.io.close();
            if let Some(owner) = &self.owner {
                owner.stream_closed(self.id);
            }
        }
    }
}

/// Resolves once `io` reports Closed.
async fn channel_closed(io: &Arc<dyn ChannelIo>) {
    let notify = Arc::new(Notify::new());
    let signal = notify.clone();
    let _registration = CallbackRegistration::install(
        io,
        Arc::new(move |event: ChannelEvent| {
            if event == ChannelEvent::Closed {
                signal.notify_one();
            }
        }),
    );
    if io.is_closed() {
        return;
    }
    notify.notified().await;
}

/// Handle to a Channel Stream. Clones share the same channel.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Wrap an opened channel. `spawner` is the owning session loop.
    pub fn new(
        io: Arc<dyn ChannelIo>,
        label: impl Into<String>,
        spawner: Handle,
        owner: Option<Arc<dyn StreamOwner>>,
    ) -> Self {
        let inner = StreamInner {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            io,
            spawner,
            owner,
            state: Mutex::new(StreamState::Open),
            pipelines: Mutex::new(Pipelines::default()),
            callbacks: Mutex::new(Callbacks::default()),
            pending: AtomicUsize::new(0),
            counters: ByteCounters::default(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stdout_bytes(&self) -> u64 {
        self.inner.counters.stdout.load(Ordering::Relaxed)
    }

    pub fn stdin_bytes(&self) -> u64 {
        self.inner.counters.stdin.load(Ordering::Relaxed)
    }

    pub fn stderr_bytes(&self) -> u64 {
        self.inner.counters.stderr.load(Ordering::Relaxed)
    }

    /// Exit status reported by the remote command, if any.
    pub fn exit_status(&self) -> Option<u32> {
        self.inner.io.exit_status()
    }

    /// Fired once when stdout (and stderr, if wired) reach EOF.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.callbacks.lock().completion = Some(Box::new(callback));
    }

    /// Fired once when any pipeline fails.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: FnOnce(SshError) + Send + 'static,
    {
        self.inner.callbacks.lock().failure = Some(Box::new(callback));
    }

    /// Wire the stdout, stdin and stderr pipelines.
    pub fn connect(
        &self,
        stdout: Box<dyn Consumer>,
        stdin: Option<Box<dyn Producer>>,
        stderr: Option<Box<dyn Consumer>>,
    ) -> Result<(), SshError> {
        self.wire(stdout, stdin, stderr, false)
    }

    /// `stdin_completes`: completion also waits for stdin to finish and EOF to be sent.
    fn wire(
        &self,
        stdout: Box<dyn Consumer>,
        stdin: Option<Box<dyn Producer>>,
        stderr: Option<Box<dyn Consumer>>,
        stdin_completes: bool,
    ) -> Result<(), SshError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                StreamState::Open => *state = StreamState::Connected,
                StreamState::Closed => {
                    return Err(SshError::ChannelError("stream is closed".into()))
                }
                _ => return Err(SshError::ChannelError("stream already connected".into())),
            }
        }

        let readers = 1 + usize::from(stderr.is_some());
        let waits_on_stdin = stdin_completes && stdin.is_some();
        self.inner
            .pending
            .store(readers + usize::from(waits_on_stdin), Ordering::Release);

        let mut pipelines = self.inner.pipelines.lock();
        pipelines.stdout = Some(self.spawn_reader(Side::Stdout, stdout));
        if let Some(stderr) = stderr {
            pipelines.stderr = Some(self.spawn_reader(Side::Stderr, stderr));
        }
        if let Some(stdin) = stdin {
            pipelines.stdin = Some(self.spawn_writer(stdin, waits_on_stdin));
        }
        debug!(
            "Stream {} ({}) connected with {} reader(s)",
            self.inner.id, self.inner.label, readers
        );
        Ok(())
    }

    fn spawn_reader(&self, side: Side, mut consumer: Box<dyn Consumer>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        self.inner.spawner.spawn(async move {
            let counter = match side {
                Side::Stdout => &inner.counters.stdout,
                Side::Stderr => &inner.counters.stderr,
            };
            let result = flow::pipe_to(
                inner.io.clone(),
                side,
                consumer.as_mut(),
                Demand::Max(1),
                counter,
                &inner.spawner,
            )
            .await;
            inner.pipeline_finished(result);
        })
    }

    fn spawn_writer(&self, mut producer: Box<dyn Producer>, completes: bool) -> JoinHandle<()> {
        let inner = self.inner.clone();
        self.inner.spawner.spawn(async move {
            let pumped = async {
                while let Some(chunk) = producer.next_chunk().await? {
                    let n = flow::write_all(&inner.io, chunk, &inner.cancel).await?;
                    inner.counters.stdin.fetch_add(n as u64, Ordering::Relaxed);
                }
                Ok::<(), SshError>(())
            };

            // A bridged producer may never end on its own; a closed channel ends it.
            let result = if completes {
                tokio::select! {
                    result = pumped => result,
                    _ = channel_closed(&inner.io) => {
                        debug!("Stream {} channel closed, stopping stdin", inner.id);
                        inner.pipeline_finished(Ok(0));
                        return;
                    }
                }
            } else {
                pumped.await
            };

            match result {
                Ok(()) => {
                    inner.set_state(StreamState::Completing);
                    if let Err(e) = inner.io.send_eof() {
                        inner.fail(SshError::ChannelError(format!("failed to send EOF: {}", e)));
                    } else {
                        debug!("Stream {} stdin finished, EOF sent", inner.id);
                        if completes {
                            inner.pipeline_finished(Ok(0));
                        }
                    }
                }
                Err(err) => inner.fail(err),
            }
        })
    }

    async fn on_loop<F, T>(&self, fut: F) -> Result<T, SshError>
    where
        F: std::future::Future<Output = Result<T, SshError>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .spawner
            .spawn(fut)
            .await
            .map_err(|_| SshError::Disconnected)?
    }

    /// Read up to `max` bytes of stdout; shorter only at EOF.
    pub async fn read(&self, max: usize) -> Result<Bytes, SshError> {
        self.read_side(Side::Stdout, max).await
    }

    pub async fn read_stderr(&self, max: usize) -> Result<Bytes, SshError> {
        self.read_side(Side::Stderr, max).await
    }

    async fn read_side(&self, side: Side, max: usize) -> Result<Bytes, SshError> {
        let inner = self.inner.clone();
        self.on_loop(async move {
            let data = flow::read_budget(inner.io.clone(), side, max, &inner.spawner).await?;
            let counter = match side {
                Side::Stdout => &inner.counters.stdout,
                Side::Stderr => &inner.counters.stderr,
            };
            counter.fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(data)
        })
        .await
    }

    /// Write `data` to stdin, honouring the channel window.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize, SshError> {
        let data = data.into();
        let inner = self.inner.clone();
        self.on_loop(async move {
            let n = flow::write_all(&inner.io, data, &inner.cancel).await?;
            inner.counters.stdin.fetch_add(n as u64, Ordering::Relaxed);
            Ok(n)
        })
        .await
    }

    /// Copy all of stdout into `consumer` without per-chunk demand.
    pub async fn write_to<C>(&self, mut consumer: C) -> Result<u64, SshError>
    where
        C: Consumer + 'static,
    {
        let inner = self.inner.clone();
        self.on_loop(async move {
            flow::pipe_to(
                inner.io.clone(),
                Side::Stdout,
                &mut consumer,
                Demand::Unlimited,
                &inner.counters.stdout,
                &inner.spawner,
            )
            .await
        })
        .await
    }

    /// Bridge the channel to `socket` in both directions. The Stream completes
    /// once both directions reached EOF, or once the channel closes; the
    /// receiver resolves with the outcome.
    pub fn bridge<S>(&self, socket: S) -> Result<oneshot::Receiver<Result<(), SshError>>, SshError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(socket);
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        let on_done = done_tx.clone();
        self.on_completion(move || {
            if let Some(tx) = on_done.lock().take() {
                let _ = tx.send(Ok(()));
            }
        });
        self.on_failure(move |err| {
            if let Some(tx) = done_tx.lock().take() {
                let _ = tx.send(Err(err));
            }
        });

        self.wire(
            Box::new(AsyncWriteConsumer::new(write_half)),
            Some(Box::new(AsyncReadProducer::new(read_half))),
            None,
            true,
        )?;
        Ok(done_rx)
    }

    /// Resize the remote PTY (PTY-bearing channels only).
    pub fn resize(&self, rows: u32, cols: u32) -> Result<(), SshError> {
        self.inner.io.change_pty_size(cols, rows)
    }

    /// Signal end of input. Stops a running stdin pipeline.
    pub fn send_eof(&self) -> Result<(), SshError> {
        if let Some(stdin) = self.inner.pipelines.lock().stdin.take() {
            stdin.abort();
        }
        self.inner.set_state(StreamState::Completing);
        self.inner.io.send_eof()
    }

    /// Cancel all pipelines and close the channel. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Session teardown: a Stream that is already finishing completes,
    /// anything still mid-transfer fails with `Disconnected`.
    pub(crate) fn session_cancelled(&self) {
        let finishing = self.state() == StreamState::Completing
            || (self.inner.io.is_eof(Side::Stdout) && self.inner.io.is_eof(Side::Stderr));
        if finishing {
            self.inner.complete();
        } else {
            self.inner.fail(SshError::Disconnected);
        }
    }

    fn downgrade(&self) -> Weak<StreamInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Weakly tracked Streams of one session.
///
/// The arena never keeps a Stream alive; Streams remove themselves when
/// they close.
#[derive(Default)]
pub struct StreamArena {
    streams: DashMap<StreamId, Weak<StreamInner>>,
}

impl StreamArena {
    pub fn insert(&self, stream: &Stream) {
        self.streams.insert(stream.id(), stream.downgrade());
    }

    pub fn remove(&self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Streams still alive.
    pub fn live(&self) -> Vec<Stream> {
        self.streams
            .iter()
            .filter_map(|entry| entry.value().upgrade().map(|inner| Stream { inner }))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
