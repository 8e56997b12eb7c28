//! Non-blocking channel primitive
//!
//! Reading and Writing operations never touch a russh `Channel` directly. They
//! work against [`ChannelIo`], which exposes the channel the way a polling
//! engine would: a read that can report "would block", a remote window that
//! caps writes, and a table of event callbacks that fire when data arrives,
//! the window grows, or the channel reaches EOF / closes.
//!
//! Callbacks run on the session loop and must not mutate reader state
//! directly; they only post messages to the owning actor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::error::SshError;

/// Logical output side of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Stdout,
    Stderr,
}

/// Result of a non-blocking read
#[derive(Debug)]
pub enum NonBlockingRead {
    Data(Bytes),
    WouldBlock,
    Eof,
    Failed(SshError),
}

/// Events delivered to registered callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Side),
    Eof,
    Closed,
    WindowAdjusted,
}

pub type ChannelCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub trait ChannelIo: Send + Sync {
    /// Take up to `max` buffered bytes from `side` without waiting.
    fn read_nonblocking(&self, side: Side, max: usize) -> NonBlockingRead;

    /// Remote sent EOF (or closed) and nothing is left buffered on `side`.
    fn is_eof(&self, side: Side) -> bool;

    fn is_closed(&self) -> bool;

    /// Bytes the peer can currently receive.
    fn window_size(&self) -> usize;

    /// Queue up to `window_size()` bytes of `data`; returns how many were accepted.
    fn write(&self, data: Bytes) -> Result<usize, SshError>;

    fn send_eof(&self) -> Result<(), SshError>;

    fn change_pty_size(&self, cols: u32, rows: u32) -> Result<(), SshError>;

    fn add_callbacks(&self, callback: ChannelCallback) -> CallbackId;

    fn remove_callbacks(&self, id: CallbackId);

    fn exit_status(&self) -> Option<u32> {
        None
    }

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// RAII registration of a callback, removed on drop.
pub struct CallbackRegistration {
    io: Arc<dyn ChannelIo>,
    id: CallbackId,
}

impl CallbackRegistration {
    pub fn install(io: &Arc<dyn ChannelIo>, callback: ChannelCallback) -> Self {
        let id = io.add_callbacks(callback);
        Self {
            io: io.clone(),
            id,
        }
    }
}

impl Drop for CallbackRegistration {
    fn drop(&mut self) {
        self.io.remove_callbacks(self.id);
    }
}

/// Callback table shared by `ChannelIo` implementations.
#[derive(Default)]
pub struct CallbackTable {
    next_id: AtomicU64,
    entries: Mutex<Vec<(CallbackId, ChannelCallback)>>,
}

impl CallbackTable {
    pub fn add(&self, callback: ChannelCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, callback));
        id
    }

    pub fn remove(&self, id: CallbackId) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback outside the table lock.
    pub fn notify(&self, event: ChannelEvent) {
        let callbacks: Vec<ChannelCallback> =
            self.entries.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_callback_table_add_remove() {
        let table = CallbackTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = table.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        table.notify(ChannelEvent::Eof);
        table.remove(id);
        table.notify(ChannelEvent::Eof);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_registration_removed_on_drop() {
        let channel = mock::MockChannel::new(0);
        let io = channel.io();
        let registration = CallbackRegistration::install(&io, Arc::new(|_| {}));
        assert_eq!(channel.callbacks_installed(), 1);
        drop(registration);
        assert_eq!(channel.callbacks_installed(), 0);
    }

    #[test]
    fn test_mock_eof_after_buffer_drained() {
        let channel = mock::MockChannel::new(0);
        channel.push(Side::Stdout, b"tail");
        channel.set_eof();
        assert!(!channel.is_eof(Side::Stdout));
        assert!(channel.is_eof(Side::Stderr));
        match channel.read_nonblocking(Side::Stdout, 16) {
            NonBlockingRead::Data(data) => assert_eq!(&data[..], b"tail"),
            other => panic!("unexpected read: {:?}", other),
        }
        assert!(matches!(
            channel.read_nonblocking(Side::Stdout, 16),
            NonBlockingRead::Eof
        ));
    }
}
