//! Forward lifecycle events
//!
//! Listeners and reverse forward clients report `Starting`, `Ready` and
//! `Error` over an unbounded mpsc channel. The receiver ends when the
//! forward stops.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ssh::SshError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Binding (or re-binding after a restart)
    Starting,
    /// Accepting connections; carries the bound port
    Ready { port: u16 },
    Error(SshError),
}

/// Receiving end of a forward's events
pub type ForwardEvents = mpsc::UnboundedReceiver<ForwardEvent>;

/// Sending side held by a running forward
#[derive(Debug, Clone)]
pub struct ForwardEventEmitter {
    tx: mpsc::UnboundedSender<ForwardEvent>,
    label: String,
}

impl ForwardEventEmitter {
    pub fn new(label: impl Into<String>) -> (Self, ForwardEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                label: label.into(),
            },
            rx,
        )
    }

    pub fn emit(&self, event: ForwardEvent) {
        if self.tx.send(event).is_err() {
            debug!("Forward {} event dropped, nobody listening", self.label);
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&ForwardEvent::Ready { port: 8080 }).unwrap();
        assert_eq!(json, r#"{"type":"ready","detail":{"port":8080}}"#);
        let json = serde_json::to_string(&ForwardEvent::Error(SshError::PortInUse(
            "127.0.0.1:80".into(),
        )))
        .unwrap();
        assert!(json.contains("Port already in use"));
    }

    #[tokio::test]
    async fn test_receiver_ends_with_emitter() {
        let (emitter, mut events) = ForwardEventEmitter::new("fwd");
        emitter.emit(ForwardEvent::Starting);
        drop(emitter);
        assert_eq!(events.recv().await, Some(ForwardEvent::Starting));
        assert_eq!(events.recv().await, None);
    }
}
