//! Event plumbing between the transport and whatever presents it
//!
//! Provides:
//! - The fire-and-forget [`MessageSink`] interface the transport reports through
//! - Event types carried from the transport to subscribers
//! - A broadcast dispatcher that fans sink messages out to subscribers

use std::sync::Arc;
use tokio::sync::broadcast;

/// Human-readable notification target
///
/// `show` must never block the caller: the reader and writer tasks call it
/// from inside their loops.
pub trait MessageSink: Send + Sync {
    /// Hand a line of text to the sink
    fn show(&self, text: &str);
}

impl<F> MessageSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn show(&self, text: &str) {
        self(text)
    }
}

/// Shared handle to a sink
pub type SinkHandle = Arc<dyn MessageSink>;

/// Sink that only logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn show(&self, text: &str) {
        tracing::info!(target: "gcodelink::sink", "{}", text.trim_end());
    }
}

/// The two sinks a session reports to
#[derive(Clone)]
pub struct Sinks {
    /// Firmware output that the transport does not consume
    pub info: SinkHandle,
    /// Session notifications (state changes, errors, completion)
    pub status: SinkHandle,
}

impl Sinks {
    /// Build from two sinks
    pub fn new(info: SinkHandle, status: SinkHandle) -> Self {
        Self { info, status }
    }

    /// Log-only sinks
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink), Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

/// Session event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Informational line from the firmware
    Info(String),
    /// Session status notification
    Status(String),
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Info(text) => write!(f, "{}", text),
            SessionEvent::Status(text) => write!(f, "[status] {}", text),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for session events.
    tx: broadcast::Sender<SessionEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received it. Publishing with no
    /// subscribers is not an error for a fire-and-forget sink.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sinks that publish through this dispatcher
    pub fn sinks(&self) -> Sinks {
        Sinks::new(
            Arc::new(DispatchSink {
                dispatcher: self.clone(),
                kind: SinkKind::Info,
            }),
            Arc::new(DispatchSink {
                dispatcher: self.clone(),
                kind: SinkKind::Status,
            }),
        )
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, Copy)]
enum SinkKind {
    Info,
    Status,
}

/// Sink adapter that turns `show` calls into dispatcher events
struct DispatchSink {
    dispatcher: EventDispatcher,
    kind: SinkKind,
}

impl MessageSink for DispatchSink {
    fn show(&self, text: &str) {
        let text = text.to_string();
        let event = match self.kind {
            SinkKind::Info => SessionEvent::Info(text),
            SinkKind::Status => SessionEvent::Status(text),
        };
        self.dispatcher.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: SinkHandle = Arc::new(move |text: &str| captured.lock().push(text.to_string()));

        sink.show("echo:busy");
        sink.show("T:21.0 /0.0");

        assert_eq!(*seen.lock(), vec!["echo:busy", "T:21.0 /0.0"]);
    }

    #[test]
    fn test_dispatcher_without_subscribers() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.publish(SessionEvent::Status("idle".into())), 0);
    }

    #[tokio::test]
    async fn test_dispatch_sinks_publish_events() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();
        let sinks = dispatcher.sinks();

        sinks.info.show("echo:SD card ok");
        sinks.status.show("Printer ready");

        assert_eq!(
            rx.recv().await.ok(),
            Some(SessionEvent::Info("echo:SD card ok".into()))
        );
        assert_eq!(
            rx.recv().await.ok(),
            Some(SessionEvent::Status("Printer ready".into()))
        );
    }
}
