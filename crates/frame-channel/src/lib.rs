use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Opaque identity of a window taking part in cross-document messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// Inbound message as delivered by the host's message listener.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub source: Option<WindowId>,
    pub origin: String,
    pub data: Value,
}

/// Outbound message as handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub target_origin: String,
    pub payload: Value,
}

impl PostedMessage {
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameLifecycle {
    Reloaded,
    Navigated(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer window unavailable")]
    Unavailable,
    #[error("frame host error: {0}")]
    Host(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// What the embedding host must provide for the bridge to reach its peer.
pub trait FrameHost: Send + Sync {
    /// Identity of the embedded peer window, if it exists yet.
    fn peer_window(&self) -> Option<WindowId>;
    fn post_message(&self, payload: Value, target_origin: &str) -> ChannelResult<()>;
    /// Reloads the peer in place. Completion is reported through the host's load event.
    fn reload(&self) -> ChannelResult<()>;
    fn navigate(&self, src: &str) -> ChannelResult<()>;
}

#[derive(Debug, Default)]
struct LocalState {
    window: Option<WindowId>,
    src: Option<String>,
    reloads: usize,
    sent: Vec<PostedMessage>,
}

/// In-memory frame host for tests and embedders without a real frame yet.
#[derive(Debug)]
pub struct LocalFrame {
    state: Mutex<LocalState>,
    outbound: broadcast::Sender<PostedMessage>,
    lifecycle: broadcast::Sender<FrameLifecycle>,
}

impl Default for LocalFrame {
    fn default() -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            outbound: broadcast::channel(256).0,
            lifecycle: broadcast::channel(64).0,
        }
    }
}

impl LocalFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: WindowId) -> Self {
        let frame = Self::default();
        frame.attach(window);
        frame
    }

    pub fn attach(&self, window: WindowId) {
        self.state.lock().window = Some(window);
    }

    pub fn detach(&self) {
        self.state.lock().window = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PostedMessage> {
        self.outbound.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<FrameLifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn sent(&self) -> Vec<PostedMessage> {
        self.state.lock().sent.clone()
    }

    /// Payloads of every posted message with the given `type`.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|msg| msg.kind() == Some(kind))
            .map(|msg| msg.payload.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn reload_count(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn source(&self) -> Option<String> {
        self.state.lock().src.clone()
    }

    /// Builds an inbound event that appears to come from the attached peer window.
    pub fn message_from_peer(&self, origin: &str, data: Value) -> MessageEvent {
        MessageEvent {
            source: self.state.lock().window,
            origin: origin.to_string(),
            data,
        }
    }
}

impl FrameHost for LocalFrame {
    fn peer_window(&self) -> Option<WindowId> {
        self.state.lock().window
    }

    fn post_message(&self, payload: Value, target_origin: &str) -> ChannelResult<()> {
        let message = PostedMessage {
            target_origin: target_origin.to_string(),
            payload,
        };
        {
            let mut guard = self.state.lock();
            if guard.window.is_none() {
                return Err(ChannelError::Unavailable);
            }
            guard.sent.push(message.clone());
        }
        // No subscribers is fine; the log above still records the send.
        let _ = self.outbound.send(message);
        Ok(())
    }

    fn reload(&self) -> ChannelResult<()> {
        self.state.lock().reloads += 1;
        let _ = self.lifecycle.send(FrameLifecycle::Reloaded);
        Ok(())
    }

    fn navigate(&self, src: &str) -> ChannelResult<()> {
        self.state.lock().src = Some(src.to_string());
        let _ = self
            .lifecycle
            .send(FrameLifecycle::Navigated(src.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_frame_round_trip() {
        let frame = LocalFrame::with_window(WindowId(1));
        let mut sub = frame.subscribe();
        frame
            .post_message(json!({ "type": "init" }), "*")
            .expect("post ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.target_origin, "*");
        assert_eq!(msg.kind(), Some("init"));
        assert_eq!(frame.sent_of_kind("init").len(), 1);
    }

    #[test]
    fn post_without_window_is_unavailable() {
        let frame = LocalFrame::new();
        let err = frame.post_message(json!({ "type": "init" }), "*").unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable));
        assert!(frame.sent().is_empty());
    }

    #[tokio::test]
    async fn reload_and_navigate_are_observable() {
        let frame = LocalFrame::with_window(WindowId(3));
        let mut lifecycle = frame.subscribe_lifecycle();
        frame.reload().expect("reload");
        frame.navigate("https://peer.test/app").expect("navigate");
        assert_eq!(lifecycle.recv().await.expect("event"), FrameLifecycle::Reloaded);
        assert_eq!(
            lifecycle.recv().await.expect("event"),
            FrameLifecycle::Navigated("https://peer.test/app".into())
        );
        assert_eq!(frame.reload_count(), 1);
        assert_eq!(frame.source().as_deref(), Some("https://peer.test/app"));
    }

    #[test]
    fn message_from_peer_uses_attached_window() {
        let frame = LocalFrame::with_window(WindowId(9));
        let event = frame.message_from_peer("https://peer.test", json!({ "type": "ready" }));
        assert_eq!(event.source, Some(WindowId(9)));
        frame.detach();
        assert_eq!(frame.message_from_peer("x", json!(null)).source, None);
    }
}
