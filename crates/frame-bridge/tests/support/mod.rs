#![allow(dead_code)]

use std::sync::Arc;

use frame_bridge::{BridgeConfig, FrameBridge, LocalFrame, WindowId};
use frame_channel::FrameLifecycle;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const ORIGIN: &str = "https://peer.test";
pub const SOURCE: &str = "https://peer.test/session/42";

/// How the scripted peer behaves.
#[derive(Clone, Default)]
pub struct PeerScript {
    /// Readiness signal sent in answer to every probe.
    pub ready: Option<&'static str>,
    /// Answers `bridge:call` envelopes.
    pub modern: bool,
    /// Answers legacy `getTabs` / `getActiveTab` queries.
    pub answer_queries: bool,
    /// Modern methods the peer rejects with the given error text.
    pub reject: Vec<(&'static str, &'static str)>,
    /// Modern methods the peer never answers.
    pub ignore: Vec<&'static str>,
}

impl PeerScript {
    pub fn legacy() -> Self {
        Self {
            ready: Some("ready"),
            answer_queries: true,
            ..Self::default()
        }
    }

    pub fn modern() -> Self {
        Self {
            ready: Some("bridge:ready"),
            modern: true,
            answer_queries: true,
            ..Self::default()
        }
    }
}

/// Remote side of the frame, driven by what the bridge posts.
pub struct FakePeer {
    tabs: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub fn spawn(frame: &Arc<LocalFrame>, bridge: &FrameBridge, script: PeerScript, tabs: Vec<Value>) -> Self {
        let tabs = Arc::new(Mutex::new(tabs));
        let mut outbound = frame.subscribe();
        let mut lifecycle = frame.subscribe_lifecycle();
        let task = {
            let frame = frame.clone();
            let bridge = bridge.clone();
            let tabs = tabs.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = outbound.recv() => match msg {
                            Ok(msg) => respond(&frame, &bridge, &script, &tabs, &msg.payload),
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        },
                        event = lifecycle.recv() => match event {
                            Ok(FrameLifecycle::Reloaded) | Ok(FrameLifecycle::Navigated(_)) => {
                                bridge.handle_peer_load();
                            }
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        };
        Self { tabs, task }
    }

    pub fn tabs(&self) -> Arc<Mutex<Vec<Value>>> {
        self.tabs.clone()
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(
    frame: &LocalFrame,
    bridge: &FrameBridge,
    script: &PeerScript,
    tabs: &Mutex<Vec<Value>>,
    payload: &Value,
) {
    let send = |data: Value| {
        bridge.handle_message(&frame.message_from_peer(ORIGIN, data));
    };
    let request_id = payload.get("requestId").cloned().unwrap_or(Value::Null);
    let listing = || Value::Array(tabs.lock().clone());
    let active = || {
        let tabs = tabs.lock();
        let found = tabs
            .iter()
            .find(|tab| tab["active"] == json!(true))
            .or_else(|| tabs.first())
            .cloned();
        found
    };

    match payload["type"].as_str().unwrap_or_default() {
        "init" => match script.ready {
            Some("bridge:ready") => send(json!({ "type": "bridge:ready", "methods": ["getTabs", "evaluate"] })),
            Some(kind) => send(json!({ "type": kind })),
            None => {}
        },
        "bridge:call" if script.modern => {
            let method = payload["data"]["method"].as_str().unwrap_or_default();
            if script.ignore.iter().any(|name| *name == method) {
                return;
            }
            if let Some((_, error)) = script.reject.iter().find(|(name, _)| *name == method) {
                send(json!({ "requestId": request_id, "error": error }));
                return;
            }
            let data = match method {
                "getTabs" => listing(),
                "getActiveTab" => active().unwrap_or(Value::Null),
                _ => json!(true),
            };
            send(json!({ "requestId": request_id, "data": data }));
        }
        "getTabs" if script.answer_queries => {
            send(json!({ "requestId": request_id, "data": listing() }));
        }
        "getActiveTab" if script.answer_queries => match active() {
            Some(tab) => send(json!({ "requestId": request_id, "data": tab })),
            None => send(json!({ "requestId": request_id, "error": "no tabs open" })),
        },
        "closeTab" => {
            let id = payload["tabId"].clone();
            tabs.lock().retain(|tab| tab["id"] != id);
        }
        _ => {}
    }
}

pub fn tab(id: &str, url: &str) -> Value {
    json!({ "id": id, "url": url, "title": id })
}

pub fn config() -> BridgeConfig {
    BridgeConfig {
        source: Some(SOURCE.to_string()),
        ..BridgeConfig::default()
    }
}

pub fn bridge_with(config: BridgeConfig) -> (Arc<LocalFrame>, FrameBridge) {
    let frame = Arc::new(LocalFrame::with_window(WindowId(11)));
    let bridge = FrameBridge::new(frame.clone(), config);
    (frame, bridge)
}
