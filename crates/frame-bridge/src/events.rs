use serde::Serialize;
use serde_json::Value;

/// Which readiness signal the peer sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadySignal {
    Legacy,
    Modern,
}

/// Observable output of the bridge for collaborators such as the widget shell.
/// Serializes as `{ "event": "<name>", ... }` so a shell can forward it as is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Ready {
        signal: ReadySignal,
        methods: Vec<String>,
    },
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    /// Terminal: the prober gave up and waits for an explicit re-arm.
    Unresponsive {
        reason: String,
        attempts: u32,
        max_attempts: u32,
    },
    /// Peer lifecycle notification, re-emitted verbatim.
    Notification { kind: String, payload: Value },
}
