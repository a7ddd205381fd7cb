//! Wire vocabulary shared between the host-side bridge and an embedded peer.
//! Keeping it in a dedicated crate lets peer implementations depend on the
//! message shapes without pulling in the bridge runtime.
//!
//! Two dialects share one channel:
//! - the modern dialect sends a single generic call envelope and expects a
//!   correlated reply;
//! - the legacy dialect sends one message type per action, most of them
//!   fire-and-forget, plus a couple of correlated queries.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Liveness probe sent until the peer signals readiness.
pub const PROBE_TYPE: &str = "init";
/// Generic call envelope understood by modern peers.
pub const MODERN_CALL_TYPE: &str = "bridge:call";
/// Readiness signal from a modern peer, carrying its advertised methods.
pub const MODERN_READY_TYPE: &str = "bridge:ready";
/// Readiness signal from a legacy peer (no payload).
pub const LEGACY_READY_TYPE: &str = "ready";

/// Per-action message types of the legacy dialect.
pub mod legacy {
    pub const CREATE_TAB: &str = "createTab";
    pub const CLOSE_TAB: &str = "closeTab";
    pub const SWITCH_TAB: &str = "switchTab";
    pub const NAVIGATE: &str = "navigate";
    pub const RELOAD: &str = "reload";
    pub const GO_BACK: &str = "goBack";
    pub const GO_FORWARD: &str = "goForward";
    pub const STOP: &str = "stop";
    pub const GET_TABS: &str = "getTabs";
    pub const GET_ACTIVE_TAB: &str = "getActiveTab";
}

/// Unsolicited lifecycle notifications emitted by the peer.
pub mod notify {
    pub const TAB_CREATED: &str = "tabCreated";
    pub const TAB_UPDATED: &str = "tabUpdated";
    pub const TAB_CLOSED: &str = "tabClosed";
    pub const ACTIVE_TAB_CHANGED: &str = "activeTabChanged";
    pub const LOAD_START: &str = "loadStart";
    pub const LOAD_STOP: &str = "loadStop";
    pub const NAVIGATED: &str = "navigated";
    pub const POLICY_DENIED: &str = "policyDenied";

    pub const ALL: [&str; 8] = [
        TAB_CREATED,
        TAB_UPDATED,
        TAB_CLOSED,
        ACTIVE_TAB_CHANGED,
        LOAD_START,
        LOAD_STOP,
        NAVIGATED,
        POLICY_DENIED,
    ];

    pub fn is_notification(kind: &str) -> bool {
        ALL.contains(&kind)
    }
}

/// Outbound message. `request_id` is only present when a reply is expected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            tab_id: None,
            data: Value::Null,
        }
    }

    pub fn probe() -> Self {
        Self::new(PROBE_TYPE)
    }

    /// Modern dispatch envelope; the request id is assigned when sent.
    pub fn call(kind: impl Into<String>, method: &str, args: Vec<Value>) -> Self {
        Self::new(kind).with_data(serde_json::json!({
            "method": method,
            "args": args,
        }))
    }

    pub fn with_tab(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parsed view of an inbound message. Unknown fields stay reachable via `raw`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: String,
    pub request_id: Option<String>,
    pub error: Option<String>,
    pub data: Value,
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    request_id: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    data: Value,
}

impl InboundMessage {
    /// Returns `None` for payloads that are neither typed nor correlated.
    pub fn parse(value: &Value) -> Option<Self> {
        let raw: RawInbound = serde_json::from_value(value.clone()).ok()?;
        let request_id = raw.request_id.as_ref().and_then(id_to_string);
        let kind = raw.kind.unwrap_or_default();
        if kind.is_empty() && request_id.is_none() {
            return None;
        }
        let error = match raw.error {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text),
            Some(Value::Object(obj)) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            ),
            Some(other) => Some(other.to_string()),
        };
        Some(Self {
            kind,
            request_id,
            error,
            data: raw.data,
            raw: value.clone(),
        })
    }

    /// Method list advertised by a modern-ready signal.
    pub fn advertised_methods(&self) -> Vec<String> {
        self.raw
            .get("methods")
            .or_else(|| self.data.get("methods"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tab object carried by a lifecycle notification.
    pub fn tab_payload(&self) -> Option<&Map<String, Value>> {
        self.data
            .get("tab")
            .and_then(Value::as_object)
            .or_else(|| self.data.as_object())
    }

    /// Tab identifier from the tab object, `data.tabId` or the top-level `tabId`.
    pub fn tab_id(&self) -> Option<String> {
        self.tab_payload()
            .and_then(|tab| tab.get("id"))
            .and_then(id_to_string)
            .or_else(|| self.data.get("tabId").and_then(id_to_string))
            .or_else(|| self.raw.get("tabId").and_then(id_to_string))
    }

    /// Explicit position hint, only when it is an integer.
    pub fn index_hint(&self) -> Option<i64> {
        self.data
            .get("index")
            .or_else(|| self.tab_payload().and_then(|tab| tab.get("index")))
            .and_then(integral)
    }
}

/// Remote tab metadata mirrored by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_index")]
    pub index: usize,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(
        rename = "faviconDataURI",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub favicon_data_uri: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TabInfo {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn from_map(map: &Map<String, Value>) -> Option<Self> {
        Self::from_value(&Value::Object(map.clone()))
    }

    /// Merges remote-supplied fields. `id` and `index` are never taken from the
    /// patch; callers decide how position changes apply.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "id" | "index" => {}
                "url" => {
                    if let Some(url) = value.as_str() {
                        self.url = url.to_owned();
                    }
                }
                "title" => {
                    if let Some(title) = value.as_str() {
                        self.title = title.to_owned();
                    }
                }
                "faviconDataURI" => {
                    self.favicon_data_uri = value.as_str().map(str::to_owned);
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }

    pub fn is_blank(&self) -> bool {
        let url = self.url.trim();
        url.is_empty() || url == "about:blank"
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Identifiers may arrive as strings or numbers; both map to the string form.
pub fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

/// Integer view of a JSON number, rejecting fractional values.
pub fn integral(value: &Value) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    value
        .as_f64()
        .filter(|float| float.fract() == 0.0 && float.is_finite())
        .map(|float| float as i64)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_to_string(&value).ok_or_else(|| de::Error::custom("tab id must be a string or number"))
}

/// Positions are recomputed locally, so an odd remote index is not an error.
fn lenient_index<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(integral(&value)
        .and_then(|index| usize::try_from(index).ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn probe_serializes_without_optional_fields() {
        assert_eq!(Envelope::probe().to_value(), json!({ "type": "init" }));
    }

    #[test]
    fn call_envelope_carries_method_and_args() {
        let envelope = Envelope::call(MODERN_CALL_TYPE, "navigate", vec![json!("https://a.test")])
            .with_request_id("1-1700000000000");
        assert_eq!(
            envelope.to_value(),
            json!({
                "type": "bridge:call",
                "requestId": "1-1700000000000",
                "data": { "method": "navigate", "args": ["https://a.test"] }
            })
        );
    }

    #[test]
    fn parses_rejection_with_numeric_request_id() {
        let msg = InboundMessage::parse(&json!({ "requestId": 7, "error": "nope" }))
            .expect("correlated message");
        assert_eq!(msg.request_id.as_deref(), Some("7"));
        assert_eq!(msg.error.as_deref(), Some("nope"));
    }

    #[test]
    fn ignores_untyped_uncorrelated_payloads() {
        assert!(InboundMessage::parse(&json!({ "data": 1 })).is_none());
        assert!(InboundMessage::parse(&json!("hello")).is_none());
    }

    #[test]
    fn reads_tab_from_nested_or_flat_payload() {
        let nested = InboundMessage::parse(&json!({
            "type": "tabCreated",
            "data": { "tab": { "id": "t1", "url": "https://a.test" }, "index": 2 }
        }))
        .expect("parsed");
        assert_eq!(nested.tab_id().as_deref(), Some("t1"));
        assert_eq!(nested.index_hint(), Some(2));

        let flat = InboundMessage::parse(&json!({ "type": "tabClosed", "tabId": 9 })).expect("parsed");
        assert_eq!(flat.tab_id().as_deref(), Some("9"));
        assert_eq!(flat.index_hint(), None);
    }

    #[test]
    fn fractional_index_is_not_a_hint() {
        let msg = InboundMessage::parse(&json!({
            "type": "tabCreated",
            "data": { "id": "t1", "index": 1.5 }
        }))
        .expect("parsed");
        assert_eq!(msg.index_hint(), None);
    }

    #[test]
    fn merge_keeps_identity_and_collects_extra_fields() {
        let mut tab = TabInfo::from_value(&json!({ "id": "t1", "index": 3, "url": "about:blank" }))
            .expect("tab");
        let patch = json!({ "id": "other", "index": 0, "url": "https://b.test", "loading": true });
        tab.merge(patch.as_object().expect("object"));
        assert_eq!(tab.id, "t1");
        assert_eq!(tab.index, 3);
        assert_eq!(tab.url, "https://b.test");
        assert_eq!(tab.extra.get("loading"), Some(&json!(true)));
        assert!(!tab.is_blank());
    }

    #[test]
    fn odd_remote_index_does_not_reject_tab() {
        let tab = TabInfo::from_value(&json!({ "id": 12, "index": -1 })).expect("tab");
        assert_eq!(tab.id, "12");
        assert_eq!(tab.index, 0);
        assert!(tab.is_blank());
    }
}
