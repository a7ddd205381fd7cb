//! Emulation of the unified call API over the per-action legacy dialect.
//!
//! Each unified method maps to a handler. Most handlers post fire-and-forget
//! messages, so their success means "dispatched", not "completed". Handlers
//! that need a peer-side tab id resolve it through
//! [`LegacyContext::resolve_tab_id`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frame_channel::FrameHost;
use frame_proto::{Envelope, TabInfo, id_to_string, integral, legacy};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ANY_ORIGIN;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::PendingLedger;
use crate::tabs::TabCache;

/// Unified methods the legacy dialect can serve, in catalog order.
pub const CATALOG: [&str; 14] = [
    "createTab",
    "closeTab",
    "switchTab",
    "navigate",
    "reload",
    "goBack",
    "goForward",
    "stop",
    "getTabs",
    "getActiveTab",
    "evaluate",
    "closeAllTabs",
    "waitForTabCount",
    "waitForTabUrl",
];

const MIN_QUERY_TIMEOUT: Duration = Duration::from_millis(1);

/// Everything a legacy handler may touch.
#[derive(Clone)]
pub struct LegacyContext {
    host: Arc<dyn FrameHost>,
    ledger: PendingLedger,
    tabs: Arc<Mutex<TabCache>>,
    request_timeout: Duration,
    poll_interval: Duration,
}

impl LegacyContext {
    pub fn new(
        host: Arc<dyn FrameHost>,
        ledger: PendingLedger,
        tabs: Arc<Mutex<TabCache>>,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            host,
            ledger,
            tabs,
            request_timeout,
            poll_interval,
        }
    }

    /// Posts an untracked message.
    pub fn post(&self, envelope: Envelope) -> BridgeResult<()> {
        let kind = envelope.kind.clone();
        let tab_id = envelope.tab_id.clone();
        self.host.post_message(envelope.to_value(), ANY_ORIGIN)?;
        trace!(target = "frame_bridge::legacy", kind = %kind, tab_id = ?tab_id, "legacy message posted");
        Ok(())
    }

    pub async fn query(&self, kind: &str, timeout: Duration) -> BridgeResult<Value> {
        self.ledger.request(Envelope::new(kind), timeout).await
    }

    pub async fn list_tabs(&self) -> Vec<TabInfo> {
        self.list_tabs_within(self.request_timeout).await
    }

    /// Direct `getTabs` query, falling back to the local cache when the peer
    /// does not answer. Whatever the peer returns becomes the new cache.
    async fn list_tabs_within(&self, timeout: Duration) -> Vec<TabInfo> {
        let listed = match self.query(legacy::GET_TABS, timeout.max(MIN_QUERY_TIMEOUT)).await {
            Ok(data) => {
                let parsed = parse_tab_list(&data);
                if parsed.is_none() {
                    debug!(target = "frame_bridge::legacy", "getTabs reply was not a usable tab list; using cache");
                }
                parsed
            }
            Err(err) => {
                debug!(target = "frame_bridge::legacy", error = %err, "getTabs failed; using cache");
                None
            }
        };
        let mut cache = self.tabs.lock();
        if let Some(tabs) = listed {
            cache.replace_all(tabs);
        }
        cache.snapshot()
    }

    async fn active_tab_id(&self) -> Result<String, String> {
        match self.query(legacy::GET_ACTIVE_TAB, self.request_timeout).await {
            Ok(data) => tab_id_of(&data).ok_or_else(|| "active tab reply carried no id".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Peer-side id for the tab at `index` (negative counts from the end) or,
    /// without an index, for the active tab.
    pub async fn resolve_tab_id(
        &self,
        method: &str,
        index: Option<i64>,
        original_error: Option<&str>,
    ) -> BridgeResult<String> {
        if let Some(index) = index {
            let tabs = self.list_tabs().await;
            return match wrap_index(index, tabs.len()) {
                Some(position) => Ok(tabs[position].id.clone()),
                None => Err(BridgeError::TabUnresolved {
                    method: method.to_string(),
                    detail: with_context(
                        format!("no tab at index {index} ({} open)", tabs.len()),
                        original_error,
                    ),
                }),
            };
        }

        let active_error = match self.active_tab_id().await {
            Ok(id) => return Ok(id),
            Err(err) => err,
        };
        let tabs = self.list_tabs().await;
        if let Some(tab) = tabs
            .iter()
            .find(|tab| tab.extra.get("active").and_then(Value::as_bool) == Some(true))
        {
            return Ok(tab.id.clone());
        }
        Err(BridgeError::TabUnresolved {
            method: method.to_string(),
            detail: with_context(
                format!("active tab query failed ({active_error}) and no listed tab is active"),
                original_error,
            ),
        })
    }

    fn wait_bounds(&self, options: &Map<String, Value>) -> (Duration, Duration) {
        let timeout = options
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout);
        let poll = options
            .get("pollMs")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.poll_interval);
        (timeout, poll)
    }
}

/// Uniform contract for a legacy method handler.
#[async_trait]
pub trait LegacyHandler: Send + Sync {
    async fn handle(
        &self,
        cx: LegacyContext,
        args: Vec<Value>,
        original_error: Option<String>,
    ) -> BridgeResult<Value>;
}

#[async_trait]
impl<F, Fut> LegacyHandler for F
where
    F: Fn(LegacyContext, Vec<Value>, Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
{
    async fn handle(
        &self,
        cx: LegacyContext,
        args: Vec<Value>,
        original_error: Option<String>,
    ) -> BridgeResult<Value> {
        (self)(cx, args, original_error).await
    }
}

/// Method-name to handler table.
pub struct LegacyAdapter {
    handlers: HashMap<String, Arc<dyn LegacyHandler>>,
    order: Vec<String>,
}

impl Default for LegacyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyAdapter {
    pub fn new() -> Self {
        let mut adapter = Self {
            handlers: HashMap::new(),
            order: Vec::new(),
        };
        adapter.register("createTab", create_tab);
        adapter.register("closeTab", indexed_action("closeTab", legacy::CLOSE_TAB));
        adapter.register("switchTab", switch_tab);
        adapter.register("navigate", navigate);
        adapter.register("reload", indexed_action("reload", legacy::RELOAD));
        adapter.register("goBack", indexed_action("goBack", legacy::GO_BACK));
        adapter.register("goForward", indexed_action("goForward", legacy::GO_FORWARD));
        adapter.register("stop", indexed_action("stop", legacy::STOP));
        adapter.register("getTabs", get_tabs);
        adapter.register("getActiveTab", get_active_tab);
        adapter.register("evaluate", evaluate);
        adapter.register("closeAllTabs", close_all_tabs);
        adapter.register("waitForTabCount", wait_for_tab_count);
        adapter.register("waitForTabUrl", wait_for_tab_url);
        adapter
    }

    /// Adds or replaces the handler for `method`.
    pub fn register<H>(&mut self, method: impl Into<String>, handler: H)
    where
        H: LegacyHandler + 'static,
    {
        let method = method.into();
        if !self.handlers.contains_key(&method) {
            self.order.push(method.clone());
        }
        self.handlers.insert(method, Arc::new(handler));
    }

    pub fn supports(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        self.order.clone()
    }

    pub async fn call(
        &self,
        cx: &LegacyContext,
        method: &str,
        args: Vec<Value>,
        original_error: Option<String>,
    ) -> BridgeResult<Value> {
        let Some(handler) = self.handlers.get(method).cloned() else {
            return Err(BridgeError::unsupported(
                method,
                with_context("no legacy mapping".to_string(), original_error.as_deref()),
            ));
        };
        debug!(target = "frame_bridge::legacy", method = %method, "dispatching via legacy transport");
        handler.handle(cx.clone(), args, original_error).await
    }
}

async fn create_tab(cx: LegacyContext, args: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    let mut data = Map::new();
    if let Some(url) = opt_str(&args, 0) {
        data.insert("url".into(), Value::String(url));
    }
    cx.post(Envelope::new(legacy::CREATE_TAB).with_data(Value::Object(data)))?;
    Ok(Value::Bool(true))
}

/// Handler posting `kind` to the tab named by the optional first argument.
fn indexed_action(method: &'static str, kind: &'static str) -> impl LegacyHandler {
    move |cx: LegacyContext, args: Vec<Value>, original: Option<String>| async move {
        let index = opt_index(&args, 0, method)?;
        tab_action(&cx, method, kind, index, original.as_deref()).await
    }
}

async fn switch_tab(cx: LegacyContext, args: Vec<Value>, original: Option<String>) -> BridgeResult<Value> {
    let index = opt_index(&args, 0, "switchTab")?
        .ok_or_else(|| invalid("switchTab", "a tab index is required"))?;
    tab_action(&cx, "switchTab", legacy::SWITCH_TAB, Some(index), original.as_deref()).await
}

async fn navigate(cx: LegacyContext, args: Vec<Value>, original: Option<String>) -> BridgeResult<Value> {
    let url = opt_str(&args, 0).ok_or_else(|| invalid("navigate", "a url is required"))?;
    let index = opt_index(&args, 1, "navigate")?;
    let tab_id = cx
        .resolve_tab_id("navigate", index, original.as_deref())
        .await?;
    cx.post(
        Envelope::new(legacy::NAVIGATE)
            .with_tab(tab_id)
            .with_data(json!({ "url": url })),
    )?;
    Ok(Value::Bool(true))
}

async fn get_tabs(cx: LegacyContext, _: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    let tabs = cx.list_tabs().await;
    Ok(Value::Array(tabs.iter().map(TabInfo::to_value).collect()))
}

async fn get_active_tab(cx: LegacyContext, _: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    cx.query(legacy::GET_ACTIVE_TAB, cx.request_timeout).await
}

async fn evaluate(cx: LegacyContext, args: Vec<Value>, original: Option<String>) -> BridgeResult<Value> {
    let expression =
        opt_str(&args, 0).ok_or_else(|| invalid("evaluate", "an expression is required"))?;
    let Some(kind) = evaluate_equivalent(&expression) else {
        return Err(BridgeError::unsupported(
            "evaluate",
            with_context(
                format!(
                    "only history.back(), history.forward() and window.stop() can run without the modern transport (got `{expression}`)"
                ),
                original.as_deref(),
            ),
        ));
    };
    let index = opt_index(&args, 1, "evaluate")?;
    tab_action(&cx, "evaluate", kind, index, original.as_deref()).await
}

async fn close_all_tabs(cx: LegacyContext, args: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    let keep = match args.first() {
        None | Some(Value::Null) => 1,
        Some(Value::Object(options)) => match options.get("keep") {
            None | Some(Value::Null) => 1,
            Some(value) => integral(value)
                .ok_or_else(|| invalid("closeAllTabs", "keep must be an integer"))?,
        },
        Some(value) => {
            integral(value).ok_or_else(|| invalid("closeAllTabs", "keep must be an integer"))?
        }
    };
    if keep < 0 {
        return Err(invalid("closeAllTabs", "keep must not be negative"));
    }
    let keep = keep as usize;

    let tabs = cx.list_tabs().await;
    if tabs.len() <= keep {
        return Ok(json!(tabs.len()));
    }
    // From the end so earlier positions stay valid while closes are in flight.
    for tab in tabs[keep..].iter().rev() {
        cx.post(Envelope::new(legacy::CLOSE_TAB).with_tab(tab.id.clone()))?;
    }
    debug!(
        target = "frame_bridge::legacy",
        closed = tabs.len() - keep,
        keep,
        "closeAllTabs dispatched"
    );
    Ok(json!(keep))
}

async fn wait_for_tab_count(cx: LegacyContext, args: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    let expected = opt_index(&args, 0, "waitForTabCount")?
        .filter(|count| *count >= 0)
        .ok_or_else(|| invalid("waitForTabCount", "expected count must be a non-negative integer"))?
        as usize;
    let (timeout, poll) = cx.wait_bounds(&options(&args, 1));
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        let seen = cx.list_tabs_within(remaining.min(cx.request_timeout)).await.len();
        if seen == expected {
            return Ok(json!(seen));
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(BridgeError::timeout(
                format!("waitForTabCount(expected {expected}, last saw {seen})"),
                elapsed.as_millis() as u64,
            ));
        }
        tokio::time::sleep(poll.min(timeout - elapsed)).await;
    }
}

async fn wait_for_tab_url(cx: LegacyContext, args: Vec<Value>, _: Option<String>) -> BridgeResult<Value> {
    let requested = opt_index(&args, 0, "waitForTabUrl")?.unwrap_or(0);
    let options = options(&args, 1);
    let (timeout, poll) = cx.wait_bounds(&options);
    let expect = options
        .get("expectIncludes")
        .and_then(Value::as_str)
        .filter(|needle| !needle.is_empty())
        .map(str::to_owned);
    let allow_blank = options
        .get("allowBlank")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        let tabs = cx.list_tabs_within(remaining.min(cx.request_timeout)).await;
        let mut last_url = None;
        if let Some(position) = clamp_index(requested, tabs.len()) {
            let tab = &tabs[position];
            let blank_ok = allow_blank || !tab.is_blank();
            let included = expect
                .as_deref()
                .map_or(true, |needle| tab.url.contains(needle));
            if blank_ok && included {
                return Ok(json!({ "url": tab.url, "index": position }));
            }
            last_url = Some(tab.url.clone());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            let last = last_url.unwrap_or_else(|| "<no tabs>".to_string());
            return Err(BridgeError::timeout(
                format!("waitForTabUrl(index {requested}, last url {last})"),
                elapsed.as_millis() as u64,
            ));
        }
        tokio::time::sleep(poll.min(timeout - elapsed)).await;
    }
}

async fn tab_action(
    cx: &LegacyContext,
    method: &str,
    kind: &str,
    index: Option<i64>,
    original_error: Option<&str>,
) -> BridgeResult<Value> {
    let tab_id = cx.resolve_tab_id(method, index, original_error).await?;
    cx.post(Envelope::new(kind).with_tab(tab_id))?;
    Ok(Value::Bool(true))
}

/// Legacy action for a whitelisted script expression.
fn evaluate_equivalent(expression: &str) -> Option<&'static str> {
    if expression.contains("history.back") {
        Some(legacy::GO_BACK)
    } else if expression.contains("history.forward") {
        Some(legacy::GO_FORWARD)
    } else if expression.contains("window.stop") || expression.contains("stop()") {
        Some(legacy::STOP)
    } else {
        None
    }
}

/// All-or-nothing: one unusable entry would shift every later position.
fn parse_tab_list(data: &Value) -> Option<Vec<TabInfo>> {
    let items = data
        .as_array()
        .or_else(|| data.get("tabs").and_then(Value::as_array))?;
    items.iter().map(TabInfo::from_value).collect()
}

fn tab_id_of(data: &Value) -> Option<String> {
    data.get("id")
        .or_else(|| data.get("tab").and_then(|tab| tab.get("id")))
        .or_else(|| data.get("tabId"))
        .and_then(id_to_string)
}

/// Position for `index` in a list of `len`, negative counting from the end.
fn wrap_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let position = if index < 0 { len + index } else { index };
    (0..len).contains(&position).then_some(position as usize)
}

/// Like [`wrap_index`] but pins out-of-range requests to the nearest end.
fn clamp_index(index: i64, len: usize) -> Option<usize> {
    let last = len.checked_sub(1)?;
    Some(wrap_index(index, len).unwrap_or(if index < 0 { 0 } else { last }))
}

fn with_context(detail: String, original_error: Option<&str>) -> String {
    match original_error {
        Some(original) => format!("{detail}; modern call failed first: {original}"),
        None => detail,
    }
}

fn invalid(method: &str, detail: &str) -> BridgeError {
    BridgeError::InvalidArgument(format!("{method}: {detail}"))
}

fn opt_index(args: &[Value], position: usize, method: &str) -> BridgeResult<Option<i64>> {
    match args.get(position) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => integral(value)
            .map(Some)
            .ok_or_else(|| invalid(method, "tab index must be an integer")),
    }
}

fn opt_str(args: &[Value], position: usize) -> Option<String> {
    args.get(position)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

fn options(args: &[Value], position: usize) -> Map<String, Value> {
    args.get(position)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
