use std::sync::Arc;
use std::time::Duration;

use frame_channel::{FrameHost, MessageEvent};
use frame_proto::{InboundMessage, LEGACY_READY_TYPE, MODERN_READY_TYPE, TabInfo, notify};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, InvalidationReason};
use crate::events::{BridgeEvent, ReadySignal};
use crate::ledger::PendingLedger;
use crate::legacy::{LegacyAdapter, LegacyContext};
use crate::liveness::{LivenessProber, LivenessState, RetryState};
use crate::origin::OriginPolicy;
use crate::tabs::TabCache;
use crate::transport::{ModernDispatcher, TransportMode, TransportResolver};

const EVENT_CAPACITY: usize = 256;

struct BridgeInner {
    host: Arc<dyn FrameHost>,
    config: BridgeConfig,
    policy: Mutex<OriginPolicy>,
    source: Mutex<Option<String>>,
    ledger: PendingLedger,
    prober: LivenessProber,
    resolver: TransportResolver,
    dispatcher: ModernDispatcher,
    legacy: LegacyAdapter,
    tabs: Arc<Mutex<TabCache>>,
    advertised: Mutex<Vec<String>>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Session object for one embedded peer.
///
/// The host forwards the frame's `load` event to [`FrameBridge::handle_peer_load`]
/// and every inbound message to [`FrameBridge::handle_message`]; callers use
/// [`FrameBridge::call`]. Must be driven from within a Tokio runtime.
#[derive(Clone)]
pub struct FrameBridge {
    inner: Arc<BridgeInner>,
}

impl FrameBridge {
    pub fn new(host: Arc<dyn FrameHost>, config: BridgeConfig) -> Self {
        Self::with_legacy_adapter(host, config, LegacyAdapter::new())
    }

    /// Uses a caller-supplied legacy table, e.g. one with extra handlers registered.
    pub fn with_legacy_adapter(
        host: Arc<dyn FrameHost>,
        config: BridgeConfig,
        legacy: LegacyAdapter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ledger = PendingLedger::new(host.clone());
        let prober = LivenessProber::new(host.clone(), ledger.clone(), events.clone(), &config);
        let policy = OriginPolicy::resolve(config.allowed_origin.as_deref(), config.source.as_deref());
        debug!(target = "frame_bridge::bridge", policy = ?policy, "bridge created");
        Self {
            inner: Arc::new(BridgeInner {
                dispatcher: ModernDispatcher::new(ledger.clone(), config.dispatch_type.clone()),
                resolver: TransportResolver::new(config.transport_probe_timeout),
                policy: Mutex::new(policy),
                source: Mutex::new(config.source.clone()),
                tabs: Arc::new(Mutex::new(TabCache::new())),
                advertised: Mutex::new(Vec::new()),
                host,
                config,
                ledger,
                prober,
                legacy,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.inner.resolver.mode()
    }

    pub fn liveness_state(&self) -> LivenessState {
        self.inner.prober.state()
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.prober.retry_state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.prober.is_ready()
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        self.inner.policy.lock().clone()
    }

    pub fn source(&self) -> Option<String> {
        self.inner.source.lock().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.ledger.len()
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.inner.tabs.lock().snapshot()
    }

    /// Advertised modern methods if the peer sent any, else the legacy catalog.
    pub fn list_methods(&self) -> Vec<String> {
        let advertised = self.inner.advertised.lock();
        if advertised.is_empty() {
            self.inner.legacy.methods()
        } else {
            advertised.clone()
        }
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> BridgeResult<()> {
        self.inner.prober.wait_ready(timeout).await
    }

    /// The peer frame finished (re)loading: a new session starts.
    pub fn handle_peer_load(&self) {
        let cancelled = self.invalidate_session(InvalidationReason::Refreshed);
        info!(target = "frame_bridge::bridge", cancelled, "peer loaded; new session");
        self.inner.prober.begin_session();
    }

    /// Routes one inbound message. Returns `false` when it was dropped as
    /// untrusted or malformed.
    pub fn handle_message(&self, event: &MessageEvent) -> bool {
        let peer = self.inner.host.peer_window();
        if !self
            .inner
            .policy
            .lock()
            .is_trusted(peer, event.source, &event.origin)
        {
            trace!(
                target = "frame_bridge::bridge",
                origin = %event.origin,
                source = ?event.source,
                "dropping untrusted message"
            );
            return false;
        }
        let Some(message) = InboundMessage::parse(&event.data) else {
            trace!(target = "frame_bridge::bridge", "dropping malformed message");
            return false;
        };

        if let Some(request_id) = message.request_id.as_deref() {
            if self
                .inner
                .ledger
                .settle(request_id, message.error.clone(), message.data.clone())
            {
                return true;
            }
        }

        match message.kind.as_str() {
            LEGACY_READY_TYPE => self.on_ready(ReadySignal::Legacy, Vec::new()),
            MODERN_READY_TYPE => {
                let methods = message.advertised_methods();
                if !methods.is_empty() {
                    *self.inner.advertised.lock() = methods.clone();
                }
                self.on_ready(ReadySignal::Modern, methods);
            }
            kind if notify::is_notification(kind) => {
                self.apply_to_cache(&message);
                let _ = self.inner.events.send(BridgeEvent::Notification {
                    kind: message.kind.clone(),
                    payload: message.raw.clone(),
                });
            }
            other => {
                trace!(
                    target = "frame_bridge::bridge",
                    kind = %other,
                    request_id = ?message.request_id,
                    "ignoring unmatched message"
                );
            }
        }
        true
    }

    /// Unified call API. Waits for readiness (forcing it after
    /// `ready_timeout`), resolves the dialect once per session, then
    /// dispatches. A reset, stop or disconnect while the call is still
    /// gating or probing rejects it with that reason.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> BridgeResult<Value> {
        if self.inner.host.peer_window().is_none() {
            return Err(BridgeError::ChannelUnavailable);
        }
        self.ensure_ready().await?;

        let mode = self.inner.resolver.resolve(&self.inner.dispatcher).await?;
        if mode != TransportMode::Modern {
            return self
                .inner
                .legacy
                .call(&self.legacy_context(), method, args, None)
                .await;
        }

        let timeout = self.inner.config.request_timeout;
        match self.inner.dispatcher.call(method, args.clone(), timeout).await {
            Err(err) if err.is_timeout() && self.inner.legacy.supports(method) => {
                warn!(
                    target = "frame_bridge::bridge",
                    method = %method,
                    error = %err,
                    "modern call timed out; retrying via legacy transport"
                );
                self.inner
                    .legacy
                    .call(&self.legacy_context(), method, args, Some(err.to_string()))
                    .await
            }
            other => other,
        }
    }

    /// Halts probing and retries; pending calls fail with `ReconnectStopped`.
    pub fn stop_reconnect(&self) {
        self.inner.prober.stop();
        self.inner.resolver.reset(InvalidationReason::ReconnectStopped);
    }

    /// Re-arms a stopped or exhausted prober without reloading the peer.
    pub fn resume(&self) -> bool {
        self.inner.prober.resume()
    }

    /// Discards the session and reloads the peer in place.
    pub fn force_refresh(&self) -> BridgeResult<()> {
        let cancelled = self.invalidate_session(InvalidationReason::Refreshed);
        self.inner.prober.reset(InvalidationReason::Refreshed);
        info!(target = "frame_bridge::bridge", cancelled, "forcing peer refresh");
        self.inner.host.reload()?;
        Ok(())
    }

    /// Points the peer at a new source. The inbound origin policy is derived
    /// from it unless one was configured explicitly.
    pub fn set_source(&self, src: &str) -> BridgeResult<()> {
        let cancelled = self.invalidate_session(InvalidationReason::SourceChanged);
        self.inner.prober.reset(InvalidationReason::SourceChanged);
        let policy = OriginPolicy::resolve(self.inner.config.allowed_origin.as_deref(), Some(src));
        info!(
            target = "frame_bridge::bridge",
            src = %src,
            policy = ?policy,
            cancelled,
            "peer source changed"
        );
        *self.inner.policy.lock() = policy;
        *self.inner.source.lock() = Some(src.to_string());
        self.inner.host.navigate(src)?;
        Ok(())
    }

    /// Teardown: timers stop and pending calls fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.prober.halt();
        let cancelled = self.invalidate_session(InvalidationReason::Disconnected);
        info!(target = "frame_bridge::bridge", cancelled, "bridge disconnected");
    }

    fn invalidate_session(&self, reason: InvalidationReason) -> usize {
        let cancelled = self.inner.ledger.cancel_all(reason);
        self.inner.resolver.reset(reason);
        self.inner.tabs.lock().clear();
        self.inner.advertised.lock().clear();
        cancelled
    }

    async fn ensure_ready(&self) -> BridgeResult<()> {
        if self.inner.prober.is_ready() {
            return Ok(());
        }
        match self.inner.prober.wait_ready(self.inner.config.ready_timeout).await {
            Err(err) if err.is_timeout() => {
                warn!(
                    target = "frame_bridge::bridge",
                    error = %err,
                    "peer never signalled ready; proceeding anyway"
                );
                self.inner.prober.force_ready();
                Ok(())
            }
            other => other,
        }
    }

    fn on_ready(&self, signal: ReadySignal, methods: Vec<String>) {
        if self.inner.prober.mark_ready() {
            debug!(
                target = "frame_bridge::bridge",
                signal = ?signal,
                methods = methods.len(),
                "readiness signal"
            );
        }
        let _ = self.inner.events.send(BridgeEvent::Ready { signal, methods });
    }

    fn apply_to_cache(&self, message: &InboundMessage) {
        let hint = message.index_hint();
        match message.kind.as_str() {
            notify::TAB_CREATED => {
                let Some(id) = message.tab_id() else {
                    debug!(target = "frame_bridge::tabs", "tabCreated without id");
                    return;
                };
                let fields = tab_fields(message, &id);
                match TabInfo::from_map(&fields) {
                    Some(tab) => self.inner.tabs.lock().insert(tab, hint),
                    None => debug!(target = "frame_bridge::tabs", tab_id = %id, "unusable tabCreated payload"),
                }
            }
            notify::TAB_UPDATED => {
                if let Some(id) = message.tab_id() {
                    let fields = tab_fields(message, &id);
                    self.inner.tabs.lock().update(&id, &fields, hint);
                }
            }
            notify::TAB_CLOSED => {
                if let Some(id) = message.tab_id() {
                    self.inner.tabs.lock().remove(&id);
                }
            }
            _ => {}
        }
    }

    fn legacy_context(&self) -> LegacyContext {
        LegacyContext::new(
            self.inner.host.clone(),
            self.inner.ledger.clone(),
            self.inner.tabs.clone(),
            self.inner.config.request_timeout,
            self.inner.config.poll_interval,
        )
    }
}

/// Tab fields of a notification with the resolved id and without routing keys.
fn tab_fields(message: &InboundMessage, id: &str) -> Map<String, Value> {
    let mut fields = message.tab_payload().cloned().unwrap_or_default();
    fields.remove("tabId");
    fields.remove("tab");
    fields.insert("id".into(), Value::String(id.to_string()));
    fields
}
