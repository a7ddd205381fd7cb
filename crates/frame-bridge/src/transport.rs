use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use frame_proto::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult, InvalidationReason};
use crate::ledger::PendingLedger;

/// Cheap idempotent query used to detect the modern dialect.
pub const PROBE_METHOD: &str = "getTabs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Unknown,
    Modern,
    Legacy,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Unknown => "unknown",
            TransportMode::Modern => "modern",
            TransportMode::Legacy => "legacy",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends the single generic call envelope of the modern dialect.
#[derive(Clone)]
pub struct ModernDispatcher {
    ledger: PendingLedger,
    dispatch_type: String,
}

impl ModernDispatcher {
    pub fn new(ledger: PendingLedger, dispatch_type: impl Into<String>) -> Self {
        Self {
            ledger,
            dispatch_type: dispatch_type.into(),
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>, timeout: Duration) -> BridgeResult<Value> {
        let envelope = Envelope::call(self.dispatch_type.as_str(), method, args);
        self.ledger.request(envelope, timeout).await
    }
}

#[derive(Default)]
struct Session {
    mode: OnceCell<TransportMode>,
    ended: Mutex<Option<InvalidationReason>>,
}

/// Decides once per session which dialect the peer speaks.
///
/// Concurrent first callers share one probe through the session's
/// `OnceCell`; a reset swaps in a fresh session so the next call probes again.
pub struct TransportResolver {
    session: Mutex<Arc<Session>>,
    probe_timeout: Duration,
}

impl TransportResolver {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(Arc::default()),
            probe_timeout,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.session
            .lock()
            .mode
            .get()
            .copied()
            .unwrap_or(TransportMode::Unknown)
    }

    /// Returns the memoized mode, probing the peer on first use. A probe
    /// timeout or peer error selects the legacy dialect for the session; a
    /// session reset while probing rejects with the reset's reason and
    /// leaves the mode undecided.
    pub async fn resolve(&self, dispatcher: &ModernDispatcher) -> BridgeResult<TransportMode> {
        let session = Arc::clone(&*self.session.lock());
        let probe_timeout = self.probe_timeout;
        let mode = session
            .mode
            .get_or_try_init(|| async {
                let ended = *session.ended.lock();
                if let Some(reason) = ended {
                    return Err(BridgeError::SessionInvalidated(reason));
                }
                match dispatcher.call(PROBE_METHOD, Vec::new(), probe_timeout).await {
                    Ok(_) => {
                        info!(target = "frame_bridge::transport", mode = "modern", "transport resolved");
                        Ok(TransportMode::Modern)
                    }
                    Err(err @ BridgeError::SessionInvalidated(_)) => Err(err),
                    Err(err) => {
                        info!(
                            target = "frame_bridge::transport",
                            mode = "legacy",
                            error = %err,
                            "modern probe failed; using legacy transport"
                        );
                        Ok(TransportMode::Legacy)
                    }
                }
            })
            .await?;
        Ok(*mode)
    }

    /// Ends the current session. Callers still waiting on its probe are
    /// rejected with `reason`.
    pub fn reset(&self, reason: InvalidationReason) {
        let mut guard = self.session.lock();
        if guard.mode.initialized() {
            debug!(target = "frame_bridge::transport", reason = %reason, "transport mode reset");
        }
        *guard.ended.lock() = Some(reason);
        *guard = Arc::default();
    }
}
