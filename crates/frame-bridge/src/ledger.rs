//! Correlation of outbound requests with inbound replies.
//!
//! Every entry is settled exactly once: by a matching reply, by its own
//! timeout, or by a bulk cancellation. Removal from the map under the lock is
//! the arbitration point, so whichever path removes the entry first wins and
//! the others find nothing to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use frame_channel::FrameHost;
use frame_proto::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ANY_ORIGIN;
use crate::error::{BridgeError, BridgeResult, InvalidationReason};

struct PendingEntry {
    kind: String,
    reply: oneshot::Sender<BridgeResult<Value>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    entries: HashMap<String, PendingEntry>,
}

/// Handle for a request that has been delivered to the peer.
#[derive(Debug)]
pub struct PendingReply {
    request_id: String,
    rx: oneshot::Receiver<BridgeResult<Value>>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> BridgeResult<Value> {
        self.rx.await.unwrap_or(Err(BridgeError::SessionInvalidated(
            InvalidationReason::Disconnected,
        )))
    }
}

#[derive(Clone)]
pub struct PendingLedger {
    host: Arc<dyn FrameHost>,
    inner: Arc<Mutex<LedgerState>>,
}

impl PendingLedger {
    pub fn new(host: Arc<dyn FrameHost>) -> Self {
        Self {
            host,
            inner: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    /// Registers a request, arms its timeout and posts it to the peer.
    ///
    /// Fails without allocating anything when no peer window exists. Must be
    /// called from within a Tokio runtime.
    pub fn dispatch(&self, envelope: Envelope, timeout: Duration) -> BridgeResult<PendingReply> {
        if self.host.peer_window().is_none() {
            return Err(BridgeError::ChannelUnavailable);
        }

        let kind = envelope.kind.clone();
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut guard = self.inner.lock();
            guard.next_id += 1;
            let request_id = format!("{}-{}", guard.next_id, unix_millis());
            let timer = self.spawn_timeout(request_id.clone(), kind.clone(), timeout);
            guard.entries.insert(
                request_id.clone(),
                PendingEntry {
                    kind: kind.clone(),
                    reply: tx,
                    timer,
                },
            );
            request_id
        };

        let payload = envelope.with_request_id(request_id.clone()).to_value();
        if let Err(err) = self.host.post_message(payload, ANY_ORIGIN) {
            if let Some(entry) = self.inner.lock().entries.remove(&request_id) {
                entry.timer.abort();
            }
            warn!(
                target = "frame_bridge::ledger",
                request_id = %request_id,
                kind = %kind,
                error = %err,
                "failed to post request"
            );
            return Err(err.into());
        }

        trace!(target = "frame_bridge::ledger", request_id = %request_id, kind = %kind, "request sent");
        Ok(PendingReply { request_id, rx })
    }

    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> BridgeResult<Value> {
        self.dispatch(envelope, timeout)?.wait().await
    }

    /// Completes the request with the given id. Unknown ids are ignored and
    /// reported as `false`.
    pub fn settle(&self, request_id: &str, error: Option<String>, data: Value) -> bool {
        let Some(entry) = self.inner.lock().entries.remove(request_id) else {
            trace!(target = "frame_bridge::ledger", request_id = %request_id, "reply without pending request");
            return false;
        };
        entry.timer.abort();
        let outcome = match error {
            Some(message) => {
                debug!(
                    target = "frame_bridge::ledger",
                    request_id = %request_id,
                    kind = %entry.kind,
                    error = %message,
                    "peer rejected request"
                );
                Err(BridgeError::PeerRejected(message))
            }
            None => Ok(data),
        };
        let _ = entry.reply.send(outcome);
        true
    }

    /// Rejects every outstanding request with `reason`. Returns how many were pending.
    pub fn cancel_all(&self, reason: InvalidationReason) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.inner.lock().entries.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry
                .reply
                .send(Err(BridgeError::SessionInvalidated(reason)));
        }
        if count > 0 {
            debug!(target = "frame_bridge::ledger", count, reason = %reason, "cancelled pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().entries.contains_key(request_id)
    }

    fn spawn_timeout(&self, request_id: String, kind: String, timeout: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(entry) = inner.lock().entries.remove(&request_id) else {
                return;
            };
            let elapsed_ms = timeout.as_millis() as u64;
            warn!(
                target = "frame_bridge::ledger",
                request_id = %request_id,
                kind = %kind,
                elapsed_ms,
                "request timed out"
            );
            let _ = entry.reply.send(Err(BridgeError::timeout(kind, elapsed_ms)));
        })
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
