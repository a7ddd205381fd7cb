//! Client-side RPC façade for a remote browser session embedded in a frame.
//!
//! The bridge speaks to its peer only through cross-document messages
//! (see [`frame_channel::FrameHost`]). It probes the peer until it signals
//! readiness, reloads it with backoff when it does not, detects which wire
//! dialect it understands and exposes a single [`FrameBridge::call`] API over
//! either one.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod legacy;
pub mod liveness;
pub mod origin;
pub mod tabs;
pub mod telemetry;
pub mod transport;

pub use bridge::FrameBridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, InvalidationReason};
pub use events::{BridgeEvent, ReadySignal};
pub use legacy::{LegacyAdapter, LegacyContext, LegacyHandler};
pub use liveness::{LivenessState, RetryState};
pub use origin::OriginPolicy;
pub use transport::TransportMode;

pub use frame_channel::{FrameHost, LocalFrame, MessageEvent, WindowId};
pub use frame_proto::TabInfo;
