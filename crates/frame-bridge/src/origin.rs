use frame_channel::WindowId;
use url::Url;

use crate::config::ANY_ORIGIN;

/// Inbound trust policy for messages claiming to come from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    Any,
    Exact(String),
}

impl OriginPolicy {
    pub fn from_setting(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed == ANY_ORIGIN {
            OriginPolicy::Any
        } else {
            OriginPolicy::Exact(trimmed.to_string())
        }
    }

    /// Resolves the policy from an explicit setting, else the peer source URL.
    /// Sources without a tuple origin (`about:blank`, `data:`) fall back to `Any`.
    pub fn resolve(explicit: Option<&str>, source: Option<&str>) -> Self {
        if let Some(explicit) = explicit {
            return Self::from_setting(explicit);
        }
        source
            .and_then(origin_of)
            .map(OriginPolicy::Exact)
            .unwrap_or(OriginPolicy::Any)
    }

    /// Trusted only when the message comes from the known peer window and the
    /// origin matches the policy exactly.
    pub fn is_trusted(
        &self,
        peer: Option<WindowId>,
        source: Option<WindowId>,
        origin: &str,
    ) -> bool {
        let Some(peer) = peer else {
            return false;
        };
        if source != Some(peer) {
            return false;
        }
        match self {
            OriginPolicy::Any => true,
            OriginPolicy::Exact(allowed) => allowed == origin,
        }
    }
}

/// ASCII-serialized origin of a URL, if it has a tuple origin.
pub fn origin_of(src: &str) -> Option<String> {
    let url = Url::parse(src).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: WindowId = WindowId(7);

    #[test]
    fn wildcard_still_requires_peer_window() {
        let policy = OriginPolicy::Any;
        assert!(policy.is_trusted(Some(PEER), Some(PEER), "https://anything.test"));
        assert!(!policy.is_trusted(Some(PEER), Some(WindowId(8)), "https://anything.test"));
        assert!(!policy.is_trusted(None, Some(PEER), "https://anything.test"));
        assert!(!policy.is_trusted(Some(PEER), None, "https://anything.test"));
    }

    #[test]
    fn exact_policy_compares_whole_origin() {
        let policy = OriginPolicy::from_setting("https://peer.test");
        assert!(policy.is_trusted(Some(PEER), Some(PEER), "https://peer.test"));
        assert!(!policy.is_trusted(Some(PEER), Some(PEER), "https://peer.test:8443"));
        assert!(!policy.is_trusted(Some(PEER), Some(PEER), "http://peer.test"));
    }

    #[test]
    fn derives_origin_from_source() {
        let policy = OriginPolicy::resolve(None, Some("https://peer.test:8443/app?x=1"));
        assert_eq!(policy, OriginPolicy::Exact("https://peer.test:8443".into()));
        assert_eq!(OriginPolicy::resolve(None, Some("about:blank")), OriginPolicy::Any);
        assert_eq!(OriginPolicy::resolve(Some("*"), Some("https://peer.test")), OriginPolicy::Any);
    }
}
