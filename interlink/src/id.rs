//! Node and endpoint identity.
//!
//! This module provides the addressing primitives used throughout the node:
//! - [`NodeId`]: 128-bit process identity, carried in every message header
//! - [`LocalEndpoint`]: node-unique 32-bit endpoint id

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Node-unique endpoint identifier.
///
/// Assigned by rejection-sampling a random non-zero value against the live
/// endpoint registry. Zero means "unknown" and is never allocated. Endpoint
/// ids are unique among currently registered endpoints but are not secrets.
pub type LocalEndpoint = u32;

/// 128-bit node identifier.
///
/// Split into two u64 halves. The all-zero value means "unset" and matches
/// any node when used as a message receiver.
///
/// # Examples
///
/// ```
/// use interlink::NodeId;
///
/// let id = NodeId::new(0x123, 0x456);
/// assert!(!id.is_unset());
/// assert!(NodeId::default().is_unset());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeId {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl NodeId {
    /// Create a node id with explicit halves.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Generate a random node id.
    ///
    /// Resamples until the value is non-zero, so the result never collides
    /// with the unset sentinel.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let id = Self {
                first: rng.random(),
                second: rng.random(),
            };
            if !id.is_unset() {
                return id;
            }
        }
    }

    /// Check whether this is the unset (all-zero) id.
    pub const fn is_unset(&self) -> bool {
        self.first == 0 && self.second == 0
    }

    /// Whether a message addressed to `self` is accepted by a node with
    /// identity `local`. Unset matches any node.
    pub fn matches(&self, local: &NodeId) -> bool {
        self.is_unset() || self == local
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_unset() {
        assert!(NodeId::default().is_unset());
        assert!(!NodeId::new(1, 0).is_unset());
        assert!(!NodeId::new(0, 1).is_unset());
    }

    #[test]
    fn test_node_id_random_is_set() {
        for _ in 0..16 {
            assert!(!NodeId::random().is_unset());
        }
    }

    #[test]
    fn test_node_id_matches() {
        let local = NodeId::new(10, 20);
        assert!(local.matches(&local));
        assert!(NodeId::default().matches(&local));
        assert!(!NodeId::new(10, 21).matches(&local));
    }

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new(0x123456789ABCDEF0, 0xFEDCBA9876543210);
        assert_eq!(id.to_string(), "123456789abcdef0fedcba9876543210");
    }

    #[test]
    fn test_node_id_serde_roundtrip() {
        let id = NodeId::new(7, 9);
        let json = serde_json::to_string(&id).expect("serialize");
        let decoded: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, decoded);
    }
}
