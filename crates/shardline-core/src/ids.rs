use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a node in the network.
///
/// Ordering is lexicographic on the underlying string; the dial direction
/// between two peers is derived from it, so every node must agree on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// ShardId uniquely identifies a shard for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let a = NodeId::from("node-a");
        let b = NodeId::from("node-b");
        let b10 = NodeId::from("node-b10");
        assert!(a < b);
        assert!(b < b10);
    }

    #[test]
    fn test_node_id_serializes_as_plain_string() {
        let id = NodeId::from("alpha");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alpha\"");
    }
}
