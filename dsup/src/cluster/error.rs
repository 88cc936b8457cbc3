//! Error types for the collaborator boundary.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use super::types::NodeId;

/// Failures reported by cluster collaborators.
///
/// These are the structured errors the generic-server runtime, transport,
/// remote-spawn RPC and name registry can produce. The supervision layer
/// wraps them in [`SupervisorError::Supervisor`](crate::SupervisorError)
/// when they surface through its own API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The named behavior is not registered on the target node.
    #[error("behavior '{behavior}' not found on node {node}")]
    BehaviorNotFound {
        /// Behavior name that failed to resolve.
        behavior: String,
        /// Node whose registry was consulted.
        node: NodeId,
    },

    /// The target node is not a connected cluster member.
    #[error("node {node} is not reachable")]
    NodeUnreachable { node: NodeId },

    /// A remote spawn RPC failed on the target node.
    #[error("spawn of '{behavior}' on node {node} failed: {message}")]
    SpawnFailed {
        behavior: String,
        node: NodeId,
        message: String,
    },

    /// A behavior's `init` failed while starting a server.
    #[error("starting a server on node {node} failed: {message}")]
    StartFailed { node: NodeId, message: String },

    /// An operation targeted a server that is not running.
    #[error("server '{server_id}' is not running")]
    ServerNotRunning { server_id: String },

    /// A name-registry key is already bound to a different server.
    #[error("name '{key}' is already taken")]
    NameTaken { key: String },

    /// Any other transport-level failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_not_found_message() {
        let err = ClusterError::BehaviorNotFound {
            behavior: "cache".into(),
            node: NodeId::new("node-b"),
        };
        let msg = err.to_string();
        assert!(msg.contains("cache"));
        assert!(msg.contains("node-b"));
    }

    #[test]
    fn test_name_taken_message() {
        let err = ClusterError::NameTaken {
            key: "dsup:s1:w1".into(),
        };
        assert!(err.to_string().contains("dsup:s1:w1"));
    }
}
