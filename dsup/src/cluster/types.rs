//! Value types shared across the cluster boundary.
//!
//! These types describe the cluster as the supervision layer sees it:
//! member nodes, opaque server handles, and the reasons servers go away.

// Layer 1: Standard library imports
use std::fmt;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::util::duration_millis;

/// Opaque handle identifying a cluster member.
///
/// Totally ordered and stable across reconnects: a node that drops off and
/// rejoins keeps its id. The inner representation is a plain string
/// (typically `host:port` or a configured node name) but callers must not
/// rely on any structure.
///
/// # Example
/// ```rust
/// use dsup::cluster::NodeId;
///
/// let a = NodeId::new("node-a");
/// let b = NodeId::new("node-b");
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from its stable name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Connection status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is reachable and heartbeating.
    Connected,
    /// Node dropped off the cluster; a node-down event was (or will be)
    /// published for it.
    Disconnected,
}

/// A cluster member as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node identifier.
    pub id: NodeId,

    /// Host the node listens on.
    pub host: String,

    /// Port the node listens on.
    pub port: u16,

    /// Current connection status.
    pub status: NodeStatus,

    /// Number of servers currently hosted on the node. Used by the
    /// `least_loaded` placement strategy.
    pub process_count: usize,

    /// Timestamp of the last heartbeat received from the node.
    pub last_heartbeat_at: DateTime<Utc>,

    /// How long the node has been up.
    #[serde(with = "duration_millis")]
    pub uptime: Duration,
}

impl NodeInfo {
    /// Creates a connected node entry with zeroed counters.
    ///
    /// Convenience for tests and for synthesizing the local node's entry
    /// when the transport's view omits it.
    pub fn connected(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            status: NodeStatus::Connected,
            process_count: 0,
            last_heartbeat_at: Utc::now(),
            uptime: Duration::ZERO,
        }
    }

    /// Returns `true` if the node is currently connected.
    pub fn is_connected(&self) -> bool {
        self.status == NodeStatus::Connected
    }
}

/// Opaque handle to a running generic server.
///
/// Many handles may refer to the same live server; none of them owns it.
/// The embedded [`NodeId`] tells the supervision layer where the server
/// runs — local refs carry the local node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerRef {
    /// Unique server id, assigned by the runtime that started it.
    pub id: String,

    /// Node the server runs on.
    pub node: NodeId,
}

impl ServerRef {
    /// Creates a ref for a server hosted on `node`.
    pub fn new(id: impl Into<String>, node: NodeId) -> Self {
        Self {
            id: id.into(),
            node,
        }
    }

    /// Creates a ref with a freshly generated server id.
    pub fn generate(node: NodeId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node,
        }
    }

    /// Returns `true` if the server runs on the given node.
    pub fn is_on(&self, node: &NodeId) -> bool {
        &self.node == node
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node)
    }
}

/// Why a server went away.
///
/// Restart policies are evaluated against this: `transient` children are
/// restarted only for abnormal reasons, and a node failure always counts
/// as abnormal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitReason {
    /// The server finished its work and stopped cleanly.
    Normal,

    /// The server was stopped on request (supervisor shutdown or explicit
    /// termination).
    Shutdown,

    /// The server crashed.
    Error {
        /// Crash description as reported by the runtime.
        message: String,
    },

    /// The node hosting the server left the cluster.
    NodeDown {
        /// Transport-level reason, e.g. `connection_lost`.
        reason: String,
    },
}

impl ExitReason {
    /// Shorthand for an error exit.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Shorthand for a node-down exit.
    pub fn node_down(reason: impl Into<String>) -> Self {
        Self::NodeDown {
            reason: reason.into(),
        }
    }

    /// Returns `true` for exits that count as abnormal.
    ///
    /// Node failures are always abnormal; requested shutdowns and normal
    /// completion are not.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitReason::Error { .. } | ExitReason::NodeDown { .. })
    }

    /// Returns `true` if the exit was caused by a node failure.
    pub fn is_node_down(&self) -> bool {
        matches!(self, ExitReason::NodeDown { .. })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Error { message } => write!(f, "error: {message}"),
            ExitReason::NodeDown { reason } => write!(f, "node down: {reason}"),
        }
    }
}
