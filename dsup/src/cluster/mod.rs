//! Cluster boundary: collaborator contracts, shared value types, and an
//! in-process implementation.
//!
//! The supervision core does not speak the wire. Everything it knows about
//! the cluster arrives through the traits in [`traits`]: the local
//! generic-server runtime, the membership transport, the behavior
//! directory, the remote spawn/monitor RPCs and the shared name registry.
//! [`InMemoryCluster`] wires all of them up inside one process, which is
//! how a single-node deployment runs and how the integration tests
//! simulate node failures.

// Module declarations
pub mod error;
pub mod in_memory;
pub mod traits;
pub mod types;

// Re-exports for convenient access
pub use error::ClusterError;
pub use in_memory::InMemoryCluster;
pub use traits::{
    BehaviorRegistry, ClusterEnv, ClusterTransport, DownCallback, MonitorId, NameRegistry,
    NodeDownHandler, RemoteMonitor, RemoteSpawn, ServerBehavior, ServerEvent, ServerEventHandler,
    ServerRuntime, Subscription,
};
pub use types::{ExitReason, NodeId, NodeInfo, NodeStatus, ServerRef};
