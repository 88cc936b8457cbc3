//! # dsup - Distributed Supervision for Generic Servers
//!
//! Erlang/OTP-style supervision trees that span a cluster: supervisors
//! place children on nodes by policy, monitor them wherever they run,
//! and atomically reclaim and re-spawn orphaned children when a node
//! fails.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dsup::cluster::InMemoryCluster;
//! use dsup::supervisor::{ChildSpec, RestartPolicy, Strategy, Supervisor, SupervisorOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dsup::SupervisorError> {
//!     // Collaborators: here everything runs in-process.
//!     let cluster = InMemoryCluster::new("local");
//!     cluster.register_behavior("session-store", Arc::new(SessionStore));
//!
//!     let sup = Supervisor::start(
//!         SupervisorOptions::new(Strategy::OneForOne)
//!             .with_child(ChildSpec::new("sessions", "session-store"))
//!             .with_restart_intensity(5, std::time::Duration::from_secs(60)),
//!         cluster.env(),
//!     )
//!     .await?;
//!
//!     // ... the supervisor restarts "sessions" whenever it crashes.
//!
//!     sup.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! Every supervisor is a single logical actor: a task draining an
//! operation queue. Public calls and failure callbacks (child crashes,
//! node-down events) enter through the queue, so all state transitions
//! are serialized without shared locks. Multiple supervisors run in
//! parallel; the only shared mutable state between them is the
//! cluster-wide child registry, whose claim primitive guarantees exactly
//! one supervisor revives any given child.
//!
//! # Module Organization
//!
//! - [`supervisor`] - the supervisor state machine, strategies, options
//!   and lifecycle events
//! - [`selector`] - node placement policies
//! - [`registry`] - the namespaced cluster-wide child directory
//! - [`monitor`] - uniform liveness monitoring for local/remote children
//! - [`cluster`] - collaborator contracts and the in-process
//!   implementation
//! - [`util`] - identifier generation and serde helpers
//!
//! # Scope
//!
//! The crate supervises servers; it does not implement them. The mailbox
//! runtime, the cluster transport and the replicated name registry are
//! collaborators behind the traits in [`cluster`]. Supervisor state does
//! not survive a full-cluster restart, and only a child's identity and
//! specification migrate on node failure — its state is rebuilt by the
//! behavior's init.

// Module declarations
pub mod cluster;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod selector;
pub mod supervisor;
pub mod util;

// Re-export commonly used types
pub use cluster::{
    ClusterEnv, ClusterError, ExitReason, InMemoryCluster, NodeId, NodeInfo, NodeStatus,
    ServerBehavior, ServerRef, Subscription,
};
pub use error::SupervisorError;
pub use monitor::ChildMonitor;
pub use registry::{ChildRegistration, ChildRegistry};
pub use selector::{select_node, NodeSelector};
pub use supervisor::{
    AutoShutdown, ChildInfo, ChildSpec, ChildTemplate, EventBus, LifecycleEvent, Phase,
    RestartIntensity, RestartPolicy, StopReason, Strategy, Supervisor, SupervisorOptions,
    SupervisorRef, SupervisorStats,
};
