//! Contracts the supervision layer expects from its collaborators.
//!
//! The supervision core is a library; it does not implement a mailbox
//! runtime, a cluster transport or a replicated name registry. It consumes
//! them through the traits below, which mirror the collaborator surface of
//! the surrounding system. [`InMemoryCluster`](super::InMemoryCluster)
//! implements all of them in-process for local use and tests.

// Layer 1: Standard library imports
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

// Layer 3: Internal module imports
use super::error::ClusterError;
use super::types::{ExitReason, NodeId, NodeInfo, ServerRef};

/// Guard for an event-stream subscription.
///
/// Dropping the guard (or calling [`cancel`](Subscription::cancel))
/// releases the underlying subscription. Collaborators hand these out from
/// `on_lifecycle_event` / `on_node_down` so observers cannot leak handlers.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wraps an unsubscribe thunk.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that releases nothing. Useful for collaborators that
    /// multiplex internally.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Explicitly releases the subscription.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Lifecycle events published by the generic-server runtime.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A server crashed with the given reason.
    Crashed {
        server: ServerRef,
        message: String,
    },

    /// A server stopped cleanly.
    Stopped { server: ServerRef },
}

impl ServerEvent {
    /// The server the event is about.
    pub fn server(&self) -> &ServerRef {
        match self {
            ServerEvent::Crashed { server, .. } | ServerEvent::Stopped { server } => server,
        }
    }

    /// The exit reason this event translates to.
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            ServerEvent::Crashed { message, .. } => ExitReason::error(message.clone()),
            ServerEvent::Stopped { .. } => ExitReason::Normal,
        }
    }
}

/// Handler invoked for each server lifecycle event.
pub type ServerEventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Handler invoked when a cluster member goes down: `(node, reason)`.
pub type NodeDownHandler = Arc<dyn Fn(&NodeId, &str) + Send + Sync>;

/// Callback fired by a monitor when its target is gone.
pub type DownCallback = Arc<dyn Fn(ExitReason) + Send + Sync>;

/// Handle returned by [`RemoteMonitor::monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(Uuid);

impl MonitorId {
    /// Generates a fresh monitor id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A behavior resolvable through the [`BehaviorRegistry`].
///
/// The supervision layer never inspects a behavior beyond handing it to
/// the runtime's `start`; `init` runs once at spawn with the child's
/// argument list and may fail, which aborts the spawn.
#[async_trait]
pub trait ServerBehavior: Send + Sync {
    /// Initializes server state from the argument list.
    async fn init(&self, args: &[Value]) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

/// The generic-server runtime.
///
/// `start` always spawns locally; the other operations address a server
/// by its ref and are routed to the ref's node by the runtime, so
/// supervisors stop and poll remote children through the same handle.
#[async_trait]
pub trait ServerRuntime: Send + Sync {
    /// Starts a server from a resolved behavior. Returns a ref carrying
    /// the local node id.
    async fn start(
        &self,
        behavior: Arc<dyn ServerBehavior>,
        args: Vec<Value>,
    ) -> Result<ServerRef, ClusterError>;

    /// Requests a graceful stop. The server may take time to wind down;
    /// callers poll [`is_running`](Self::is_running) against their own
    /// timeout.
    async fn stop(&self, server: &ServerRef, reason: ExitReason) -> Result<(), ClusterError>;

    /// Terminates a server immediately, skipping its cleanup.
    async fn force_terminate(
        &self,
        server: &ServerRef,
        reason: ExitReason,
    ) -> Result<(), ClusterError>;

    /// Returns `true` while the server is alive.
    async fn is_running(&self, server: &ServerRef) -> bool;

    /// Subscribes to local server lifecycle events.
    fn on_lifecycle_event(&self, handler: ServerEventHandler) -> Subscription;
}

/// The cluster transport: membership view and node-down notifications.
pub trait ClusterTransport: Send + Sync {
    /// Id of the node this process runs on.
    fn local_node(&self) -> NodeId;

    /// Current view of the other cluster members. The local node need not
    /// be included.
    fn connected_nodes(&self) -> Vec<NodeInfo>;

    /// Returns `true` if the node is currently a connected member.
    fn is_connected(&self, node: &NodeId) -> bool;

    /// Subscribes to authoritative node-down events.
    fn on_node_down(&self, handler: NodeDownHandler) -> Subscription;
}

/// Cluster-wide behavior directory.
pub trait BehaviorRegistry: Send + Sync {
    /// Returns `true` if the behavior name resolves locally.
    fn contains(&self, name: &str) -> bool;

    /// Resolves a behavior by name.
    fn get(&self, name: &str) -> Option<Arc<dyn ServerBehavior>>;
}

/// Remote-spawn RPC: start a server on another node.
#[async_trait]
pub trait RemoteSpawn: Send + Sync {
    /// Starts `behavior` on `target`. The remote side resolves the
    /// behavior in its own registry; an unresolved name surfaces as
    /// [`ClusterError::BehaviorNotFound`] for that node.
    async fn spawn(
        &self,
        behavior: &str,
        target: &NodeId,
        args: Vec<Value>,
    ) -> Result<ServerRef, ClusterError>;
}

/// Remote-monitor RPC: observe a server hosted on another node.
#[async_trait]
pub trait RemoteMonitor: Send + Sync {
    /// Installs a monitor on `target`; `on_down` fires when the remote
    /// side reports the server's termination.
    async fn monitor(
        &self,
        target: &ServerRef,
        on_down: DownCallback,
    ) -> Result<MonitorId, ClusterError>;

    /// Removes a previously installed monitor. Unknown handles are a
    /// no-op.
    async fn demonitor(&self, handle: MonitorId);
}

/// The shared, cluster-wide name registry.
///
/// The child registry's claim semantics require
/// [`compare_and_remove`](Self::compare_and_remove) to be atomic: two
/// concurrent calls for the same binding must yield exactly one `true`.
#[async_trait]
pub trait NameRegistry: Send + Sync {
    /// Binds `key` to `server`. Fails with [`ClusterError::NameTaken`]
    /// when the key is bound to a different server; re-binding the same
    /// server is idempotent.
    async fn register(&self, key: &str, server: &ServerRef) -> Result<(), ClusterError>;

    /// Removes a binding. No-op when absent.
    async fn unregister(&self, key: &str);

    /// Looks up a binding.
    async fn whereis(&self, key: &str) -> Option<ServerRef>;

    /// All currently bound keys.
    async fn names(&self) -> Vec<String>;

    /// Atomically removes `key` iff it is still bound to `expected`.
    /// Returns `true` when this call performed the removal.
    async fn compare_and_remove(&self, key: &str, expected: &ServerRef) -> bool;
}

/// Bundle of collaborator handles a supervisor operates against.
///
/// Cheap to clone; every supervisor and every installed monitor holds one.
#[derive(Clone)]
pub struct ClusterEnv {
    /// Local generic-server runtime.
    pub runtime: Arc<dyn ServerRuntime>,

    /// Cluster membership and node-down stream.
    pub transport: Arc<dyn ClusterTransport>,

    /// Behavior name resolution.
    pub behaviors: Arc<dyn BehaviorRegistry>,

    /// Remote-spawn RPC.
    pub spawner: Arc<dyn RemoteSpawn>,

    /// Remote-monitor RPC.
    pub monitors: Arc<dyn RemoteMonitor>,

    /// Shared name registry.
    pub names: Arc<dyn NameRegistry>,
}

impl fmt::Debug for ClusterEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEnv")
            .field("local_node", &self.transport.local_node())
            .finish()
    }
}

impl ClusterEnv {
    /// Shorthand for the transport's local node id.
    pub fn local_node(&self) -> NodeId {
        self.transport.local_node()
    }
}
