//! In-process implementation of every collaborator contract.
//!
//! `InMemoryCluster` plays all six roles of [`ClusterEnv`] inside one
//! process: it hosts servers, keeps the membership view, resolves
//! behaviors, answers the spawn/monitor RPCs for simulated remote nodes
//! and backs the shared name registry with an atomic compare-and-remove.
//! Single-node deployments run on it directly; the integration tests use
//! its failure hooks ([`crash_server`](InMemoryCluster::crash_server),
//! [`disconnect_node`](InMemoryCluster::disconnect_node)) to exercise
//! restart and migration paths.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

// Layer 3: Internal module imports
use super::error::ClusterError;
use super::traits::{
    BehaviorRegistry, ClusterEnv, ClusterTransport, DownCallback, MonitorId, NameRegistry,
    NodeDownHandler, RemoteMonitor, RemoteSpawn, ServerBehavior, ServerEvent, ServerEventHandler,
    ServerRuntime, Subscription,
};
use super::types::{ExitReason, NodeId, NodeInfo, NodeStatus, ServerRef};

struct ClusterInner {
    local: NodeId,

    /// Remote members by id. The local node is not listed here,
    /// matching the transport contract.
    nodes: DashMap<NodeId, NodeInfo>,

    /// Cluster-wide behavior directory.
    behaviors: DashMap<String, Arc<dyn ServerBehavior>>,

    /// Live servers by server id, local and simulated-remote alike.
    servers: DashMap<String, ServerRef>,

    /// Shared name registry. `DashMap::remove_if` gives the shard-locked
    /// compare-and-remove the claim contract requires.
    names: DashMap<String, ServerRef>,

    /// Installed remote monitors by handle.
    monitors: DashMap<MonitorId, (ServerRef, DownCallback)>,

    /// Server lifecycle-event subscribers.
    server_subs: Mutex<Vec<(u64, ServerEventHandler)>>,

    /// Node-down subscribers.
    node_subs: Mutex<Vec<(u64, NodeDownHandler)>>,

    next_sub_id: AtomicU64,
}

impl ClusterInner {
    fn emit_server_event(&self, event: &ServerEvent) {
        let handlers: Vec<ServerEventHandler> = {
            let subs = self.server_subs.lock();
            subs.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    fn emit_node_down(&self, node: &NodeId, reason: &str) {
        let handlers: Vec<NodeDownHandler> = {
            let subs = self.node_subs.lock();
            subs.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(node, reason);
        }
    }

    /// Fires and removes every monitor watching `server`.
    fn fire_monitors(&self, server: &ServerRef, reason: &ExitReason) {
        let fired: Vec<MonitorId> = self
            .monitors
            .iter()
            .filter(|entry| &entry.value().0 == server)
            .map(|entry| *entry.key())
            .collect();
        for id in fired {
            if let Some((_, (_, callback))) = self.monitors.remove(&id) {
                callback(reason.clone());
            }
        }
    }

    fn adjust_process_count(&self, node: &NodeId, delta: isize) {
        if let Some(mut info) = self.nodes.get_mut(node) {
            let count = info.process_count as isize + delta;
            info.process_count = count.max(0) as usize;
        }
    }

    fn remove_server(&self, server: &ServerRef) -> bool {
        let removed = self.servers.remove(&server.id).is_some();
        if removed {
            self.adjust_process_count(&server.node, -1);
        }
        removed
    }
}

/// All collaborator roles in one process.
///
/// Cloning is cheap and every clone sees the same cluster.
///
/// # Example
/// ```rust,ignore
/// let cluster = InMemoryCluster::new("local");
/// cluster.register_behavior("worker", Arc::new(NoopBehavior));
/// cluster.add_node(NodeInfo::connected(NodeId::new("node-a"), "10.0.0.2", 4400));
///
/// let sup = Supervisor::start(options, cluster.env()).await?;
/// cluster.disconnect_node(&NodeId::new("node-a"), "connection_lost");
/// ```
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl InMemoryCluster {
    /// Creates a cluster with only the local node.
    pub fn new(local: impl Into<NodeId>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                local: local.into(),
                nodes: DashMap::new(),
                behaviors: DashMap::new(),
                servers: DashMap::new(),
                names: DashMap::new(),
                monitors: DashMap::new(),
                server_subs: Mutex::new(Vec::new()),
                node_subs: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(0),
            }),
        }
    }

    /// Bundles this cluster into a [`ClusterEnv`] for supervisors.
    pub fn env(&self) -> ClusterEnv {
        ClusterEnv {
            runtime: Arc::new(self.clone()),
            transport: Arc::new(self.clone()),
            behaviors: Arc::new(self.clone()),
            spawner: Arc::new(self.clone()),
            monitors: Arc::new(self.clone()),
            names: Arc::new(self.clone()),
        }
    }

    /// Adds (or replaces) a remote member.
    pub fn add_node(&self, info: NodeInfo) {
        self.inner.nodes.insert(info.id.clone(), info);
    }

    /// Registers a behavior under a cluster-wide name.
    pub fn register_behavior(&self, name: impl Into<String>, behavior: Arc<dyn ServerBehavior>) {
        self.inner.behaviors.insert(name.into(), behavior);
    }

    /// Marks a member disconnected, drops its servers and publishes the
    /// node-down event. Monitors on the lost servers are left in place:
    /// in a real cluster the monitor RPC dies with the node, and the
    /// node-down stream is the signal that gets through.
    pub fn disconnect_node(&self, node: &NodeId, reason: &str) {
        if let Some(mut info) = self.inner.nodes.get_mut(node) {
            info.status = NodeStatus::Disconnected;
            info.process_count = 0;
        }
        let lost: Vec<ServerRef> = self
            .inner
            .servers
            .iter()
            .filter(|entry| entry.value().is_on(node))
            .map(|entry| entry.value().clone())
            .collect();
        for server in lost {
            self.inner.servers.remove(&server.id);
        }
        self.inner.emit_node_down(node, reason);
    }

    /// Crashes a server: removes it and reports the crash through the
    /// lifecycle-event stream and any installed monitors.
    pub fn crash_server(&self, server: &ServerRef, message: &str) {
        if !self.inner.remove_server(server) {
            return;
        }
        let reason = ExitReason::error(message);
        self.inner.emit_server_event(&ServerEvent::Crashed {
            server: server.clone(),
            message: message.into(),
        });
        self.inner.fire_monitors(server, &reason);
    }

    /// Number of live servers across all simulated nodes.
    pub fn server_count(&self) -> usize {
        self.inner.servers.len()
    }

    /// Live servers hosted on the given node.
    pub fn servers_on(&self, node: &NodeId) -> Vec<ServerRef> {
        self.inner
            .servers
            .iter()
            .filter(|entry| entry.value().is_on(node))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl ServerRuntime for InMemoryCluster {
    async fn start(
        &self,
        behavior: Arc<dyn ServerBehavior>,
        args: Vec<Value>,
    ) -> Result<ServerRef, ClusterError> {
        behavior
            .init(&args)
            .await
            .map_err(|e| ClusterError::StartFailed {
                node: self.inner.local.clone(),
                message: e.to_string(),
            })?;
        let server = ServerRef::generate(self.inner.local.clone());
        self.inner.servers.insert(server.id.clone(), server.clone());
        Ok(server)
    }

    async fn stop(&self, server: &ServerRef, _reason: ExitReason) -> Result<(), ClusterError> {
        if self.inner.remove_server(server) {
            self.inner.emit_server_event(&ServerEvent::Stopped {
                server: server.clone(),
            });
            self.inner.fire_monitors(server, &ExitReason::Shutdown);
        }
        Ok(())
    }

    async fn force_terminate(
        &self,
        server: &ServerRef,
        _reason: ExitReason,
    ) -> Result<(), ClusterError> {
        self.inner.remove_server(server);
        Ok(())
    }

    async fn is_running(&self, server: &ServerRef) -> bool {
        self.inner.servers.contains_key(&server.id)
    }

    fn on_lifecycle_event(&self, handler: ServerEventHandler) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.server_subs.lock().push((id, handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.server_subs.lock().retain(|(sub_id, _)| *sub_id != id);
        })
    }
}

impl ClusterTransport for InMemoryCluster {
    fn local_node(&self) -> NodeId {
        self.inner.local.clone()
    }

    fn connected_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .inner
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn is_connected(&self, node: &NodeId) -> bool {
        if node == &self.inner.local {
            return true;
        }
        self.inner
            .nodes
            .get(node)
            .map(|info| info.is_connected())
            .unwrap_or(false)
    }

    fn on_node_down(&self, handler: NodeDownHandler) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.node_subs.lock().push((id, handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.node_subs.lock().retain(|(sub_id, _)| *sub_id != id);
        })
    }
}

impl BehaviorRegistry for InMemoryCluster {
    fn contains(&self, name: &str) -> bool {
        self.inner.behaviors.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ServerBehavior>> {
        self.inner
            .behaviors
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl RemoteSpawn for InMemoryCluster {
    async fn spawn(
        &self,
        behavior: &str,
        target: &NodeId,
        args: Vec<Value>,
    ) -> Result<ServerRef, ClusterError> {
        if target == &self.inner.local {
            let resolved = BehaviorRegistry::get(self, behavior).ok_or_else(|| {
                ClusterError::BehaviorNotFound {
                    behavior: behavior.into(),
                    node: target.clone(),
                }
            })?;
            return ServerRuntime::start(self, resolved, args).await;
        }

        let connected = self
            .inner
            .nodes
            .get(target)
            .map(|info| info.is_connected())
            .unwrap_or(false);
        if !connected {
            return Err(ClusterError::NodeUnreachable {
                node: target.clone(),
            });
        }

        // The simulated remote node shares the cluster-wide behavior
        // directory.
        let resolved =
            BehaviorRegistry::get(self, behavior).ok_or_else(|| ClusterError::BehaviorNotFound {
                behavior: behavior.into(),
                node: target.clone(),
            })?;
        resolved
            .init(&args)
            .await
            .map_err(|e| ClusterError::SpawnFailed {
                behavior: behavior.into(),
                node: target.clone(),
                message: e.to_string(),
            })?;

        let server = ServerRef::generate(target.clone());
        self.inner.servers.insert(server.id.clone(), server.clone());
        self.inner.adjust_process_count(target, 1);
        Ok(server)
    }
}

#[async_trait]
impl RemoteMonitor for InMemoryCluster {
    async fn monitor(
        &self,
        target: &ServerRef,
        on_down: DownCallback,
    ) -> Result<MonitorId, ClusterError> {
        let id = MonitorId::generate();
        self.inner.monitors.insert(id, (target.clone(), on_down));
        Ok(id)
    }

    async fn demonitor(&self, handle: MonitorId) {
        self.inner.monitors.remove(&handle);
    }
}

#[async_trait]
impl NameRegistry for InMemoryCluster {
    async fn register(&self, key: &str, server: &ServerRef) -> Result<(), ClusterError> {
        let entry = self
            .inner
            .names
            .entry(key.to_string())
            .or_insert_with(|| server.clone());
        if entry.value() == server {
            Ok(())
        } else {
            Err(ClusterError::NameTaken { key: key.into() })
        }
    }

    async fn unregister(&self, key: &str) {
        self.inner.names.remove(key);
    }

    async fn whereis(&self, key: &str) -> Option<ServerRef> {
        self.inner.names.get(key).map(|entry| entry.value().clone())
    }

    async fn names(&self) -> Vec<String> {
        self.inner
            .names
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn compare_and_remove(&self, key: &str, expected: &ServerRef) -> bool {
        self.inner
            .names
            .remove_if(key, |_, bound| bound == expected)
            .is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NoopBehavior;

    #[async_trait]
    impl ServerBehavior for NoopBehavior {
        async fn init(
            &self,
            _args: &[Value],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn cluster_with_behavior() -> InMemoryCluster {
        let cluster = InMemoryCluster::new("local");
        cluster.register_behavior("noop", Arc::new(NoopBehavior));
        cluster
    }

    #[tokio::test]
    async fn test_local_start_and_stop() {
        let cluster = cluster_with_behavior();
        let behavior = BehaviorRegistry::get(&cluster, "noop").unwrap();
        let server = ServerRuntime::start(&cluster, behavior, vec![]).await.unwrap();

        assert_eq!(server.node, NodeId::new("local"));
        assert!(ServerRuntime::is_running(&cluster, &server).await);

        ServerRuntime::stop(&cluster, &server, ExitReason::Shutdown)
            .await
            .unwrap();
        assert!(!ServerRuntime::is_running(&cluster, &server).await);
    }

    #[tokio::test]
    async fn test_crash_fires_lifecycle_event() {
        let cluster = cluster_with_behavior();
        let behavior = BehaviorRegistry::get(&cluster, "noop").unwrap();
        let server = ServerRuntime::start(&cluster, behavior, vec![]).await.unwrap();

        let crashes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&crashes);
        let _sub = cluster.on_lifecycle_event(Arc::new(move |event| {
            if matches!(event, ServerEvent::Crashed { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        cluster.crash_server(&server, "boom");
        assert_eq!(crashes.load(Ordering::SeqCst), 1);
        assert!(!ServerRuntime::is_running(&cluster, &server).await);

        // Crashing an already-dead server is silent.
        cluster.crash_server(&server, "boom again");
        assert_eq!(crashes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_spawn_requires_connected_node() {
        let cluster = cluster_with_behavior();
        let target = NodeId::new("node-a");

        let err = RemoteSpawn::spawn(&cluster, "noop", &target, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeUnreachable { .. }));

        cluster.add_node(NodeInfo::connected(target.clone(), "10.0.0.2", 4400));
        let server = RemoteSpawn::spawn(&cluster, "noop", &target, vec![])
            .await
            .unwrap();
        assert!(server.is_on(&target));
        assert_eq!(cluster.servers_on(&target).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_drops_servers_and_notifies() {
        let cluster = cluster_with_behavior();
        let target = NodeId::new("node-a");
        cluster.add_node(NodeInfo::connected(target.clone(), "10.0.0.2", 4400));
        let server = RemoteSpawn::spawn(&cluster, "noop", &target, vec![])
            .await
            .unwrap();

        let downs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&downs);
        let _sub = cluster.on_node_down(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        cluster.disconnect_node(&target, "connection_lost");
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert!(!cluster.is_connected(&target));
        assert!(!ServerRuntime::is_running(&cluster, &server).await);
    }

    #[tokio::test]
    async fn test_monitor_fires_on_crash() {
        let cluster = cluster_with_behavior();
        let target = NodeId::new("node-a");
        cluster.add_node(NodeInfo::connected(target.clone(), "10.0.0.2", 4400));
        let server = RemoteSpawn::spawn(&cluster, "noop", &target, vec![])
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let _handle = RemoteMonitor::monitor(
            &cluster,
            &server,
            Arc::new(move |reason| {
                assert!(reason.is_abnormal());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        cluster.crash_server(&server, "boom");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_name_registry_register_semantics() {
        let cluster = cluster_with_behavior();
        let a = ServerRef::new("a", NodeId::new("local"));
        let b = ServerRef::new("b", NodeId::new("local"));

        NameRegistry::register(&cluster, "k", &a).await.unwrap();
        // Identical re-binding is idempotent.
        NameRegistry::register(&cluster, "k", &a).await.unwrap();
        // A different ref is rejected.
        let err = NameRegistry::register(&cluster, "k", &b).await.unwrap_err();
        assert!(matches!(err, ClusterError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn test_compare_and_remove_is_single_winner() {
        let cluster = cluster_with_behavior();
        let a = ServerRef::new("a", NodeId::new("local"));
        NameRegistry::register(&cluster, "k", &a).await.unwrap();

        assert!(NameRegistry::compare_and_remove(&cluster, "k", &a).await);
        assert!(!NameRegistry::compare_and_remove(&cluster, "k", &a).await);
        assert!(NameRegistry::whereis(&cluster, "k").await.is_none());
    }
}
