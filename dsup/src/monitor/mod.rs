//! Uniform liveness monitoring for local and remote children.
//!
//! A [`ChildMonitor`] turns the two ways a child can disappear into one
//! down-callback:
//!
//! - local children: the generic-server runtime's lifecycle events
//!   (`crashed`, `stopped`);
//! - remote children: the remote-monitor RPC *and* the cluster's
//!   node-down stream — either is sufficient to conclude the child is
//!   gone.
//!
//! Supervisors attach one monitor per child and always detach it before
//! removing the child from their table, so a stop never echoes back as a
//! crash.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use crate::cluster::{
    ClusterEnv, ClusterError, DownCallback, ExitReason, MonitorId, ServerRef, Subscription,
};

/// Monitor installed on one child.
///
/// Holds the underlying subscriptions; [`detach`](ChildMonitor::detach)
/// releases all of them. The local subscriptions also release on drop,
/// but a remote monitor needs the async `demonitor` RPC — always detach
/// explicitly.
#[derive(Debug)]
pub struct ChildMonitor {
    target: ServerRef,
    local_sub: Option<Subscription>,
    node_sub: Option<Subscription>,
    remote_handle: Option<MonitorId>,
}

impl ChildMonitor {
    /// Installs liveness monitoring for `target`, invoking `on_down` once
    /// the child is gone.
    pub async fn attach(
        env: &ClusterEnv,
        target: &ServerRef,
        on_down: DownCallback,
    ) -> Result<Self, ClusterError> {
        if target.is_on(&env.local_node()) {
            Ok(Self::attach_local(env, target, on_down))
        } else {
            Self::attach_remote(env, target, on_down).await
        }
    }

    fn attach_local(env: &ClusterEnv, target: &ServerRef, on_down: DownCallback) -> Self {
        let watched = target.clone();
        let local_sub = env.runtime.on_lifecycle_event(Arc::new(move |event| {
            if event.server() == &watched {
                on_down(event.exit_reason());
            }
        }));
        Self {
            target: target.clone(),
            local_sub: Some(local_sub),
            node_sub: None,
            remote_handle: None,
        }
    }

    async fn attach_remote(
        env: &ClusterEnv,
        target: &ServerRef,
        on_down: DownCallback,
    ) -> Result<Self, ClusterError> {
        let remote_handle = env
            .monitors
            .monitor(target, Arc::clone(&on_down))
            .await?;

        let watched_node = target.node.clone();
        let node_sub = env.transport.on_node_down(Arc::new(move |node, reason| {
            if node == &watched_node {
                on_down(ExitReason::node_down(reason));
            }
        }));

        Ok(Self {
            target: target.clone(),
            local_sub: None,
            node_sub: Some(node_sub),
            remote_handle: Some(remote_handle),
        })
    }

    /// The monitored server.
    pub fn target(&self) -> &ServerRef {
        &self.target
    }

    /// Releases every underlying subscription.
    pub async fn detach(mut self, env: &ClusterEnv) {
        if let Some(sub) = self.local_sub.take() {
            sub.cancel();
        }
        if let Some(sub) = self.node_sub.take() {
            sub.cancel();
        }
        if let Some(handle) = self.remote_handle.take() {
            env.monitors.demonitor(handle).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::{
        BehaviorRegistry, InMemoryCluster, NodeId, NodeInfo, RemoteSpawn, ServerBehavior,
        ServerRuntime,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new("local");
        cluster.register_behavior("noop", Arc::new(NoopBehavior));
        cluster
    }

    fn counter_callback() -> (DownCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callback: DownCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test]
    async fn test_local_monitor_fires_on_crash() {
        let cluster = cluster();
        let env = cluster.env();
        let behavior = BehaviorRegistry::get(&cluster, "noop").unwrap();
        let server = ServerRuntime::start(&cluster, behavior, vec![]).await.unwrap();

        let (callback, fired) = counter_callback();
        let monitor = ChildMonitor::attach(&env, &server, callback).await.unwrap();

        cluster.crash_server(&server, "boom");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        monitor.detach(&env).await;
    }

    #[tokio::test]
    async fn test_detached_local_monitor_is_silent() {
        let cluster = cluster();
        let env = cluster.env();
        let behavior = BehaviorRegistry::get(&cluster, "noop").unwrap();
        let server = ServerRuntime::start(&cluster, behavior, vec![]).await.unwrap();

        let (callback, fired) = counter_callback();
        let monitor = ChildMonitor::attach(&env, &server, callback).await.unwrap();
        monitor.detach(&env).await;

        cluster.crash_server(&server, "boom");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_monitor_fires_on_node_down() {
        let cluster = cluster();
        let env = cluster.env();
        let node_a = NodeId::new("node-a");
        cluster.add_node(NodeInfo::connected(node_a.clone(), "10.0.0.2", 4400));
        let server = RemoteSpawn::spawn(&cluster, "noop", &node_a, vec![])
            .await
            .unwrap();

        let (callback, fired) = counter_callback();
        let monitor = ChildMonitor::attach(&env, &server, callback).await.unwrap();

        cluster.disconnect_node(&node_a, "connection_lost");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        monitor.detach(&env).await;
    }

    #[tokio::test]
    async fn test_remote_monitor_fires_on_remote_crash() {
        let cluster = cluster();
        let env = cluster.env();
        let node_a = NodeId::new("node-a");
        cluster.add_node(NodeInfo::connected(node_a.clone(), "10.0.0.2", 4400));
        let server = RemoteSpawn::spawn(&cluster, "noop", &node_a, vec![])
            .await
            .unwrap();

        let (callback, fired) = counter_callback();
        let monitor = ChildMonitor::attach(&env, &server, callback).await.unwrap();

        cluster.crash_server(&server, "remote boom");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        monitor.detach(&env).await;

        // A node-down after detach no longer fires.
        cluster.disconnect_node(&node_a, "connection_lost");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
