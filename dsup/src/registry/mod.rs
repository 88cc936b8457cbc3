//! Cluster-wide child directory.
//!
//! Thin wrapper over the shared [`NameRegistry`] that namespaces every
//! child binding under its owning supervisor and exposes the atomic claim
//! used before restarts. The key schema is `dsup:<supervisorId>:<childId>`;
//! only the first two segments are fixed, so child ids may themselves
//! contain `:`. Supervisor ids may not — that is validated where
//! supervisors are constructed.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::cluster::{NameRegistry, NodeId, ServerRef};
use crate::error::SupervisorError;

/// Leading segment of every child key.
pub const KEY_PREFIX: &str = "dsup";

/// Builds the registry key for a child.
pub fn child_key(supervisor_id: &str, child_id: &str) -> String {
    format!("{KEY_PREFIX}:{supervisor_id}:{child_id}")
}

/// Parses a registry key into `(supervisor_id, child_id)`.
///
/// Splits only the first two `:` separators; everything after them is the
/// child id, so ids containing `:` round-trip.
pub fn parse_child_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(KEY_PREFIX), Some(supervisor_id), Some(child_id)) => {
            Some((supervisor_id, child_id))
        }
        _ => None,
    }
}

/// A child binding as recorded in the shared registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRegistration {
    /// Supervisor owning the binding.
    pub supervisor_id: String,

    /// Child id within the supervisor's namespace.
    pub child_id: String,

    /// The registered server handle.
    pub server: ServerRef,

    /// Node the server runs on.
    pub node: NodeId,
}

/// Namespaced view of the shared name registry.
#[derive(Clone)]
pub struct ChildRegistry {
    names: Arc<dyn NameRegistry>,
}

impl ChildRegistry {
    /// Wraps the shared name registry.
    pub fn new(names: Arc<dyn NameRegistry>) -> Self {
        Self { names }
    }

    /// Binds a child to its server handle.
    ///
    /// Idempotent for identical re-bindings; a key already bound to a
    /// different server is an error.
    pub async fn register_child(
        &self,
        supervisor_id: &str,
        child_id: &str,
        server: &ServerRef,
    ) -> Result<(), SupervisorError> {
        let key = child_key(supervisor_id, child_id);
        self.names.register(&key, server).await.map_err(|cause| {
            SupervisorError::collaborator(
                supervisor_id,
                format!("failed to register child '{child_id}'"),
                cause,
            )
        })
    }

    /// Removes a child binding. No-op when absent.
    pub async fn unregister_child(&self, supervisor_id: &str, child_id: &str) {
        self.names
            .unregister(&child_key(supervisor_id, child_id))
            .await;
    }

    /// Looks up a child binding under the supervisor's namespace.
    pub async fn lookup_child(
        &self,
        supervisor_id: &str,
        child_id: &str,
    ) -> Option<ChildRegistration> {
        let server = self
            .names
            .whereis(&child_key(supervisor_id, child_id))
            .await?;
        Some(ChildRegistration {
            supervisor_id: supervisor_id.into(),
            child_id: child_id.into(),
            node: server.node.clone(),
            server,
        })
    }

    /// Atomically takes ownership of a child binding ahead of a restart.
    ///
    /// Exactly one of any set of concurrent claims for the same binding
    /// gets `Ok(true)`; the rest see `Ok(false)`. A child id found bound
    /// under a *different* supervisor's namespace is reported as
    /// [`SupervisorError::ChildClaim`] — the registry race signal that the
    /// child was already revived elsewhere.
    pub async fn try_claim_child(
        &self,
        supervisor_id: &str,
        child_id: &str,
    ) -> Result<bool, SupervisorError> {
        let key = child_key(supervisor_id, child_id);
        if let Some(bound) = self.names.whereis(&key).await {
            return Ok(self.names.compare_and_remove(&key, &bound).await);
        }

        // Not in our namespace: check whether another supervisor owns it.
        for name in self.names.names().await {
            if let Some((owner, owned_child)) = parse_child_key(&name) {
                if owned_child == child_id && owner != supervisor_id {
                    return Err(SupervisorError::ChildClaim {
                        supervisor_id: supervisor_id.into(),
                        child_id: child_id.into(),
                        owner_supervisor_id: owner.into(),
                    });
                }
            }
        }
        Ok(false)
    }

    /// Enumerates every binding under the supervisor's namespace.
    pub async fn children_for(&self, supervisor_id: &str) -> Vec<ChildRegistration> {
        let prefix = format!("{KEY_PREFIX}:{supervisor_id}:");
        let mut registrations = Vec::new();
        for name in self.names.names().await {
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some((_, child_id)) = parse_child_key(&name) else {
                continue;
            };
            if let Some(server) = self.names.whereis(&name).await {
                registrations.push(ChildRegistration {
                    supervisor_id: supervisor_id.into(),
                    child_id: child_id.into(),
                    node: server.node.clone(),
                    server,
                });
            }
        }
        registrations
    }

    /// Removes every binding under the supervisor's namespace. Used during
    /// supervisor shutdown.
    pub async fn unregister_all(&self, supervisor_id: &str) {
        let prefix = format!("{KEY_PREFIX}:{supervisor_id}:");
        for name in self.names.names().await {
            if name.starts_with(&prefix) {
                self.names.unregister(&name).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;

    fn registry() -> (ChildRegistry, InMemoryCluster) {
        let cluster = InMemoryCluster::new("local");
        (ChildRegistry::new(Arc::new(cluster.clone())), cluster)
    }

    fn server(id: &str) -> ServerRef {
        ServerRef::new(id, NodeId::new("local"))
    }

    #[test]
    fn test_key_round_trip() {
        let key = child_key("dsup_1_abc", "worker-1");
        assert_eq!(key, "dsup:dsup_1_abc:worker-1");
        assert_eq!(parse_child_key(&key), Some(("dsup_1_abc", "worker-1")));
    }

    #[test]
    fn test_key_round_trip_with_colons_in_child_id() {
        let key = child_key("dsup_1_abc", "shard:7:replica");
        assert_eq!(
            parse_child_key(&key),
            Some(("dsup_1_abc", "shard:7:replica"))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(parse_child_key("gproc:x:y"), None);
        assert_eq!(parse_child_key("dsup:only-one-segment"), None);
    }

    #[tokio::test]
    async fn test_register_then_unregister_restores_state() {
        let (registry, _cluster) = registry();
        let s = server("a");

        registry.register_child("s1", "w1", &s).await.unwrap();
        assert!(registry.lookup_child("s1", "w1").await.is_some());

        registry.unregister_child("s1", "w1").await;
        assert!(registry.lookup_child("s1", "w1").await.is_none());

        // Unregistering again is a no-op.
        registry.unregister_child("s1", "w1").await;
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_same_ref() {
        let (registry, _cluster) = registry();
        let s = server("a");

        registry.register_child("s1", "w1", &s).await.unwrap();
        registry.register_child("s1", "w1", &s).await.unwrap();

        let err = registry
            .register_child("s1", "w1", &server("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Supervisor { .. }));
    }

    #[tokio::test]
    async fn test_claim_law_true_then_false() {
        let (registry, _cluster) = registry();
        registry.register_child("s1", "w1", &server("a")).await.unwrap();

        assert!(registry.try_claim_child("s1", "w1").await.unwrap());
        assert!(!registry.try_claim_child("s1", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_absent_child_is_false() {
        let (registry, _cluster) = registry();
        assert!(!registry.try_claim_child("s1", "missing").await.unwrap());
        assert!(!registry.try_claim_child("s1", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_foreign_namespace_reports_owner() {
        let (registry, _cluster) = registry();
        registry.register_child("s2", "w1", &server("a")).await.unwrap();

        let err = registry.try_claim_child("s1", "w1").await.unwrap_err();
        match err {
            SupervisorError::ChildClaim {
                owner_supervisor_id,
                ..
            } => assert_eq!(owner_supervisor_id, "s2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_children_for_enumerates_namespace_only() {
        let (registry, _cluster) = registry();
        registry.register_child("s1", "w1", &server("a")).await.unwrap();
        registry.register_child("s1", "w2", &server("b")).await.unwrap();
        registry.register_child("s10", "w3", &server("c")).await.unwrap();

        let mut children = registry.children_for("s1").await;
        children.sort_by(|a, b| a.child_id.cmp(&b.child_id));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].child_id, "w1");
        assert_eq!(children[1].child_id, "w2");
    }

    #[tokio::test]
    async fn test_unregister_all_clears_namespace() {
        let (registry, _cluster) = registry();
        registry.register_child("s1", "w1", &server("a")).await.unwrap();
        registry.register_child("s1", "w2", &server("b")).await.unwrap();
        registry.register_child("s2", "w1", &server("c")).await.unwrap();

        registry.unregister_all("s1").await;
        assert!(registry.children_for("s1").await.is_empty());
        assert_eq!(registry.children_for("s2").await.len(), 1);
    }
}
