//! Child placement policy.
//!
//! A [`NodeSelector`] decides which cluster member hosts a child. The
//! module is pure policy: it sees the membership view handed to it and
//! returns a node, with one process-wide counter backing the round-robin
//! strategy. Migration after a node failure passes the failed node as
//! `excluded`, so the policy never has to know about failures.

// Layer 1: Standard library imports
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use rand::Rng;

// Layer 3: Internal module imports
use crate::cluster::{NodeId, NodeInfo};
use crate::error::SupervisorError;

/// Process-wide round-robin cursor.
///
/// Deliberately not per-supervisor: a single counter spreads children
/// across the cluster well enough without any coordination.
static ROUND_ROBIN: AtomicUsize = AtomicUsize::new(0);

/// Signature of a user-supplied placement function.
///
/// Invoked with the filtered candidate list and the child id; the
/// returned node must be one of the candidates — the caller does not
/// re-validate.
pub type SelectorFn = Arc<dyn Fn(&[NodeInfo], &str) -> NodeId + Send + Sync>;

/// Placement strategy for supervised children.
#[derive(Clone)]
pub enum NodeSelector {
    /// Prefer the local node; fall back to the first connected remote in
    /// `NodeId` order.
    LocalFirst,

    /// Cycle through the candidates using the process-wide cursor.
    RoundRobin,

    /// Pick the candidate with the lowest `process_count`; ties break by
    /// `NodeId` order.
    LeastLoaded,

    /// Uniform random choice over the candidates.
    Random,

    /// Pin to one node; placement fails when it is excluded or not
    /// connected.
    Pinned(NodeId),

    /// User-supplied placement function.
    Custom(SelectorFn),
}

impl Default for NodeSelector {
    fn default() -> Self {
        NodeSelector::LocalFirst
    }
}

impl fmt::Debug for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelector::LocalFirst => write!(f, "local_first"),
            NodeSelector::RoundRobin => write!(f, "round_robin"),
            NodeSelector::LeastLoaded => write!(f, "least_loaded"),
            NodeSelector::Random => write!(f, "random"),
            NodeSelector::Pinned(node) => write!(f, "node:{node}"),
            NodeSelector::Custom(_) => write!(f, "custom"),
        }
    }
}

/// Selects the node a child should be spawned on.
///
/// The candidate list is the local node plus every `connected` entry with
/// status `Connected`, minus `excluded`: local first, then remotes in
/// ascending `NodeId` order. The membership view need not include the
/// local node; when it does not, a synthetic entry with `process_count`
/// zero stands in for it.
///
/// # Errors
///
/// [`SupervisorError::NoAvailableNode`] when the candidate list is empty
/// or a pinned node is unavailable.
pub fn select_node(
    selector: &NodeSelector,
    child_id: &str,
    local: &NodeId,
    connected: &[NodeInfo],
    excluded: Option<&NodeId>,
) -> Result<NodeId, SupervisorError> {
    let candidates = candidates(local, connected, excluded);
    if candidates.is_empty() {
        return Err(no_node(child_id, selector));
    }

    match selector {
        NodeSelector::LocalFirst => Ok(candidates[0].id.clone()),
        NodeSelector::RoundRobin => {
            let cursor = ROUND_ROBIN.fetch_add(1, Ordering::Relaxed);
            Ok(candidates[cursor % candidates.len()].id.clone())
        }
        NodeSelector::LeastLoaded => candidates
            .iter()
            .min_by(|a, b| {
                a.process_count
                    .cmp(&b.process_count)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|info| info.id.clone())
            .ok_or_else(|| no_node(child_id, selector)),
        NodeSelector::Random => {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            Ok(candidates[index].id.clone())
        }
        NodeSelector::Pinned(node) => {
            if candidates.iter().any(|info| &info.id == node) {
                Ok(node.clone())
            } else {
                Err(no_node(child_id, selector))
            }
        }
        NodeSelector::Custom(select) => Ok(select(&candidates, child_id)),
    }
}

/// Builds the candidate list: local node first, then connected remotes in
/// `NodeId` order, minus the excluded node.
fn candidates(local: &NodeId, connected: &[NodeInfo], excluded: Option<&NodeId>) -> Vec<NodeInfo> {
    let mut list: Vec<NodeInfo> = Vec::with_capacity(connected.len() + 1);

    if excluded != Some(local) {
        let entry = connected
            .iter()
            .find(|info| &info.id == local)
            .cloned()
            .unwrap_or_else(|| NodeInfo::connected(local.clone(), "", 0));
        list.push(entry);
    }

    let mut remotes: Vec<NodeInfo> = connected
        .iter()
        .filter(|info| info.is_connected())
        .filter(|info| &info.id != local)
        .filter(|info| Some(&info.id) != excluded)
        .cloned()
        .collect();
    remotes.sort_by(|a, b| a.id.cmp(&b.id));
    list.extend(remotes);
    list
}

fn no_node(child_id: &str, selector: &NodeSelector) -> SupervisorError {
    SupervisorError::NoAvailableNode {
        child_id: child_id.into(),
        selector: selector.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cluster::NodeStatus;

    fn node(id: &str, load: usize) -> NodeInfo {
        let mut info = NodeInfo::connected(NodeId::new(id), "127.0.0.1", 4400);
        info.process_count = load;
        info
    }

    fn disconnected(id: &str) -> NodeInfo {
        let mut info = node(id, 0);
        info.status = NodeStatus::Disconnected;
        info
    }

    #[test]
    fn test_local_first_prefers_local() {
        let local = NodeId::new("local");
        let view = vec![node("node-a", 0), node("node-b", 0)];
        let picked =
            select_node(&NodeSelector::LocalFirst, "w1", &local, &view, None).unwrap();
        assert_eq!(picked, local);
    }

    #[test]
    fn test_local_first_excluded_falls_back_to_first_remote() {
        let local = NodeId::new("local");
        let view = vec![node("node-b", 0), node("node-a", 0)];
        let picked =
            select_node(&NodeSelector::LocalFirst, "w1", &local, &view, Some(&local)).unwrap();
        assert_eq!(picked, NodeId::new("node-a"));
    }

    #[test]
    fn test_local_first_with_empty_view_selects_local() {
        let local = NodeId::new("local");
        let picked = select_node(&NodeSelector::LocalFirst, "w1", &local, &[], None).unwrap();
        assert_eq!(picked, local);
    }

    #[test]
    fn test_excluded_local_with_no_remotes_fails() {
        let local = NodeId::new("local");
        let err =
            select_node(&NodeSelector::LocalFirst, "w1", &local, &[], Some(&local)).unwrap_err();
        match err {
            SupervisorError::NoAvailableNode { child_id, selector } => {
                assert_eq!(child_id, "w1");
                assert_eq!(selector, "local_first");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_every_strategy_fails_on_empty_candidates() {
        let local = NodeId::new("local");
        for selector in [
            NodeSelector::RoundRobin,
            NodeSelector::LeastLoaded,
            NodeSelector::Random,
            NodeSelector::Pinned(NodeId::new("node-a")),
        ] {
            let err = select_node(&selector, "w1", &local, &[], Some(&local)).unwrap_err();
            assert!(
                matches!(err, SupervisorError::NoAvailableNode { .. }),
                "{selector} should fail without candidates"
            );
        }
    }

    #[test]
    fn test_disconnected_nodes_are_not_candidates() {
        let local = NodeId::new("local");
        let view = vec![disconnected("node-a"), node("node-b", 0)];
        let picked = select_node(
            &NodeSelector::Pinned(NodeId::new("node-a")),
            "w1",
            &local,
            &view,
            None,
        );
        assert!(picked.is_err());
    }

    #[test]
    fn test_round_robin_cycles_in_candidate_order() {
        let local = NodeId::new("local");
        let view = vec![node("node-a", 0), node("node-b", 0)];
        let order = vec![
            local.clone(),
            NodeId::new("node-a"),
            NodeId::new("node-b"),
        ];

        // The cursor is process-wide, so assert cycle consistency rather
        // than absolute positions.
        let first = select_node(&NodeSelector::RoundRobin, "w", &local, &view, None).unwrap();
        let start = order.iter().position(|n| n == &first).unwrap();
        for step in 1..6 {
            let picked =
                select_node(&NodeSelector::RoundRobin, "w", &local, &view, None).unwrap();
            assert_eq!(picked, order[(start + step) % order.len()]);
        }
    }

    #[test]
    fn test_least_loaded_breaks_ties_by_node_id() {
        let local = NodeId::new("z-local");
        let view = vec![node("node-b", 2), node("node-a", 1), node("node-c", 1)];
        let picked =
            select_node(&NodeSelector::LeastLoaded, "w1", &local, &view, None).unwrap();
        // local (synthetic, load 0) wins outright.
        assert_eq!(picked, local);

        let picked = select_node(
            &NodeSelector::LeastLoaded,
            "w1",
            &local,
            &view,
            Some(&local),
        )
        .unwrap();
        assert_eq!(picked, NodeId::new("node-a"));
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let local = NodeId::new("local");
        let view = vec![node("node-a", 0)];
        for _ in 0..20 {
            let picked =
                select_node(&NodeSelector::Random, "w1", &local, &view, None).unwrap();
            assert!(picked == local || picked == NodeId::new("node-a"));
        }
    }

    #[test]
    fn test_pinned_node_honored_and_excluded() {
        let local = NodeId::new("local");
        let target = NodeId::new("node-a");
        let view = vec![node("node-a", 0)];

        let picked = select_node(
            &NodeSelector::Pinned(target.clone()),
            "w1",
            &local,
            &view,
            None,
        )
        .unwrap();
        assert_eq!(picked, target);

        let err = select_node(
            &NodeSelector::Pinned(target.clone()),
            "w1",
            &local,
            &view,
            Some(&target),
        )
        .unwrap_err();
        assert!(matches!(err, SupervisorError::NoAvailableNode { .. }));
    }

    #[test]
    fn test_custom_selector_sees_filtered_candidates() {
        let local = NodeId::new("local");
        let view = vec![node("node-a", 0), node("node-b", 0)];
        let selector = NodeSelector::Custom(Arc::new(|candidates, child_id| {
            assert_eq!(child_id, "w1");
            candidates[candidates.len() - 1].id.clone()
        }));
        let picked = select_node(&selector, "w1", &local, &view, None).unwrap();
        assert_eq!(picked, NodeId::new("node-b"));
    }

    #[test]
    fn test_selector_display_names() {
        assert_eq!(NodeSelector::LocalFirst.to_string(), "local_first");
        assert_eq!(NodeSelector::RoundRobin.to_string(), "round_robin");
        assert_eq!(
            NodeSelector::Pinned(NodeId::new("node-a")).to_string(),
            "node:node-a"
        );
    }
}
