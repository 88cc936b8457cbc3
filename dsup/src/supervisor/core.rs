//! The supervisor state machine.
//!
//! Each supervisor is one logical actor: a tokio task owning the child
//! table and draining an operation queue. Public calls and failure
//! callbacks (child-down, node-down) all enter through that queue, so
//! everything a supervisor does is serialized without locks. Crash and
//! node-down events observed for an incarnation that has already been
//! replaced carry a stale [`ServerRef`] and are discarded on arrival.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

// Layer 3: Internal module imports
use super::events::{global, EventBus, EventHandler, LifecycleEvent, StopReason};
use super::strategy::affected_children;
use super::types::{
    AutoShutdown, ChildInfo, ChildSpec, Phase, Strategy, SupervisorOptions, SupervisorStats,
    SHUTDOWN_POLL_INTERVAL,
};
use crate::cluster::{
    ClusterEnv, ClusterError, DownCallback, ExitReason, NodeId, ServerRef, Subscription,
};
use crate::error::SupervisorError;
use crate::monitor::ChildMonitor;
use crate::registry::ChildRegistry;
use crate::selector::select_node;
use crate::util;

/// Operations flowing through a supervisor's queue.
enum Op {
    StartChild {
        spec: ChildSpec,
        reply: oneshot::Sender<Result<ChildInfo, SupervisorError>>,
    },
    StartTemplateChild {
        args: Vec<Value>,
        reply: oneshot::Sender<Result<ChildInfo, SupervisorError>>,
    },
    TerminateChild {
        child_id: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    RestartChild {
        child_id: String,
        reply: oneshot::Sender<Result<ChildInfo, SupervisorError>>,
    },
    GetChildren {
        reply: oneshot::Sender<Vec<ChildInfo>>,
    },
    GetChild {
        child_id: String,
        reply: oneshot::Sender<Option<ChildInfo>>,
    },
    GetStats {
        reply: oneshot::Sender<SupervisorStats>,
    },
    CountChildren {
        reply: oneshot::Sender<usize>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ChildDown {
        child_id: String,
        server: ServerRef,
        reason: ExitReason,
    },
    NodeDown {
        node: NodeId,
        reason: String,
    },
}

/// Per-child runtime state inside the table.
struct RunningChild {
    spec: ChildSpec,
    server: ServerRef,
    restart_count: u32,
    started_at: DateTime<Utc>,
    last_exit_reason: Option<ExitReason>,
    monitor: Option<ChildMonitor>,
}

impl RunningChild {
    fn info(&self) -> ChildInfo {
        ChildInfo {
            id: self.spec.id.clone(),
            behavior: self.spec.behavior.clone(),
            server: self.server.clone(),
            node: self.server.node.clone(),
            restart: self.spec.restart,
            significant: self.spec.significant,
            restart_count: self.restart_count,
            started_at: self.started_at,
            last_exit_reason: self.last_exit_reason.clone(),
        }
    }
}

/// State shared between the task and its refs.
struct Shared {
    id: String,
    node: NodeId,
    phase: Mutex<Phase>,
    events: EventBus,
}

/// Handle to a running supervisor.
///
/// Cheap to clone; all handles address the same supervisor task. Handles
/// stay valid after the supervisor stops — operations then report the
/// stopped state instead of reaching a task.
#[derive(Clone)]
pub struct SupervisorRef {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Op>,
}

impl std::fmt::Debug for SupervisorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorRef")
            .field("id", &self.shared.id)
            .field("node", &self.shared.node)
            .field("phase", &*self.shared.phase.lock())
            .finish()
    }
}

impl SupervisorRef {
    /// The supervisor id (`dsup_<n>_<base36 timestamp>` unless named).
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Node the supervisor runs on.
    pub fn node(&self) -> &NodeId {
        &self.shared.node
    }

    /// Returns `true` while the supervisor is in its `running` phase.
    pub fn is_running(&self) -> bool {
        self.shared.phase.lock().is_running()
    }

    /// Subscribes to this supervisor's lifecycle events. Delivery is
    /// in emission order; dropping the guard unsubscribes.
    pub fn on_lifecycle_event(&self, handler: EventHandler) -> Subscription {
        self.shared.events.subscribe(handler)
    }

    /// Starts an additional declared child. Not available under
    /// `simple_one_for_one`.
    pub async fn start_child(&self, spec: ChildSpec) -> Result<ChildInfo, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::StartChild { spec, reply }).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Stamps a child out of the `simple_one_for_one` template with a
    /// generated id, passing `args` to the behavior's init.
    pub async fn start_template_child(
        &self,
        args: Vec<Value>,
    ) -> Result<ChildInfo, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::StartTemplateChild { args, reply }).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Gracefully stops a child and removes it from the table.
    pub async fn terminate_child(&self, child_id: &str) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        let op = Op::TerminateChild {
            child_id: child_id.into(),
            reply,
        };
        if self.tx.send(op).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Stop-then-spawn of one child under the same id.
    ///
    /// This is an explicit user action: it does not count against the
    /// restart-intensity window.
    pub async fn restart_child(&self, child_id: &str) -> Result<ChildInfo, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        let op = Op::RestartChild {
            child_id: child_id.into(),
            reply,
        };
        if self.tx.send(op).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Snapshot of all children, in start order. Empty once stopped.
    pub async fn get_children(&self) -> Vec<ChildInfo> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::GetChildren { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of one child.
    pub async fn get_child(&self, child_id: &str) -> Option<ChildInfo> {
        let (reply, rx) = oneshot::channel();
        let op = Op::GetChild {
            child_id: child_id.into(),
            reply,
        };
        if self.tx.send(op).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Aggregate statistics.
    pub async fn get_stats(&self) -> Result<SupervisorStats, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::GetStats { reply }).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.map_err(|_| self.stopped_error())
    }

    /// Number of children in the table. Zero once stopped.
    pub async fn count_children(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::CountChildren { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stops the supervisor: children wind down in reverse start order,
    /// the registry namespace is cleared, `supervisor_stopped` is
    /// emitted. Idempotent — repeated calls return without a second
    /// event.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Op::Stop { reply }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    fn stopped_error(&self) -> SupervisorError {
        SupervisorError::Supervisor {
            supervisor_id: self.shared.id.clone(),
            message: "supervisor is not running".into(),
            cause: None,
        }
    }
}

/// Entry point for starting supervisors.
pub struct Supervisor;

impl Supervisor {
    /// Validates `options`, spawns the declared children in order and
    /// hands the supervisor over to its task.
    ///
    /// Any spawn failure aborts the start: already-spawned children are
    /// stopped in reverse order and their registrations removed — a
    /// supervisor is never left half-started.
    pub async fn start(
        options: SupervisorOptions,
        env: ClusterEnv,
    ) -> Result<SupervisorRef, SupervisorError> {
        let id = options
            .name
            .clone()
            .unwrap_or_else(util::supervisor_id);
        options.validate(&id)?;

        let local = env.local_node();
        for spec in &options.children {
            if !env.behaviors.contains(&spec.behavior) {
                return Err(SupervisorError::BehaviorNotFound {
                    behavior: spec.behavior.clone(),
                    node: local.clone(),
                });
            }
        }
        if let Some(template) = &options.child_template {
            if !env.behaviors.contains(&template.behavior) {
                return Err(SupervisorError::BehaviorNotFound {
                    behavior: template.behavior.clone(),
                    node: local.clone(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: id.clone(),
            node: local,
            phase: Mutex::new(Phase::Starting),
            events: EventBus::new(),
        });

        let declared = options.children.clone();
        let mut state = SupervisorState {
            id,
            options,
            registry: ChildRegistry::new(Arc::clone(&env.names)),
            env,
            children: HashMap::new(),
            start_order: Vec::new(),
            restart_timestamps: Vec::new(),
            total_restarts: 0,
            node_failure_restarts: 0,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            node_down_sub: None,
            shared: Arc::clone(&shared),
            op_tx: tx.clone(),
        };

        // Subscribe before the children's own monitors do: the queue then
        // sees the grouped node-down event ahead of the per-child echoes,
        // which arrive with stale refs and are dropped.
        let down_tx = tx.clone();
        state.node_down_sub = Some(state.env.transport.on_node_down(Arc::new(
            move |node, reason| {
                let _ = down_tx.send(Op::NodeDown {
                    node: node.clone(),
                    reason: reason.into(),
                });
            },
        )));

        for spec in declared {
            if let Err(err) = state.start_fresh_child(spec).await {
                error!(
                    supervisor_id = %state.id,
                    error = %err,
                    "supervisor start aborted; rolling back spawned children"
                );
                state.abort_start().await;
                return Err(err);
            }
        }

        *shared.phase.lock() = Phase::Running;
        state.emit(LifecycleEvent::SupervisorStarted {
            supervisor_id: state.id.clone(),
            node: state.shared.node.clone(),
        });
        info!(
            supervisor_id = %state.id,
            strategy = %state.options.strategy,
            children = state.start_order.len(),
            "supervisor started"
        );

        tokio::spawn(state.run(rx));
        Ok(SupervisorRef { shared, tx })
    }
}

/// Task-owned supervisor state.
struct SupervisorState {
    id: String,
    options: SupervisorOptions,
    env: ClusterEnv,
    registry: ChildRegistry,
    children: HashMap<String, RunningChild>,
    start_order: Vec<String>,
    /// Timestamps of automatic restarts inside the rolling intensity
    /// window; pruned on each restart.
    restart_timestamps: Vec<Instant>,
    total_restarts: u64,
    node_failure_restarts: u64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    node_down_sub: Option<Subscription>,
    shared: Arc<Shared>,
    op_tx: mpsc::UnboundedSender<Op>,
}

impl SupervisorState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = rx.recv().await {
            self.handle_op(op).await;
            if *self.shared.phase.lock() == Phase::Stopped {
                break;
            }
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::StartChild { spec, reply } => {
                let _ = reply.send(self.op_start_child(spec).await);
            }
            Op::StartTemplateChild { args, reply } => {
                let _ = reply.send(self.op_start_template_child(args).await);
            }
            Op::TerminateChild { child_id, reply } => {
                let _ = reply.send(self.op_terminate_child(&child_id).await);
            }
            Op::RestartChild { child_id, reply } => {
                let _ = reply.send(self.op_restart_child(&child_id).await);
            }
            Op::GetChildren { reply } => {
                let _ = reply.send(self.infos());
            }
            Op::GetChild { child_id, reply } => {
                let _ = reply.send(self.children.get(&child_id).map(RunningChild::info));
            }
            Op::GetStats { reply } => {
                let _ = reply.send(self.stats());
            }
            Op::CountChildren { reply } => {
                let _ = reply.send(self.children.len());
            }
            Op::Stop { reply } => {
                self.do_stop(StopReason::Normal).await;
                let _ = reply.send(());
            }
            Op::ChildDown {
                child_id,
                server,
                reason,
            } => {
                self.handle_child_down(&child_id, &server, reason).await;
            }
            Op::NodeDown { node, reason } => {
                self.handle_node_down(&node, &reason).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    async fn op_start_child(&mut self, spec: ChildSpec) -> Result<ChildInfo, SupervisorError> {
        self.ensure_running()?;
        if self.options.strategy == Strategy::SimpleOneForOne {
            return Err(SupervisorError::InvalidSimpleOneForOne {
                supervisor_id: self.id.clone(),
                reason: "simple_one_for_one takes template arguments, not child specs".into(),
            });
        }
        if self.children.contains_key(&spec.id) {
            return Err(SupervisorError::DuplicateChild {
                supervisor_id: self.id.clone(),
                child_id: spec.id,
            });
        }
        self.start_fresh_child(spec).await
    }

    async fn op_start_template_child(
        &mut self,
        args: Vec<Value>,
    ) -> Result<ChildInfo, SupervisorError> {
        self.ensure_running()?;
        if self.options.strategy != Strategy::SimpleOneForOne {
            return Err(SupervisorError::InvalidSimpleOneForOne {
                supervisor_id: self.id.clone(),
                reason: format!(
                    "template children require simple_one_for_one, not {}",
                    self.options.strategy
                ),
            });
        }
        let Some(template) = self.options.child_template.clone() else {
            return Err(SupervisorError::MissingChildTemplate {
                supervisor_id: self.id.clone(),
            });
        };
        let child_id = util::dynamic_child_id(&template.id_prefix);
        let spec = template.instantiate(child_id, args);
        self.start_fresh_child(spec).await
    }

    async fn op_terminate_child(&mut self, child_id: &str) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        if !self.children.contains_key(child_id) {
            return Err(self.child_not_found(child_id));
        }
        self.stop_child_process(child_id).await;
        self.registry.unregister_child(&self.id, child_id).await;
        self.children.remove(child_id);
        self.start_order.retain(|id| id != child_id);
        self.emit(LifecycleEvent::ChildStopped {
            supervisor_id: self.id.clone(),
            child_id: child_id.into(),
            reason: ExitReason::Shutdown,
        });
        info!(supervisor_id = %self.id, child_id, "child terminated");
        Ok(())
    }

    async fn op_restart_child(&mut self, child_id: &str) -> Result<ChildInfo, SupervisorError> {
        self.ensure_running()?;
        if !self.children.contains_key(child_id) {
            return Err(self.child_not_found(child_id));
        }

        self.stop_child_process(child_id).await;
        self.registry.unregister_child(&self.id, child_id).await;

        match self.respawn_child(child_id, None).await {
            Ok((_, node, attempt)) => {
                self.total_restarts += 1;
                self.emit(LifecycleEvent::ChildRestarted {
                    supervisor_id: self.id.clone(),
                    child_id: child_id.into(),
                    node,
                    attempt,
                });
                self.children
                    .get(child_id)
                    .map(RunningChild::info)
                    .ok_or_else(|| self.child_not_found(child_id))
            }
            Err(err) => {
                warn!(
                    supervisor_id = %self.id,
                    child_id,
                    error = %err,
                    "manual restart failed; removing child"
                );
                self.children.remove(child_id);
                self.start_order.retain(|id| id != child_id);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// The crash-handling path. Entered for every down event, whatever
    /// its source; stale events for replaced incarnations are dropped by
    /// ref comparison.
    async fn handle_child_down(
        &mut self,
        child_id: &str,
        server: &ServerRef,
        reason: ExitReason,
    ) {
        if !self.phase().is_running() {
            return;
        }
        let Some(child) = self.children.get_mut(child_id) else {
            return;
        };
        if &child.server != server {
            debug!(
                supervisor_id = %self.id,
                child_id,
                "ignoring down event for a replaced incarnation"
            );
            return;
        }

        child.last_exit_reason = Some(reason.clone());
        if let Some(monitor) = child.monitor.take() {
            monitor.detach(&self.env).await;
        }
        warn!(
            supervisor_id = %self.id,
            child_id,
            reason = %reason,
            "child down"
        );

        let node_failure = reason.is_node_down();
        let excluded = node_failure.then(|| server.node.clone());

        let affected = affected_children(self.options.strategy, &self.start_order, child_id);

        // Stop the surviving members of the affected set, reverse start
        // order. The crashed child is already gone.
        for id in affected.iter().rev() {
            if id != child_id {
                self.stop_child_process(id).await;
            }
        }

        // Evaluate each affected child's restart policy against the
        // propagated exit reason.
        let mut to_restart = Vec::new();
        let mut dropped_significant = false;
        let mut any_dropped = false;
        for id in &affected {
            let Some(child) = self.children.get(id) else {
                continue;
            };
            if child.spec.restart.should_restart(&reason) {
                to_restart.push(id.clone());
            } else {
                dropped_significant |= child.spec.significant;
                any_dropped = true;
                self.drop_child(id, reason.clone()).await;
            }
        }

        for id in &to_restart {
            if !self.record_restart_within_limits() {
                let intensity = self.options.restart_intensity;
                error!(
                    supervisor_id = %self.id,
                    max_restarts = intensity.max_restarts,
                    within_ms = intensity.within.as_millis() as u64,
                    "restart intensity exceeded; stopping supervisor"
                );
                self.do_stop(StopReason::MaxRestartsExceeded).await;
                return;
            }

            match self.registry.try_claim_child(&self.id, id).await {
                Ok(true) => {}
                Ok(false) | Err(SupervisorError::ChildClaim { .. }) => {
                    warn!(
                        supervisor_id = %self.id,
                        child_id = %id,
                        "lost the restart claim; child revived elsewhere"
                    );
                    self.children.remove(id);
                    self.start_order.retain(|c| c != id);
                    continue;
                }
                Err(err) => {
                    warn!(
                        supervisor_id = %self.id,
                        child_id = %id,
                        error = %err,
                        "restart claim failed; dropping child"
                    );
                    dropped_significant |= self.is_significant(id);
                    any_dropped = true;
                    self.drop_child(id, reason.clone()).await;
                    continue;
                }
            }

            match self.respawn_child(id, excluded.as_ref()).await {
                Ok((from_node, to_node, attempt)) => {
                    self.total_restarts += 1;
                    if node_failure {
                        self.node_failure_restarts += 1;
                    }
                    if to_node != from_node {
                        info!(
                            supervisor_id = %self.id,
                            child_id = %id,
                            from_node = %from_node,
                            to_node = %to_node,
                            "child migrated"
                        );
                        self.emit(LifecycleEvent::ChildMigrated {
                            supervisor_id: self.id.clone(),
                            child_id: id.clone(),
                            from_node,
                            to_node,
                        });
                    } else {
                        self.emit(LifecycleEvent::ChildRestarted {
                            supervisor_id: self.id.clone(),
                            child_id: id.clone(),
                            node: to_node,
                            attempt,
                        });
                    }
                }
                Err(err) => {
                    error!(
                        supervisor_id = %self.id,
                        child_id = %id,
                        error = %err,
                        "restart failed; dropping child"
                    );
                    dropped_significant |= self.is_significant(id);
                    any_dropped = true;
                    self.drop_child(id, ExitReason::error(err.to_string())).await;
                }
            }
        }

        if any_dropped {
            self.evaluate_auto_shutdown(dropped_significant).await;
        }
    }

    /// Node-failure migration: every child on the failed node goes
    /// through the standard crash path with the failed node excluded
    /// from placement.
    async fn handle_node_down(&mut self, node: &NodeId, reason: &str) {
        if !self.phase().is_running() {
            return;
        }
        let affected: Vec<(String, ServerRef)> = self
            .start_order
            .iter()
            .filter_map(|id| {
                self.children
                    .get(id)
                    .filter(|child| child.server.is_on(node))
                    .map(|child| (id.clone(), child.server.clone()))
            })
            .collect();
        if affected.is_empty() {
            return;
        }

        warn!(
            supervisor_id = %self.id,
            node = %node,
            affected = affected.len(),
            reason,
            "node failure detected"
        );
        self.emit(LifecycleEvent::NodeFailureDetected {
            supervisor_id: self.id.clone(),
            node: node.clone(),
            affected_children: affected.iter().map(|(id, _)| id.clone()).collect(),
        });

        for (child_id, server) in affected {
            self.handle_child_down(&child_id, &server, ExitReason::node_down(reason))
                .await;
            if !self.phase().is_running() {
                break;
            }
        }
    }

    async fn evaluate_auto_shutdown(&mut self, dropped_significant: bool) {
        if !dropped_significant {
            return;
        }
        let stop = match self.options.auto_shutdown {
            AutoShutdown::Never => false,
            AutoShutdown::AnySignificant => true,
            AutoShutdown::AllSignificant => !self
                .children
                .values()
                .any(|child| child.spec.significant),
        };
        if stop {
            info!(
                supervisor_id = %self.id,
                "auto-shutdown after loss of significant children"
            );
            self.do_stop(StopReason::Normal).await;
        }
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    /// Spawns, registers and monitors a brand-new child, then appends it
    /// to the table. Steps that fail undo their predecessors in reverse.
    async fn start_fresh_child(&mut self, spec: ChildSpec) -> Result<ChildInfo, SupervisorError> {
        let server = self.spawn_server(&spec, None).await?;

        if let Err(err) = self
            .registry
            .register_child(&self.id, &spec.id, &server)
            .await
        {
            let _ = self
                .env
                .runtime
                .force_terminate(&server, ExitReason::Shutdown)
                .await;
            return Err(err);
        }

        let monitor = match self.install_monitor(&spec.id, &server).await {
            Ok(monitor) => monitor,
            Err(cause) => {
                self.registry.unregister_child(&self.id, &spec.id).await;
                let _ = self
                    .env
                    .runtime
                    .force_terminate(&server, ExitReason::Shutdown)
                    .await;
                return Err(SupervisorError::collaborator(
                    &self.id,
                    format!("failed to monitor child '{}'", spec.id),
                    cause,
                ));
            }
        };

        let child_id = spec.id.clone();
        let child = RunningChild {
            spec,
            server: server.clone(),
            restart_count: 0,
            started_at: Utc::now(),
            last_exit_reason: None,
            monitor: Some(monitor),
        };
        let info = child.info();
        self.children.insert(child_id.clone(), child);
        self.start_order.push(child_id.clone());

        debug!(
            supervisor_id = %self.id,
            child_id = %child_id,
            node = %server.node,
            "child started"
        );
        self.emit(LifecycleEvent::ChildStarted {
            supervisor_id: self.id.clone(),
            child_id,
            node: server.node,
        });
        Ok(info)
    }

    /// Replaces a tabled child's dead incarnation with a fresh one under
    /// the same id. Returns `(old node, new node, attempt)`.
    async fn respawn_child(
        &mut self,
        child_id: &str,
        excluded: Option<&NodeId>,
    ) -> Result<(NodeId, NodeId, u32), SupervisorError> {
        let (spec, old_node) = {
            let child = self
                .children
                .get(child_id)
                .ok_or_else(|| self.child_not_found(child_id))?;
            (child.spec.clone(), child.server.node.clone())
        };

        let server = self.spawn_server(&spec, excluded).await?;

        if let Err(err) = self
            .registry
            .register_child(&self.id, child_id, &server)
            .await
        {
            let _ = self
                .env
                .runtime
                .force_terminate(&server, ExitReason::Shutdown)
                .await;
            return Err(err);
        }

        let monitor = match self.install_monitor(child_id, &server).await {
            Ok(monitor) => monitor,
            Err(cause) => {
                self.registry.unregister_child(&self.id, child_id).await;
                let _ = self
                    .env
                    .runtime
                    .force_terminate(&server, ExitReason::Shutdown)
                    .await;
                return Err(SupervisorError::collaborator(
                    &self.id,
                    format!("failed to monitor child '{child_id}'"),
                    cause,
                ));
            }
        };

        let child = self
            .children
            .get_mut(child_id)
            .ok_or_else(|| SupervisorError::ChildNotFound {
                supervisor_id: self.id.clone(),
                child_id: child_id.into(),
            })?;
        child.restart_count += 1;
        child.started_at = Utc::now();
        child.monitor = Some(monitor);
        let new_node = server.node.clone();
        child.server = server;
        Ok((old_node, new_node, child.restart_count))
    }

    /// Placement plus the actual start, bounded by the spawn timeout.
    async fn spawn_server(
        &self,
        spec: &ChildSpec,
        excluded: Option<&NodeId>,
    ) -> Result<ServerRef, SupervisorError> {
        let local = self.env.local_node();
        if !self.env.behaviors.contains(&spec.behavior) {
            return Err(SupervisorError::BehaviorNotFound {
                behavior: spec.behavior.clone(),
                node: local,
            });
        }

        let selector = spec
            .node_selector
            .as_ref()
            .unwrap_or(&self.options.node_selector);
        let connected = self.env.transport.connected_nodes();
        let target = select_node(selector, &spec.id, &local, &connected, excluded)?;

        let spawn = async {
            if target == local {
                let behavior = self.env.behaviors.get(&spec.behavior).ok_or_else(|| {
                    ClusterError::BehaviorNotFound {
                        behavior: spec.behavior.clone(),
                        node: local.clone(),
                    }
                })?;
                self.env.runtime.start(behavior, spec.args.clone()).await
            } else {
                self.env
                    .spawner
                    .spawn(&spec.behavior, &target, spec.args.clone())
                    .await
            }
        };

        match timeout(self.options.spawn_timeout, spawn).await {
            Ok(Ok(server)) => Ok(server),
            Ok(Err(cause)) => Err(self.map_cluster_err(
                format!("failed to spawn child '{}'", spec.id),
                cause,
            )),
            Err(_) => Err(SupervisorError::Supervisor {
                supervisor_id: self.id.clone(),
                message: format!(
                    "spawn of child '{}' timed out after {:?}",
                    spec.id, self.options.spawn_timeout
                ),
                cause: None,
            }),
        }
    }

    async fn install_monitor(
        &self,
        child_id: &str,
        server: &ServerRef,
    ) -> Result<ChildMonitor, ClusterError> {
        let tx = self.op_tx.clone();
        let child_id = child_id.to_string();
        let watched = server.clone();
        let on_down: DownCallback = Arc::new(move |reason| {
            let _ = tx.send(Op::ChildDown {
                child_id: child_id.clone(),
                server: watched.clone(),
                reason,
            });
        });
        ChildMonitor::attach(&self.env, server, on_down).await
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Per-child shutdown protocol: detach the monitor first, request a
    /// graceful stop, poll until the child is gone or its timeout
    /// elapses, then force-terminate.
    async fn stop_child_process(&mut self, child_id: &str) {
        let Some(child) = self.children.get_mut(child_id) else {
            return;
        };
        let monitor = child.monitor.take();
        let server = child.server.clone();
        let shutdown_timeout = child.spec.shutdown_timeout;

        if let Some(monitor) = monitor {
            monitor.detach(&self.env).await;
        }

        if !self.env.runtime.is_running(&server).await {
            return;
        }
        let _ = self.env.runtime.stop(&server, ExitReason::Shutdown).await;

        let deadline = Instant::now() + shutdown_timeout;
        while self.env.runtime.is_running(&server).await {
            if Instant::now() >= deadline {
                warn!(
                    supervisor_id = %self.id,
                    child_id,
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "graceful stop timed out; force-terminating"
                );
                let _ = self
                    .env
                    .runtime
                    .force_terminate(&server, ExitReason::Shutdown)
                    .await;
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    async fn do_stop(&mut self, reason: StopReason) {
        {
            let mut phase = self.shared.phase.lock();
            if matches!(*phase, Phase::ShuttingDown | Phase::Stopped) {
                return;
            }
            *phase = Phase::ShuttingDown;
        }
        info!(supervisor_id = %self.id, reason = ?reason, "supervisor stopping");

        // No node-down handling from here on.
        self.node_down_sub.take();

        let order: Vec<String> = self.start_order.iter().rev().cloned().collect();
        for child_id in order {
            self.stop_child_process(&child_id).await;
            self.children.remove(&child_id);
        }
        self.start_order.clear();
        self.registry.unregister_all(&self.id).await;

        self.emit(LifecycleEvent::SupervisorStopped {
            supervisor_id: self.id.clone(),
            reason,
        });
        *self.shared.phase.lock() = Phase::Stopped;
    }

    /// Rollback for a failed `start`: tear down what was spawned, in
    /// reverse order, without emitting lifecycle events.
    async fn abort_start(&mut self) {
        *self.shared.phase.lock() = Phase::ShuttingDown;
        self.node_down_sub.take();
        let order: Vec<String> = self.start_order.iter().rev().cloned().collect();
        for child_id in order {
            self.stop_child_process(&child_id).await;
            self.registry.unregister_child(&self.id, &child_id).await;
            self.children.remove(&child_id);
        }
        self.start_order.clear();
        *self.shared.phase.lock() = Phase::Stopped;
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Records an automatic restart in the rolling window and prunes
    /// expired entries. Returns `false` once the window holds more than
    /// `max_restarts` entries.
    fn record_restart_within_limits(&mut self) -> bool {
        let now = Instant::now();
        let window = self.options.restart_intensity.within;
        self.restart_timestamps.push(now);
        self.restart_timestamps
            .retain(|t| now.duration_since(*t) <= window);
        self.restart_timestamps.len() as u64 <= u64::from(self.options.restart_intensity.max_restarts)
    }

    async fn drop_child(&mut self, child_id: &str, reason: ExitReason) {
        self.registry.unregister_child(&self.id, child_id).await;
        self.children.remove(child_id);
        self.start_order.retain(|id| id != child_id);
        self.emit(LifecycleEvent::ChildStopped {
            supervisor_id: self.id.clone(),
            child_id: child_id.into(),
            reason,
        });
    }

    fn is_significant(&self, child_id: &str) -> bool {
        self.children
            .get(child_id)
            .map(|child| child.spec.significant)
            .unwrap_or(false)
    }

    fn infos(&self) -> Vec<ChildInfo> {
        self.start_order
            .iter()
            .filter_map(|id| self.children.get(id).map(RunningChild::info))
            .collect()
    }

    fn stats(&self) -> SupervisorStats {
        let mut children_by_node: HashMap<NodeId, usize> = HashMap::new();
        for child in self.children.values() {
            *children_by_node.entry(child.server.node.clone()).or_insert(0) += 1;
        }
        SupervisorStats {
            id: self.id.clone(),
            strategy: self.options.strategy,
            child_count: self.children.len(),
            children_by_node,
            total_restarts: self.total_restarts,
            node_failure_restarts: self.node_failure_restarts,
            started_at: self.started_at,
            uptime: self.started_instant.elapsed(),
        }
    }

    fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    fn ensure_running(&self) -> Result<(), SupervisorError> {
        if self.phase().is_running() {
            Ok(())
        } else {
            Err(SupervisorError::Supervisor {
                supervisor_id: self.id.clone(),
                message: "supervisor is not running".into(),
                cause: None,
            })
        }
    }

    fn child_not_found(&self, child_id: &str) -> SupervisorError {
        SupervisorError::ChildNotFound {
            supervisor_id: self.id.clone(),
            child_id: child_id.into(),
        }
    }

    fn map_cluster_err(&self, message: String, cause: ClusterError) -> SupervisorError {
        match cause {
            ClusterError::BehaviorNotFound { behavior, node } => {
                SupervisorError::BehaviorNotFound { behavior, node }
            }
            other => SupervisorError::Supervisor {
                supervisor_id: self.id.clone(),
                message,
                cause: Some(other),
            },
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.shared.events.emit(&event);
        global().emit(&event);
    }
}
