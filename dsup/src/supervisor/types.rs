//! Type definitions for the supervision core.
//!
//! Child specifications, restart policies and intensity limits, supervisor
//! options with their validation rules, and the read-only snapshots
//! (`ChildInfo`, `SupervisorStats`) returned by the inspection operations.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Layer 3: Internal module imports
use crate::cluster::{ExitReason, NodeId, ServerRef};
use crate::error::SupervisorError;
use crate::selector::NodeSelector;
use crate::util::duration_millis;

/// Default time allowed for a child's graceful stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for a spawn (local init or remote-spawn RPC).
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a child to wind down.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Restart policy for supervised children.
///
/// Determines whether a child is restarted for a given exit reason. Based
/// on the OTP policies of the same names.
///
/// # Examples
///
/// ```rust
/// use dsup::cluster::ExitReason;
/// use dsup::supervisor::RestartPolicy;
///
/// assert!(RestartPolicy::Permanent.should_restart(&ExitReason::Normal));
/// assert!(!RestartPolicy::Transient.should_restart(&ExitReason::Normal));
/// assert!(RestartPolicy::Transient.should_restart(&ExitReason::error("boom")));
/// assert!(!RestartPolicy::Temporary.should_restart(&ExitReason::error("boom")));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always restart, regardless of exit reason.
    Permanent,

    /// Restart only on abnormal exits. A node failure counts as abnormal.
    Transient,

    /// Never restart.
    Temporary,
}

impl RestartPolicy {
    /// Returns `true` if this policy restarts a child that exited with
    /// `reason`.
    pub fn should_restart(&self, reason: &ExitReason) -> bool {
        match self {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => reason.is_abnormal(),
            RestartPolicy::Temporary => false,
        }
    }
}

/// Restart strategy of a supervisor.
///
/// Selected from options data rather than at the type level: supervisors
/// are routinely built from configuration, and the strategy only changes
/// which *set* of children a crash affects (see
/// [`strategy::affected_children`](super::strategy::affected_children)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Restart only the crashed child.
    OneForOne,

    /// Stop all children (reverse start order), then start all (start
    /// order).
    OneForAll,

    /// Stop the crashed child and every child started after it, then
    /// start them back in order.
    RestForOne,

    /// Like `OneForOne`, but every child is stamped out of one template
    /// with a generated id.
    SimpleOneForOne,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::OneForOne => "one_for_one",
            Strategy::OneForAll => "one_for_all",
            Strategy::RestForOne => "rest_for_one",
            Strategy::SimpleOneForOne => "simple_one_for_one",
        };
        write!(f, "{name}")
    }
}

/// When a supervisor stops itself after losing children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoShutdown {
    /// Never self-stop on child removal.
    Never,

    /// Self-stop once any significant child is permanently removed.
    AnySignificant,

    /// Self-stop once no significant children remain.
    AllSignificant,
}

/// Ceiling on automatic restarts: more than `max_restarts` within
/// `within` stops the supervisor with `max_restarts_exceeded`.
///
/// Only automatic crash-recovery restarts count; explicit
/// `restart_child` calls do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartIntensity {
    /// Maximum automatic restarts inside the window.
    pub max_restarts: u32,

    /// Rolling window length.
    #[serde(with = "duration_millis")]
    pub within: Duration,
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            within: Duration::from_secs(60),
        }
    }
}

/// Static declaration of one supervised child.
#[derive(Clone)]
pub struct ChildSpec {
    /// Unique name within the supervisor's namespace. May contain `:`
    /// (the registry key format tolerates it), though plain names are
    /// recommended.
    pub id: String,

    /// Behavior name, resolved through the behavior registry at spawn.
    pub behavior: String,

    /// Arguments passed to the behavior's init.
    pub args: Vec<Value>,

    /// Restart policy.
    pub restart: RestartPolicy,

    /// Per-child placement override. Falls back to the supervisor's
    /// selector when unset.
    pub node_selector: Option<NodeSelector>,

    /// Time allowed for a graceful stop before forced termination.
    pub shutdown_timeout: Duration,

    /// Marks the child as load-bearing for the auto-shutdown policy.
    pub significant: bool,
}

impl ChildSpec {
    /// Creates a spec with defaults: permanent restart, 5 s shutdown
    /// timeout, not significant, supervisor-level placement.
    pub fn new(id: impl Into<String>, behavior: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            behavior: behavior.into(),
            args: Vec::new(),
            restart: RestartPolicy::Permanent,
            node_selector: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            significant: false,
        }
    }

    /// Sets the behavior arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets the restart policy.
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Pins this child's placement.
    pub fn with_node_selector(mut self, selector: NodeSelector) -> Self {
        self.node_selector = Some(selector);
        self
    }

    /// Sets the graceful-stop timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Marks the child significant for auto-shutdown.
    pub fn significant(mut self) -> Self {
        self.significant = true;
        self
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("behavior", &self.behavior)
            .field("restart", &self.restart)
            .field("significant", &self.significant)
            .finish()
    }
}

/// A [`ChildSpec`] without an id, used by `simple_one_for_one` to stamp
/// out uniform workers with generated ids.
#[derive(Clone)]
pub struct ChildTemplate {
    /// Behavior name for every stamped child.
    pub behavior: String,

    /// Base arguments; `start_template_child` arguments replace these per
    /// child.
    pub args: Vec<Value>,

    /// Restart policy applied to every stamped child.
    pub restart: RestartPolicy,

    /// Placement override for stamped children.
    pub node_selector: Option<NodeSelector>,

    /// Graceful-stop timeout for stamped children.
    pub shutdown_timeout: Duration,

    /// Significance flag for stamped children.
    pub significant: bool,

    /// Prefix of generated child ids
    /// (`<prefix>_<monotonic>_<base36 timestamp>`).
    pub id_prefix: String,
}

impl ChildTemplate {
    /// Creates a template with the same defaults as [`ChildSpec::new`]
    /// and id prefix `child`.
    pub fn new(behavior: impl Into<String>) -> Self {
        Self {
            behavior: behavior.into(),
            args: Vec::new(),
            restart: RestartPolicy::Permanent,
            node_selector: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            significant: false,
            id_prefix: "child".into(),
        }
    }

    /// Sets the base arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets the restart policy.
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Sets the generated-id prefix.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Instantiates the template as a spec with the given id and
    /// per-child arguments.
    pub fn instantiate(&self, id: String, args: Vec<Value>) -> ChildSpec {
        ChildSpec {
            id,
            behavior: self.behavior.clone(),
            args: if args.is_empty() {
                self.args.clone()
            } else {
                args
            },
            restart: self.restart,
            node_selector: self.node_selector.clone(),
            shutdown_timeout: self.shutdown_timeout,
            significant: self.significant,
        }
    }
}

impl fmt::Debug for ChildTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildTemplate")
            .field("behavior", &self.behavior)
            .field("restart", &self.restart)
            .field("id_prefix", &self.id_prefix)
            .finish()
    }
}

/// Configuration of one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Restart strategy.
    pub strategy: Strategy,

    /// Default placement for children without their own selector.
    pub node_selector: NodeSelector,

    /// Declared children, spawned in order at start. Must be empty for
    /// `simple_one_for_one`.
    pub children: Vec<ChildSpec>,

    /// Template for `simple_one_for_one`; must be unset for every other
    /// strategy.
    pub child_template: Option<ChildTemplate>,

    /// Automatic-restart ceiling.
    pub restart_intensity: RestartIntensity,

    /// Self-stop policy on loss of significant children.
    pub auto_shutdown: AutoShutdown,

    /// Optional stable supervisor id. Generated
    /// (`dsup_<n>_<base36 timestamp>`) when unset. Must not contain `:`.
    pub name: Option<String>,

    /// Time allowed for each spawn.
    pub spawn_timeout: Duration,
}

impl SupervisorOptions {
    /// Creates options with defaults: local-first placement, 5 restarts
    /// per 60 s, no auto-shutdown, 10 s spawn timeout.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            node_selector: NodeSelector::LocalFirst,
            children: Vec::new(),
            child_template: None,
            restart_intensity: RestartIntensity::default(),
            auto_shutdown: AutoShutdown::Never,
            name: None,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }

    /// Appends a declared child.
    pub fn with_child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    /// Replaces the declared children.
    pub fn with_children(mut self, children: Vec<ChildSpec>) -> Self {
        self.children = children;
        self
    }

    /// Sets the `simple_one_for_one` template.
    pub fn with_template(mut self, template: ChildTemplate) -> Self {
        self.child_template = Some(template);
        self
    }

    /// Sets the supervisor-level placement.
    pub fn with_node_selector(mut self, selector: NodeSelector) -> Self {
        self.node_selector = selector;
        self
    }

    /// Sets the restart-intensity ceiling.
    pub fn with_restart_intensity(mut self, max_restarts: u32, within: Duration) -> Self {
        self.restart_intensity = RestartIntensity {
            max_restarts,
            within,
        };
        self
    }

    /// Sets the auto-shutdown policy.
    pub fn with_auto_shutdown(mut self, auto_shutdown: AutoShutdown) -> Self {
        self.auto_shutdown = auto_shutdown;
        self
    }

    /// Sets a stable supervisor id.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the spawn timeout.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Validates strategy/template coherence, id uniqueness and the
    /// intensity window.
    pub fn validate(&self, supervisor_id: &str) -> Result<(), SupervisorError> {
        if let Some(name) = &self.name {
            if name.contains(':') {
                return Err(SupervisorError::InvalidConfiguration {
                    supervisor_id: supervisor_id.into(),
                    reason: "supervisor names must not contain ':'".into(),
                });
            }
        }

        if self.restart_intensity.within.is_zero() {
            return Err(SupervisorError::InvalidConfiguration {
                supervisor_id: supervisor_id.into(),
                reason: "restart intensity window must be positive".into(),
            });
        }

        match self.strategy {
            Strategy::SimpleOneForOne => {
                if self.child_template.is_none() {
                    return Err(SupervisorError::MissingChildTemplate {
                        supervisor_id: supervisor_id.into(),
                    });
                }
                if !self.children.is_empty() {
                    return Err(SupervisorError::InvalidSimpleOneForOne {
                        supervisor_id: supervisor_id.into(),
                        reason: "simple_one_for_one supervisors declare no static children"
                            .into(),
                    });
                }
            }
            _ => {
                if self.child_template.is_some() {
                    return Err(SupervisorError::InvalidSimpleOneForOne {
                        supervisor_id: supervisor_id.into(),
                        reason: format!(
                            "child templates are only valid with simple_one_for_one, not {}",
                            self.strategy
                        ),
                    });
                }
            }
        }

        let mut seen = HashMap::new();
        for spec in &self.children {
            if seen.insert(spec.id.as_str(), ()).is_some() {
                return Err(SupervisorError::DuplicateChild {
                    supervisor_id: supervisor_id.into(),
                    child_id: spec.id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Lifecycle phase of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Spawning declared children.
    Starting,

    /// Serving operations and reacting to failures.
    Running,

    /// Winding down; crash and node-down events are ignored.
    ShuttingDown,

    /// Done. The operation queue is closed.
    Stopped,
}

impl Phase {
    /// Returns `true` while the supervisor accepts failure events.
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Running)
    }
}

/// Read-only snapshot of one supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    /// Child id.
    pub id: String,

    /// Behavior name.
    pub behavior: String,

    /// Current server handle.
    pub server: ServerRef,

    /// Node the child runs on.
    pub node: NodeId,

    /// Restart policy.
    pub restart: RestartPolicy,

    /// Significance flag.
    pub significant: bool,

    /// Monotonic restart counter. Survives manual stop/start cycles.
    pub restart_count: u32,

    /// When the current incarnation started.
    pub started_at: DateTime<Utc>,

    /// Exit reason of the previous incarnation, if any.
    pub last_exit_reason: Option<ExitReason>,
}

/// Aggregate statistics of one supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    /// Supervisor id.
    pub id: String,

    /// Active strategy.
    pub strategy: Strategy,

    /// Children currently in the table.
    pub child_count: usize,

    /// Children per hosting node.
    pub children_by_node: HashMap<NodeId, usize>,

    /// Automatic and manual restarts performed over the supervisor's
    /// lifetime.
    pub total_restarts: u64,

    /// Restarts caused by node failures.
    pub node_failure_restarts: u64,

    /// When the supervisor started.
    pub started_at: DateTime<Utc>,

    /// Time since start.
    #[serde(with = "duration_millis")]
    pub uptime: Duration,
}
