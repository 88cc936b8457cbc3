//! Cluster-aware supervision of generic servers.
//!
//! A supervisor owns a table of child specifications, spawns the children
//! on nodes chosen by its placement policy, watches each of them through
//! a [`ChildMonitor`](crate::monitor::ChildMonitor), and reacts to
//! failures according to its restart strategy.
//!
//! # Restart Strategies
//!
//! - **one_for_one**: restart only the crashed child. Independent
//!   workers.
//! - **one_for_all**: stop every child (reverse start order), start them
//!   all back (start order). Tightly coupled children.
//! - **rest_for_one**: stop the crashed child and everything started
//!   after it, start them back in order. Startup dependencies.
//! - **simple_one_for_one**: one template, dynamically stamped workers
//!   with generated ids; crashes are handled like `one_for_one`.
//!
//! # Restart Policies
//!
//! Within any strategy each affected child consults its own policy:
//! `permanent` always restarts, `transient` restarts on abnormal exits
//! only (node failures count as abnormal), `temporary` never restarts.
//!
//! # Restart Intensity
//!
//! Automatic restarts are counted in a rolling window; exceeding
//! `max_restarts` within `within` stops the supervisor with reason
//! `max_restarts_exceeded`. Node failures funnel every affected child
//! through the same accounting, which is the intended backpressure
//! against a flapping node. Explicit [`SupervisorRef::restart_child`]
//! calls are not counted.
//!
//! # Example
//!
//! ```rust,ignore
//! use dsup::cluster::InMemoryCluster;
//! use dsup::supervisor::{ChildSpec, Strategy, Supervisor, SupervisorOptions};
//!
//! let cluster = InMemoryCluster::new("local");
//! cluster.register_behavior("cache", Arc::new(CacheBehavior));
//!
//! let sup = Supervisor::start(
//!     SupervisorOptions::new(Strategy::OneForOne)
//!         .with_child(ChildSpec::new("cache-1", "cache")),
//!     cluster.env(),
//! )
//! .await?;
//!
//! sup.stop().await;
//! ```

// Module declarations
pub mod core;
pub mod events;
pub mod strategy;
pub mod types;

// Re-exports for convenient access
pub use self::core::{Supervisor, SupervisorRef};
pub use events::{global, EventBus, EventHandler, LifecycleEvent, StopReason};
pub use strategy::affected_children;
pub use types::{
    AutoShutdown, ChildInfo, ChildSpec, ChildTemplate, Phase, RestartIntensity, RestartPolicy,
    Strategy, SupervisorOptions, SupervisorStats, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SPAWN_TIMEOUT,
    SHUTDOWN_POLL_INTERVAL,
};
