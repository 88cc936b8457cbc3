//! Error types for supervision operations.
//!
//! One taxonomy covers the whole public surface: placement, registry,
//! child management and supervisor lifecycle all report through
//! [`SupervisorError`]. Collaborator failures keep their structured cause
//! attached via the [`Supervisor`](SupervisorError::Supervisor) wrapper.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::cluster::{ClusterError, NodeId};

/// Errors that can occur during supervision operations.
///
/// All variants carry the identifiers needed to act on them without
/// parsing messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The node selector produced no candidate for a child.
    #[error("no available node for child '{child_id}' (selector: {selector})")]
    NoAvailableNode {
        /// Child awaiting placement.
        child_id: String,
        /// Display name of the selector that came up empty.
        selector: String,
    },

    /// A behavior name did not resolve on the target node.
    #[error("behavior '{behavior}' not found on node {node}")]
    BehaviorNotFound { behavior: String, node: NodeId },

    /// A child id is already present in the supervisor's table.
    #[error("supervisor '{supervisor_id}' already has a child '{child_id}'")]
    DuplicateChild {
        supervisor_id: String,
        child_id: String,
    },

    /// An operation targeted a child id the supervisor does not know.
    #[error("supervisor '{supervisor_id}' has no child '{child_id}'")]
    ChildNotFound {
        supervisor_id: String,
        child_id: String,
    },

    /// The restart-intensity ceiling was breached. Fatal: the supervisor
    /// stops itself with reason `max_restarts_exceeded`.
    #[error(
        "supervisor '{supervisor_id}' exceeded {max_restarts} restarts within {within:?}"
    )]
    MaxRestartsExceeded {
        supervisor_id: String,
        max_restarts: u32,
        within: Duration,
    },

    /// The strategy/template/children coherence rules were violated.
    #[error("invalid simple_one_for_one configuration for '{supervisor_id}': {reason}")]
    InvalidSimpleOneForOne {
        supervisor_id: String,
        reason: String,
    },

    /// A `simple_one_for_one` supervisor was declared without a template.
    #[error("supervisor '{supervisor_id}' uses simple_one_for_one but has no child template")]
    MissingChildTemplate { supervisor_id: String },

    /// A restart claim found the child registered under another
    /// supervisor's namespace.
    #[error(
        "child '{child_id}' is registered under supervisor '{owner_supervisor_id}', \
         not '{supervisor_id}'"
    )]
    ChildClaim {
        supervisor_id: String,
        child_id: String,
        owner_supervisor_id: String,
    },

    /// The supervisor options failed validation.
    #[error("invalid configuration for supervisor '{supervisor_id}': {reason}")]
    InvalidConfiguration {
        supervisor_id: String,
        reason: String,
    },

    /// A collaborator failed while the supervisor was acting on its
    /// behalf.
    #[error("supervisor '{supervisor_id}': {message}")]
    Supervisor {
        supervisor_id: String,
        message: String,
        #[source]
        cause: Option<ClusterError>,
    },
}

impl SupervisorError {
    /// Wraps a collaborator failure.
    pub fn collaborator(
        supervisor_id: impl Into<String>,
        message: impl Into<String>,
        cause: ClusterError,
    ) -> Self {
        Self::Supervisor {
            supervisor_id: supervisor_id.into(),
            message: message.into(),
            cause: Some(cause),
        }
    }

    /// Returns `true` for errors that end the supervisor rather than a
    /// single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::MaxRestartsExceeded { .. }
                | SupervisorError::InvalidConfiguration { .. }
                | SupervisorError::InvalidSimpleOneForOne { .. }
                | SupervisorError::MissingChildTemplate { .. }
        )
    }

    /// Returns `true` if this error reports a missing child.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::ChildNotFound { .. })
    }

    /// The child id the error is about, if any.
    pub fn child_id(&self) -> Option<&str> {
        match self {
            SupervisorError::NoAvailableNode { child_id, .. }
            | SupervisorError::DuplicateChild { child_id, .. }
            | SupervisorError::ChildNotFound { child_id, .. }
            | SupervisorError::ChildClaim { child_id, .. } => Some(child_id),
            _ => None,
        }
    }

    /// The supervisor id the error is about, if any.
    pub fn supervisor_id(&self) -> Option<&str> {
        match self {
            SupervisorError::DuplicateChild { supervisor_id, .. }
            | SupervisorError::ChildNotFound { supervisor_id, .. }
            | SupervisorError::MaxRestartsExceeded { supervisor_id, .. }
            | SupervisorError::InvalidSimpleOneForOne { supervisor_id, .. }
            | SupervisorError::MissingChildTemplate { supervisor_id }
            | SupervisorError::ChildClaim { supervisor_id, .. }
            | SupervisorError::InvalidConfiguration { supervisor_id, .. }
            | SupervisorError::Supervisor { supervisor_id, .. } => Some(supervisor_id),
            _ => None,
        }
    }
}

impl From<ClusterError> for SupervisorError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::BehaviorNotFound { behavior, node } => {
                SupervisorError::BehaviorNotFound { behavior, node }
            }
            other => SupervisorError::Supervisor {
                supervisor_id: String::new(),
                message: other.to_string(),
                cause: Some(other),
            },
        }
    }
}
