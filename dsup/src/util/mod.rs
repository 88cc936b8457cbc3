//! Shared utilities: identifier generation and serde helpers.

pub mod ids;
pub mod serde_helpers;

pub use ids::{dynamic_child_id, supervisor_id};
pub use serde_helpers::duration_millis;
