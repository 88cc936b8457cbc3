//! Restart-strategy decision logic.
//!
//! Every strategy reacts to a crash the same way; they differ only in
//! which other children are pulled into the restart. The computation here
//! is pure — the supervisor core applies the result (stop in reverse
//! order, evaluate per-child restart policies, start in order).

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use super::types::Strategy;

/// Returns the children affected by a crash of `failed`, in start order.
///
/// - `one_for_one` / `simple_one_for_one`: the crashed child alone.
/// - `one_for_all`: every child.
/// - `rest_for_one`: the crashed child and every child started after it.
///
/// An unknown `failed` id yields an empty set; callers look the child up
/// before getting here.
pub fn affected_children(strategy: Strategy, start_order: &[String], failed: &str) -> Vec<String> {
    match strategy {
        Strategy::OneForOne | Strategy::SimpleOneForOne => start_order
            .iter()
            .filter(|id| id.as_str() == failed)
            .cloned()
            .collect(),
        Strategy::OneForAll => {
            if start_order.iter().any(|id| id == failed) {
                start_order.to_vec()
            } else {
                Vec::new()
            }
        }
        Strategy::RestForOne => match start_order.iter().position(|id| id == failed) {
            Some(index) => start_order[index..].to_vec(),
            None => Vec::new(),
        },
    }
}
