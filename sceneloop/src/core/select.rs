//! Best-iteration selection for exhausted sessions.

use crate::session::Iteration;

/// Pick the iteration presented when no critique accepted: highest critique
/// total, ties broken by the latest index. Returns the 1-based iteration
/// index, or `None` when no iterations completed.
pub fn best_iteration(iterations: &[Iteration]) -> Option<u32> {
    iterations
        .iter()
        .max_by(|a, b| {
            (a.critique.total, a.index).cmp(&(b.critique.total, b.index))
        })
        .map(|it| it.index)
}
