//! Unified diff of a managed section against its expected render

use similar::TextDiff;

/// Lines of context around each hunk
const CONTEXT_RADIUS: usize = 3;

/// Unified diff from `expected` to `actual`; empty when they match line for line
pub fn unified(expected: &str, actual: &str) -> String {
    TextDiff::from_lines(expected, actual)
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .header("expected", "actual")
        .to_string()
}
