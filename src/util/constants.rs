//! Centralized constants for Maestro runtime configuration
//!
//! All timeout and limit defaults in one place for easy tuning.
//! Every value here can be overridden through `EngineConfig`.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Execution Limits
// ═══════════════════════════════════════════════════════════════

/// Default timeout for a single agent invocation
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Iteration cap applied to loops that omit `max_iterations`
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Upper bound a loop may declare for itself
pub const MAX_ITERATIONS_CEILING: u32 = 1000;

// ═══════════════════════════════════════════════════════════════
// Document
// ═══════════════════════════════════════════════════════════════

/// apiVersion prefix accepted for workflow and agent documents
pub const API_VERSION_PREFIX: &str = "maestro/";

/// apiVersion written by `maestro` tooling
pub const API_VERSION: &str = "maestro/v1alpha1";

/// Reserved `from:` keyword resolving to the run's initial prompt
pub const PROMPT_KEYWORD: &str = "prompt";

/// `from:` prefix reading another agent step's documented instructions
pub const INSTRUCTIONS_PREFIX: &str = "instructions:";

// ═══════════════════════════════════════════════════════════════
// Streaming
// ═══════════════════════════════════════════════════════════════

/// Prefix marking each newline-delimited JSON record on the streaming boundary
pub const STREAM_MARKER: &str = "data: ";

/// Separator used when concatenating several inputs or re-emitted outputs
pub const PART_SEPARATOR: &str = "\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_defaults_are_bounded() {
        assert!(DEFAULT_MAX_ITERATIONS > 0);
        assert!(DEFAULT_MAX_ITERATIONS <= MAX_ITERATIONS_CEILING);
    }

    #[test]
    fn agent_timeout_is_positive() {
        assert!(AGENT_TIMEOUT.as_secs() > 0);
    }
}
