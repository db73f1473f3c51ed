// src/infra/errors.rs — Error types for PromptForge

use thiserror::Error;

/// Errors surfaced by the optimisation engine.
///
/// Everything except `Fatal` is recoverable at the protocol level: the
/// error becomes the structured result for the current turn and the
/// session continues. `Fatal` stops iteration entirely: continuing on a
/// corrupted store or a failed persistence write risks silently
/// discarding history.
#[derive(Error, Debug)]
pub enum EngineError {
    // Protocol errors
    #[error("Malformed action: field '{field}': {message}")]
    MalformedAction { field: String, message: String },

    #[error("Unknown action type '{action_type}'")]
    UnknownAction { action_type: String },

    // File errors
    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Edit target not found in {path}: old string does not occur")]
    NoMatch { path: String },

    #[error("Edit target occurs {count} times in {path}; it must occur exactly once")]
    AmbiguousMatch { path: String, count: usize },

    // Subagent errors
    #[error("No trajectory available for eval '{eval_id}': latest outcome must be fail or error with a recorded trajectory")]
    NoTrajectoryAvailable { eval_id: String },

    #[error("No subagent conversation is open")]
    NoOpenSubagent,

    #[error("A subagent conversation is open; close it before resetting")]
    SubagentOpen,

    #[error("Subagent conversation failed: {message}")]
    SubagentFailed { message: String },

    // Execution errors
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("Eval gateway error: {message}")]
    EvalGateway { message: String },

    #[error("No snapshot recorded for iteration {iteration}{}", available_note(.available))]
    SnapshotNotFound {
        iteration: u32,
        available: Vec<u32>,
    },

    // Unrecoverable internal fault (store corruption, persistence failure)
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

fn available_note(available: &[u32]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(
            " (available: {})",
            available
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl EngineError {
    /// A recoverable error becomes the turn's result; a fatal one ends the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Fatal(_))
    }

    /// Stable machine-readable code used in the structured result object.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MalformedAction { .. } => "malformed_action",
            EngineError::UnknownAction { .. } => "unknown_action",
            EngineError::NotFound { .. } => "not_found",
            EngineError::NoMatch { .. } => "no_match",
            EngineError::AmbiguousMatch { .. } => "ambiguous_match",
            EngineError::NoTrajectoryAvailable { .. } => "no_trajectory_available",
            EngineError::NoOpenSubagent => "no_open_subagent",
            EngineError::SubagentOpen => "subagent_open",
            EngineError::SubagentFailed { .. } => "subagent_failed",
            EngineError::Timeout { .. } => "timeout",
            EngineError::EvalGateway { .. } => "eval_gateway_error",
            EngineError::SnapshotNotFound { .. } => "snapshot_not_found",
            EngineError::Fatal(_) => "fatal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(EngineError::NoOpenSubagent.is_recoverable());
        assert!(EngineError::Timeout {
            what: "bash".into(),
            secs: 30
        }
        .is_recoverable());
        assert!(!EngineError::Fatal(anyhow::anyhow!("store corrupted")).is_recoverable());
    }

    #[test]
    fn test_messages_name_the_precondition() {
        let e = EngineError::MalformedAction {
            field: "path".into(),
            message: "missing field".into(),
        };
        assert!(e.to_string().contains("path"));

        let e = EngineError::AmbiguousMatch {
            path: "tools/calc.py".into(),
            count: 2,
        };
        assert!(e.to_string().contains("2 times"));
        assert!(e.to_string().contains("tools/calc.py"));
    }

    #[test]
    fn test_snapshot_not_found_lists_available() {
        let e = EngineError::SnapshotNotFound {
            iteration: 7,
            available: vec![3, 4, 5],
        };
        let msg = e.to_string();
        assert!(msg.contains("iteration 7"));
        assert!(msg.contains("3, 4, 5"));

        let e = EngineError::SnapshotNotFound {
            iteration: 7,
            available: vec![],
        };
        assert!(!e.to_string().contains("available"));
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::NoOpenSubagent.code(), "no_open_subagent");
        assert_eq!(
            EngineError::UnknownAction {
                action_type: "zap".into()
            }
            .code(),
            "unknown_action"
        );
    }
}
