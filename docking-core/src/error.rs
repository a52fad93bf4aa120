//! Error taxonomy for buffers, tasks and evaluators.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A write or read used a field width other than the slot's declared width.
    #[error("shape mismatch on slot '{slot}': expected {expected} values, got {actual}")]
    ShapeMismatch {
        slot: String,
        expected: usize,
        actual: usize,
    },

    /// A launch or read referenced a slot that was never populated or produced.
    #[error("stage '{stage}' is missing buffer '{slot}'")]
    MissingBuffer { stage: String, slot: String },

    /// The execution backend failed; the whole batch must be re-run.
    #[error("backend failure in stage '{stage}': {message}")]
    Backend { stage: String, message: String },

    /// Wrong parameter vector length or state width on the reference path.
    #[error("input contract violation: {0}")]
    InputContract(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn shape(slot: &str, expected: usize, actual: usize) -> Self {
        EngineError::ShapeMismatch {
            slot: slot.to_string(),
            expected,
            actual,
        }
    }

    pub fn missing(stage: &str, slot: &str) -> Self {
        EngineError::MissingBuffer {
            stage: stage.to_string(),
            slot: slot.to_string(),
        }
    }

    pub fn backend(stage: &str, message: impl Into<String>) -> Self {
        EngineError::Backend {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Buffer and backend failures can be retried by the caller once the
    /// missing input is supplied; contract and config errors stop the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ShapeMismatch { .. }
                | EngineError::MissingBuffer { .. }
                | EngineError::Backend { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::shape("inputs", 6, 5).is_recoverable());
        assert!(EngineError::missing("fitness", "initial_distance").is_recoverable());
        assert!(EngineError::backend("rk4", "launch failed").is_recoverable());
        assert!(!EngineError::InputContract("bad weights".into()).is_recoverable());
        assert!(!EngineError::InvalidConfig("dt".into()).is_recoverable());
    }

    #[test]
    fn test_display_names_stage_and_slot() {
        let msg = EngineError::missing("fitness", "initial_distance").to_string();
        assert!(msg.contains("fitness"));
        assert!(msg.contains("initial_distance"));
    }
}
