use serde::{Deserialize, Serialize};
use thiserror::Error;

/// No valid destination for a cursor move. Always an authoring bug:
/// well-formed flows end in a terminal step and callers check
/// `Step::terminal` before advancing.
#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("no forward destination from step {0}")]
    NoForward(String),

    #[error("no backward destination from step {0}")]
    NoBackward(String),

    #[error("growth function failed at step {position}: {source}")]
    Growth {
        position: String,
        #[source]
        source: PhaseError,
    },
}

/// Author code inside a phase or growth function failed.
///
/// These escalate to the session level: the session is marked failed and
/// the cursor is left in place so a fixed flow can be retried.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("internal phase error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    pub fn internal(msg: impl Into<String>) -> Self {
        PhaseError::Internal(msg.into())
    }
}

/// An expected, recoverable per-element rejection of submitted input.
///
/// Never escalates: the step is re-rendered with this feedback and the
/// client re-submits.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationFailure {
    /// Variable name of the offending element, if attributable.
    pub element: Option<String>,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            element: None,
            message: message.into(),
        }
    }

    pub fn for_element(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            element: Some(element.into()),
            message: message.into(),
        }
    }
}
