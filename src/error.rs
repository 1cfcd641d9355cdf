// src/error.rs
//
// =============================================================================
// DATALAB: ERROR TAXONOMY
// =============================================================================
//
// Every failure in the core is recoverable by further user action.
//
// - Structural:     rejected, never applied (anchor rule, collisions, dependencies).
// - Validation:     recorded in `Build::errors`; blocks save only.
// - Reconciliation: blocks a matching-field choice until both sides are decided.
// - Transport:      server failure; the build stays at its last-known-good value.

use crate::core::{BuildErrors, Label};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("{0}")]
    Structural(String),

    #[error("build is not valid ({} problem(s))", .0.count())]
    Validation(BuildErrors),

    #[error("{0}")]
    Reconciliation(String),

    #[error("'{0}' does not uniquely identify records")]
    NotUnique(Label),

    #[error("server request failed: {0}")]
    Transport(String),

    #[error("this DataLab session has already been saved")]
    Closed,
}

impl LabError {
    pub fn structural(msg: impl Into<String>) -> Self {
        LabError::Structural(msg.into())
    }

    pub fn reconciliation(msg: impl Into<String>) -> Self {
        LabError::Reconciliation(msg.into())
    }

    /// Transport failures keep the full anyhow chain in the message.
    pub fn transport(err: anyhow::Error) -> Self {
        LabError::Transport(format!("{err:#}"))
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, LabError::Structural(_))
    }
}

pub type LabResult<T> = Result<T, LabError>;
