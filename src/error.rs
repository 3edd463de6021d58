//! Error type shared by the grading core and the report-card store.
//!
//! "No data yet" and "excluded subject" are normal states and never show up
//! here. Only broken invariants, bad input that slipped past the IPC layer,
//! and storage failures do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalcError {
    /// An internal invariant that should be structurally impossible to break.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Evaluation status change that the state machine does not allow.
    #[error("cannot move evaluation from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl CalcError {
    /// Stable error code used in IPC replies.
    pub fn code(&self) -> &'static str {
        match self {
            CalcError::Invariant(_) => "invariant_violation",
            CalcError::NotFound(_) => "not_found",
            CalcError::InvalidInput(_) => "bad_params",
            CalcError::InvalidTransition { .. } => "invalid_transition",
            CalcError::Db(_) => "db_query_failed",
        }
    }
}

pub type CalcResult<T> = Result<T, CalcError>;
