//! Error types shared across the analysis pipeline

use thiserror::Error;

/// Failure while analysing a single method.
///
/// `Rejected` is an expected condition (malformed or unsupported bytecode)
/// and is recovered at the whole-program worklist; `Internal` means the
/// abstract domain and the decoded instruction stream disagree, which is
/// never recovered.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("method rejected: {0}")]
    Rejected(String),
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl AnalysisError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        AnalysisError::Rejected(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AnalysisError::Internal(msg.into())
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Malformed class bytes. The worklist treats this like a missing class.
#[derive(Debug, Error)]
#[error("malformed class file: {0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        DecodeError(msg.into())
    }
}
