// SPDX-License-Identifier: Apache-2.0

//! Error model shared by every compiler phase.
//!
//! Errors are values, not control flow: the first error aborts the current
//! pass and is surfaced unchanged to the caller. Partial mutations to an AST
//! or IR are not rolled back; a failed compilation must be discarded.

/// Classified compiler error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    /// Malformed input (missing JSON field, wrong tag, bad flag value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced file or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A feature gate was hit (e.g. sequential generation on an unsupported
    /// loop shape).
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Scheduling is infeasible at the requested length / clock period.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invariant violation inside the compiler itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Status {
    /// Exit code summarizing the classification for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::InvalidArgument(_) | Status::NotFound(_) => 1,
            Status::ResourceExhausted(_) => 2,
            Status::Unimplemented(_) => 3,
            Status::Internal(_) => 4,
        }
    }
}

pub type StatusResult<T> = Result<T, Status>;
