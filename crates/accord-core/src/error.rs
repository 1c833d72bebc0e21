use thiserror::Error;

/// Failures surfaced by the engine. Every variant except `Internal` carries
/// a human-readable detail that is safe to show to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    Validation(String),

    /// Retryable store failure (busy, locked, timed out).
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Transient failures outlasted the retry budget.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Asymmetric relationship state. Repaired by reconciliation, never
    /// returned to end users.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Unavailable(_) => "unavailable",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Copy of an error shared between coalesced readers. `anyhow::Error`
    /// is not `Clone`, so internal errors keep only their rendered chain.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::Conflict(m) => Self::Conflict(m.clone()),
            Self::Unauthorized(m) => Self::Unauthorized(m.clone()),
            Self::Validation(m) => Self::Validation(m.clone()),
            Self::Transient(m) => Self::Transient(m.clone()),
            Self::Unavailable(m) => Self::Unavailable(m.clone()),
            Self::InvariantViolation(m) => Self::InvariantViolation(m.clone()),
            Self::Internal(e) => Self::Internal(anyhow::anyhow!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keeps_variant_and_message() {
        let first = Error::Conflict("already friends".into());
        let copy = first.duplicate();
        assert_eq!(copy.code(), "conflict");
        assert_eq!(copy.to_string(), first.to_string());

        let internal = Error::from(anyhow::anyhow!("disk").context("loading account"));
        assert_eq!(internal.duplicate().to_string(), "loading account: disk");
    }
}
