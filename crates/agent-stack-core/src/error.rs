//! Error taxonomy for the index bootstrap gate.
//!
//! Every failure the gate can report falls into one of two classes:
//!
//! | Variant | Meaning | Caller behavior |
//! |---------|---------|-----------------|
//! | [`GateError::Retryable`] | timeouts, throttling, transient auth | retry within its own budget |
//! | [`GateError::Terminal`] | invalid mapping, unsupported dimensionality | fail the run, roll back |
//!
//! "Index already exists" is not an error at all; backends report it as
//! [`IndexCreation::AlreadyExists`](crate::backend::IndexCreation::AlreadyExists).

/// A failure signalled by the gate to its caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Infrastructure failure. The orchestration engine may retry the action.
    #[error("retryable infrastructure error: {0}")]
    Retryable(String),
    /// Configuration failure. Retrying cannot succeed.
    #[error("terminal configuration error: {0}")]
    Terminal(String),
}

impl GateError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        GateError::Retryable(reason.into())
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        GateError::Terminal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::Retryable(_))
    }

    /// The bare reason, without the class prefix.
    pub fn reason(&self) -> &str {
        match self {
            GateError::Retryable(r) | GateError::Terminal(r) => r,
        }
    }
}

/// A failure returned by an [`IndexBackend`](crate::backend::IndexBackend).
///
/// Backends classify their own wire errors; the gate maps this one-to-one
/// onto [`GateError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl From<BackendError> for GateError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => GateError::Retryable(msg),
            BackendError::Rejected(msg) => GateError::Terminal(msg),
        }
    }
}

/// Raised when a mapping or request fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConfigurationError(pub String);

impl From<ConfigurationError> for GateError {
    fn from(err: ConfigurationError) -> Self {
        GateError::Terminal(err.0)
    }
}
