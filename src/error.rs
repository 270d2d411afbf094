//! Error taxonomy for the cascade engine.
//!
//! Every fallible operation in this crate returns [`Error`], a
//! kind-tagged enum rather than a grab-bag of ad-hoc types. Callers that
//! only care about the recovery strategy can match on [`Error::kind`]
//! without enumerating every variant.

use thiserror::Error;

/// Coarse error classification from spec §7. Stable across crate versions
/// even as new variants are added to [`Error`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid model/config at construction.
    Config,
    /// Budget/tier denial or rate limit exceeded.
    Admission,
    /// Timeouts, 429/5xx, network failures from a provider.
    TransientProvider,
    /// 401/403 from a provider.
    AuthProvider,
    /// 400 with a provider-parsed reason.
    BadRequest,
    /// Quality check failed or a tool call was invalid.
    Validation,
    /// A tool handler raised an exception.
    ToolExecution,
    /// A step or request deadline was exceeded.
    Timeout,
    /// Cancellation was signalled.
    Cancelled,
    /// An internal invariant was violated.
    Internal,
}

/// The crate's unified error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid model/config at construction. Fatal at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Budget/tier denial, rate-limit exceeded. Carries a retry hint.
    #[error("admission denied: {reason}")]
    Admission {
        /// Human-readable reason surfaced to the caller.
        reason: String,
        /// Milliseconds the caller should wait before retrying, if known.
        retry_after_ms: Option<u64>,
    },

    /// Timeouts, 429/5xx, network. Bounded retry, then propagate.
    #[error("transient provider error after {attempts} attempt(s): {reason}")]
    TransientProvider {
        /// Human-readable reason from the provider adapter.
        reason: String,
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// 401/403. No retry.
    #[error("provider authentication failed: {0}")]
    AuthProvider(String),

    /// 400 with a provider-parsed reason. No retry.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Quality failed or tool-call invalid. May trigger escalation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Exception thrown by a tool handler.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecution {
        /// Name of the tool that failed.
        tool_name: String,
        /// Reason reported by the handler.
        reason: String,
    },

    /// Step or request deadline exceeded. No retry.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Cancellation signalled. Resources are released on return.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation. Propagated with as much trace context as
    /// available.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// Opaque passthrough for errors this crate did not originate
    /// (e.g. from a caller-supplied tool executor or embedder).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The coarse taxonomy kind for this error, for dispatch without
    /// matching every variant.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Admission { .. } => ErrorKind::Admission,
            Error::TransientProvider { .. } => ErrorKind::TransientProvider,
            Error::AuthProvider(_) => ErrorKind::AuthProvider,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Validation(_) => ErrorKind::Validation,
            Error::ToolExecution { .. } => ErrorKind::ToolExecution,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Internal(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Build an [`Error::Admission`] with an optional retry hint.
    #[must_use]
    pub fn admission(reason: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Error::Admission {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Build an [`Error::TransientProvider`].
    #[must_use]
    pub fn transient_provider(reason: impl Into<String>, attempts: u32) -> Self {
        Error::TransientProvider {
            reason: reason.into(),
            attempts,
        }
    }

    /// Build an [`Error::ToolExecution`].
    #[must_use]
    pub fn tool_execution(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ToolExecution {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }

    /// `retry_after_ms` if this error carries one.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::Admission { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
