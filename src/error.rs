//! Error types for the keystore operator
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the way a failure is handled by the controller runtime: validation
//! problems are not retried, conflicts are requeued immediately and I/O
//! failures are retried with a short delay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Inputs violate a static constraint (e.g. an entry name that is too long)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Cipher construction, key derivation or random source failure
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// Optimistic concurrency failure while writing a Secret
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// An expected record is absent
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Elasticsearch answered with a non-success status code
    #[error("Elasticsearch API error (status {status}): {body}")]
    EsApiError { status: u16, body: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// The reconciliation was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,

    /// Several independent steps of the same pass failed
    #[error("{} error(s) during reconciliation: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the error is transient and worth a quick retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::HttpError(_)
            | Error::ConflictError(_)
            | Error::CryptoError(_)
            | Error::Cancelled => true,
            Error::EsApiError { status, .. } => *status >= 500 || *status == 429,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retriable),
            _ => false,
        }
    }

    /// Whether the error is an optimistic concurrency failure
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::ConflictError(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            Error::Aggregate(errors) => errors.iter().any(Error::is_conflict),
            _ => false,
        }
    }

    /// Whether the error means the requested object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            Error::EsApiError { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Short machine-readable label, used for metrics and events
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ValidationError(_) => "validation",
            Error::CryptoError(_) => "crypto",
            Error::ConflictError(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::EsApiError { .. } => "elasticsearch",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::FinalizerError(_) => "finalizer",
            Error::Cancelled => "cancelled",
            Error::Aggregate(_) => "aggregate",
        }
    }

    /// Collapse the errors collected during a pass into a single result
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => Error::ConflictError(ae.message),
            other => Error::KubeError(other),
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(err)
            | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
