//! Error taxonomy for the sync engine core.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry policy class for an API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify an HTTP status code into a retry policy.
pub fn classify_http_status(status: u16) -> ApiRetryClass {
    match status {
        401 | 403 => ApiRetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
        500..=599 => ApiRetryClass::Retryable,
        _ => ApiRetryClass::Permanent,
    }
}

/// Exponential backoff in seconds, base 5s doubling, capped at exponent 8.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    const MAX_EXPONENT: i32 = 8;
    const BASE_DELAY_SECONDS: i64 = 5;
    let capped = i64::from(consecutive_failures.clamp(0, MAX_EXPONENT));
    2_i64.pow(capped as u32) * BASE_DELAY_SECONDS
}

/// Errors produced by the crypto provider (spec.md §4.1, §7).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to create account keys (code {0})")]
    FailedToCreateAccountKeys(i32),

    #[error("failed to encrypt value (code {0})")]
    FailedToEncryptValue(i32),

    #[error("failed to decrypt value (code {0})")]
    FailedToDecryptValue(i32),

    #[error("failed to seal data (code {0})")]
    FailedToSealData(i32),

    #[error("failed to open sealed box (code {0})")]
    FailedToOpenSealedBox(i32),

    #[error("failed to prepare for connect (code {0})")]
    FailedToPrepareForConnect(i32),
}

/// Errors produced by gzip compression of a PATCH payload.
///
/// Numeric codes mirror the conventional zlib/gzip negative error codes so a
/// caller logging this value gets the same shape of diagnostic a C-backed
/// implementation would produce.
#[derive(Debug, Error)]
#[error("gzip compression failed (code {0})")]
pub struct GzipError(pub i32);

impl GzipError {
    pub const STREAM: i32 = -2;
    pub const DATA: i32 = -3;
    pub const MEMORY: i32 = -4;
    pub const BUFFER: i32 = -5;
    pub const VERSION: i32 = -6;
    /// No specific `flate2`/`zlib` code applies, e.g. a server rejected a
    /// gzipped request body rather than the encoder itself failing.
    pub const UNKNOWN: i32 = 0;

    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let code = match err.kind() {
            UnexpectedEof | InvalidData => Self::DATA,
            OutOfMemory => Self::MEMORY,
            WriteZero => Self::BUFFER,
            _ => 0, // unknown -> passthrough
        };
        GzipError(code)
    }
}

/// The full error taxonomy (spec.md §7).
#[derive(Debug, Error)]
pub enum SyncError {
    // Account state errors, surface to caller, no retry.
    #[error("account not found")]
    AccountNotFound,

    #[error("no token available for authenticated request")]
    NoToken,

    #[error("account was removed")]
    AccountRemoved,

    // HTTP / response shape errors.
    #[error("unexpected status code {0}")]
    UnexpectedStatusCode(u16),

    #[error("response had no body")]
    NoResponseBody,

    #[error("unexpected response body: {0}")]
    UnexpectedResponseBody(String),

    #[error("unable to decode response: {0}")]
    UnableToDecodeResponse(String),

    #[error("invalid data in response: {0}")]
    InvalidDataInResponse(String),

    // Crypto failures.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    // Compression.
    #[error("patch payload compression failed (code {0})")]
    PatchPayloadCompressionFailed(i32),

    // Caller bugs.
    #[error("no features specified")]
    NoFeaturesSpecified,

    // Cooperative cancellation — not a reportable failure.
    #[error("operation was cancelled")]
    Cancelled,

    // Transport-level.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// HTTP status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::UnexpectedStatusCode(code) => Some(*code),
            _ => None,
        }
    }

    /// Classify for retry policy. Non-HTTP errors default to permanent,
    /// except cancellation which is never retried or reported.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            SyncError::UnexpectedStatusCode(code) => classify_http_status(*code),
            SyncError::NoToken | SyncError::AccountRemoved | SyncError::AccountNotFound => {
                ApiRetryClass::ReauthRequired
            }
            SyncError::Transport(_) => ApiRetryClass::Retryable,
            _ => ApiRetryClass::Permanent,
        }
    }

    /// True when a 403 was returned — the caller must clear the local Account.
    pub fn requires_account_removal(&self) -> bool {
        matches!(self, SyncError::UnexpectedStatusCode(403))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

/// Per-feature error wrapper aggregated by a `SyncOperation` (spec.md §4.9, §7).
#[derive(Debug, Error)]
#[error("feature {feature}: {source}")]
pub struct FeatureError {
    pub feature: String,
    #[source]
    pub source: SyncError,
}

/// Aggregated per-feature errors surfaced at the end of one `SyncOperation`.
#[derive(Debug, Error)]
#[error("sync operation failed for {} feature(s)", .per_feature_errors.len())]
pub struct SyncOperationError {
    pub per_feature_errors: Vec<FeatureError>,
}
