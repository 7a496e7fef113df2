use std::time::Duration;

use thiserror::Error;

/// Type alias for Result with MigrationError
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Default wait when a 429 response carries no usable Retry-After header
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Error types for the migration and backup engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Server throttled the request (HTTP 429)
    #[error("Throttled by server, retry after {retry_after_secs} seconds")]
    Throttled { retry_after_secs: u64 },

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unauthorized (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict (409), usually a name collision in the destination
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other non-success status
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Connection failures, timeouts and other transport errors
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Tenant credentials could not be resolved or exchanged for a token
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Job or checkpoint state error (invalid transition, missing record, ...)
    #[error("State error: {0}")]
    StateError(String),

    /// Backup storage error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A destination container required by a whole workload is missing
    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    /// An item of a kind the destination cannot receive
    #[error("Unsupported item: {0}")]
    UnsupportedItem(String),

    /// The run was paused or cancelled while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// How the retry layer treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after the server-advised delay, without spending the retry budget
    Throttled,
    /// Retry with bounded exponential backoff
    Transient,
    /// Surface immediately
    Permanent,
}

impl MigrationError {
    /// Classify the error for the retry layer
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::Throttled { .. } => ErrorClass::Throttled,
            MigrationError::ServerError { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Whether a job refused with this error can never run, so redelivering it is pointless
    ///
    /// Invalid messages, unknown records and wrong statuses are refusals;
    /// store and IO failures are not.
    pub fn is_refusal(&self) -> bool {
        matches!(self, MigrationError::StateError(_) | MigrationError::ConfigError(_))
    }

    /// Server-advised delay for throttled errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MigrationError::Throttled { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    /// HTTP status carried by the error, if it came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            MigrationError::Throttled { .. } => Some(429),
            MigrationError::ServerError { status, .. } | MigrationError::ApiError { status, .. } => {
                Some(*status)
            }
            MigrationError::BadRequest(_) => Some(400),
            MigrationError::Unauthorized(_) => Some(401),
            MigrationError::Forbidden(_) => Some(403),
            MigrationError::NotFound(_) => Some(404),
            MigrationError::Conflict(_) => Some(409),
            _ => None,
        }
    }

    /// Build an error from a non-success HTTP status
    ///
    /// `retry_after` is the raw Retry-After header value, only consulted for 429.
    pub fn from_status(status: u16, retry_after: Option<&str>, body: &str) -> Self {
        let message = summarize_body(body);
        match status {
            429 => MigrationError::Throttled {
                retry_after_secs: parse_retry_after(retry_after),
            },
            400 => MigrationError::BadRequest(message),
            401 => MigrationError::Unauthorized(message),
            403 => MigrationError::Forbidden(message),
            404 => MigrationError::NotFound(message),
            409 => MigrationError::Conflict(message),
            500..=599 => MigrationError::ServerError { status, message },
            _ => MigrationError::ApiError { status, message },
        }
    }
}

/// Pull the `error.message` out of a Graph error body, or fall back to the raw text
fn summarize_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let code = value["error"]["code"].as_str();
        let message = value["error"]["message"].as_str();
        match (code, message) {
            (Some(code), Some(message)) => return format!("{}: {}", code, message),
            (None, Some(message)) => return message.to_string(),
            _ => {}
        }
    }

    const MAX_BODY: usize = 512;
    if body.chars().count() > MAX_BODY {
        format!("{}...", body.chars().take(MAX_BODY).collect::<String>())
    } else {
        body.to_string()
    }
}

/// Parse a Retry-After header value
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 60 seconds.
pub fn parse_retry_after(value: Option<&str>) -> u64 {
    if let Some(retry_after_str) = value.map(str::trim) {
        // Try to parse as integer (delay-seconds format)
        if let Ok(seconds) = retry_after_str.parse::<u64>() {
            return seconds;
        }

        // Try to parse as HTTP date format
        if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
            // Calculate seconds until that time
            let now = std::time::SystemTime::now();
            if let Ok(duration) = http_date.duration_since(now) {
                return duration.as_secs();
            }
        }
    }

    DEFAULT_RETRY_AFTER_SECS
}
