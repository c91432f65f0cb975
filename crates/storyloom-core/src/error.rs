use std::fmt;

/// Main error type for storyloom
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Queue broker errors
    Queue(String),

    /// Generative provider errors, with the HTTP status when one was observed
    Provider { status: Option<u16>, message: String },

    /// Validation errors (bad input, model output failing schema checks)
    Validation(String),

    /// Not found errors
    NotFound(String),

    /// HTTP/Network errors
    Network(String),

    /// Media generation/composition errors
    Media(String),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Queue(msg) => write!(f, "Queue error: {}", msg),
            Error::Provider { status: Some(code), message } => {
                write!(f, "Provider error ({}): {}", code, message)
            }
            Error::Provider { status: None, message } => {
                write!(f, "Provider error: {}", message)
            }
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Media(msg) => write!(f, "Media error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Error::Queue(error.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(format!("Invalid UUID: {}", error))
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new queue error
    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Error::Queue(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new media error
    pub fn media<T: Into<String>>(msg: T) -> Self {
        Error::Media(msg.into())
    }

    /// Create a provider error carrying the HTTP status it came with
    pub fn provider(status: Option<u16>, msg: impl Into<String>) -> Self {
        Error::Provider { status, message: msg.into() }
    }
}

impl Error {
    /// HTTP status observed on the provider side, if this error carries one
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Error::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// Transient errors are worth retrying: provider 5xx/429, plain network
    /// failures, and model output that failed validation (the model may
    /// comply on the next attempt)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider { status: Some(code), .. } => *code >= 500 || *code == 429,
            Error::Provider { status: None, .. } => true,
            Error::Network(_) => true,
            Error::Validation(_) => true,
            _ => false,
        }
    }

    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Queue(_) => 500,
            Error::Provider { .. } => 502,
            Error::Media(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Network(_) => 503,
            Error::Other(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Queue(_) => "queue",
            Error::Provider { .. } => "provider",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Network(_) => "network",
            Error::Media(_) => "media",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("missing theme");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_provider_status() {
        let err = Error::provider(Some(429), "rate limited");
        assert_eq!(err.provider_status(), Some(429));
        assert_eq!(err.category(), "provider");

        let err = Error::queue("BRPOP failed");
        assert_eq!(err.provider_status(), None);
    }
}
