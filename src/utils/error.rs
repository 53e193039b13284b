use thiserror::Error;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level trouble; another attempt (possibly through another proxy) may succeed.
    Transient,
    /// Retrying will not help until code, selectors or configuration change.
    Permanent,
    /// Bad input data for a single item; skip it and continue.
    Validation,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("Proxy error: {proxy}: {message}")]
    Proxy { proxy: String, message: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Page structure changed: {attempted} selector sets tried without a match")]
    StructureChanged { attempted: usize },

    #[error("Invalid selector: {selector}")]
    InvalidSelector { selector: String },

    #[error("Parsing error: {message}")]
    Parse { message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // A request or client that cannot be built fails the same way every time
            AppError::Http(e) if e.is_builder() => ErrorKind::Permanent,
            AppError::Http(_) | AppError::Status { .. } | AppError::Proxy { .. } => ErrorKind::Transient,
            AppError::Parse { .. } | AppError::Validation(_) | AppError::Serialization(_) => ErrorKind::Validation,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::Io(_)
            | AppError::Cache(_)
            | AppError::StructureChanged { .. }
            | AppError::InvalidSelector { .. }
            | AppError::Internal(_) => ErrorKind::Permanent,
        }
    }

    /// Only transient failures are worth another request.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Client construction failures are setup problems, not network trouble.
pub fn client_setup_error(e: reqwest::Error) -> AppError {
    AppError::Internal(format!("HTTP client setup failed: {}", e))
}
