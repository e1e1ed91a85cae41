use thiserror::Error;

/// Failures while loading or using authentication material
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Failed to read credential file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse signing key: {0}")]
    KeyParse(String),

    #[error("Failed to sign provider token: {0}")]
    Signing(String),

    #[error("Invalid client certificate: {0}")]
    Certificate(String),
}

/// Transport-level failures, not attributable to a notification's content
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request failed: {0}")]
    Request(String),
}

impl ConnectionError {
    /// Whether the connection that produced this error must be torn down.
    ///
    /// Timeouts and per-request failures only fail the request they belong to.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Connect { .. } | ConnectionError::Closed(_))
    }
}

/// Error type for APNs operations
#[derive(Error, Debug)]
pub enum ApnsError {
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Invalid device token: {0}")]
    InvalidDeviceToken(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Invalid header value for {header}: {message}")]
    InvalidHeader { header: &'static str, message: String },

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("APNs configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<ApnsError> for String {
    fn from(err: ApnsError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, ApnsError>;
