use thiserror::Error;

/// Wire codes serialized verbatim in the `error` field of the response envelope.
pub const INVALID_TOKEN: &str = "invalid_token";
pub const INVALID_REQUEST: &str = "invalid_request";
pub const INVALID_ID: &str = "invalid_id";
pub const FLOOD_LIMIT: &str = "flood_limit";

#[derive(Error, Debug)]
pub enum DecetyError {
    // Access errors
    #[error("token missing, expired or out of scope")]
    Unauthorized,

    #[error("flood limit reached")]
    FloodLimit,

    // Validation errors
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown or foreign image id: {id}")]
    UnknownImage { id: String },

    #[error("unknown item")]
    UnknownItem,

    #[error("no live variant matches")]
    NoMatch,

    // Read-path absence
    #[error("not found: {key}")]
    NotFound { key: String },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization error: {0}")]
    Bincode(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    // Image derivation
    #[error("image derivation failed: {0}")]
    Derivation(String),

    #[error("identifier space exhausted after {attempts} attempts")]
    ExhaustedIdentifierSpace { attempts: usize },

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // Internal
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Box<bincode::ErrorKind>> for DecetyError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        DecetyError::Bincode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DecetyError>;

impl DecetyError {
    /// The wire code for validation-class errors, `None` for everything that
    /// is not reported through the JSON envelope.
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            DecetyError::Unauthorized => Some(INVALID_TOKEN),
            DecetyError::FloodLimit => Some(FLOOD_LIMIT),
            DecetyError::Conflict(_)
            | DecetyError::InvalidInput(_)
            | DecetyError::UnknownImage { .. } => Some(INVALID_REQUEST),
            DecetyError::UnknownItem | DecetyError::NoMatch => Some(INVALID_ID),
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DecetyError::NotFound { .. } => 404,
            e if e.wire_code().is_some() => 200,
            _ => 500,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.status_code() == 500
    }
}
