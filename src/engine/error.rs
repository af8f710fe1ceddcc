use crate::model::ValidationError;

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Whether retrying the same command later may succeed.
    /// Only durability failures qualify; everything else is decided by the input.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "invalid booking: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(e) => Some(e),
            _ => None,
        }
    }
}
