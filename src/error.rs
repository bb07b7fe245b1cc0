use std::fmt;

#[derive(Debug)]
pub enum MigrateError {
    /// Missing or malformed snapshot, bad configuration. Never retried.
    Input(String),
    /// Another instance holds the singleton lock.
    Lock(String),
    /// The progress file could not be written or read back.
    Persistence(String),
    /// The ledger collaborator could not be constructed.
    Ledger(String),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrateError::Input(e) => write!(f, "Input error: {}", e),
            MigrateError::Lock(e) => write!(f, "Lock error: {}", e),
            MigrateError::Persistence(e) => write!(f, "Persistence error: {}", e),
            MigrateError::Ledger(e) => write!(f, "Ledger error: {}", e),
            MigrateError::Json(e) => write!(f, "JSON error: {}", e),
            MigrateError::Io(e) => write!(f, "IO error: {}", e),
            MigrateError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MigrateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrateError::Json(e) => Some(e),
            MigrateError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl MigrateError {
    /// Fatal input and lock errors abort before any progress is mutated.
    pub fn is_fatal_input(&self) -> bool {
        matches!(self, MigrateError::Input(_) | MigrateError::Lock(_))
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Json(err)
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io(err)
    }
}

impl From<String> for MigrateError {
    fn from(err: String) -> Self {
        MigrateError::Other(err)
    }
}

impl From<&str> for MigrateError {
    fn from(err: &str) -> Self {
        MigrateError::Other(err.to_string())
    }
}
