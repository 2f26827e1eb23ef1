use thiserror::Error;

/// Classified failure of a call against the authoritative store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict: {0}")]
    Conflict(String),
    /// The write gate is closed; this process no longer holds leadership.
    #[error("write fenced: leadership not held")]
    Fenced,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transient: {0}")]
    Transient(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::NotFound) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ApiError::AlreadyExists) }
    pub fn is_conflict(&self) -> bool { matches!(self, ApiError::Conflict(_)) }

    /// Classify an HTTP status + reason pair the way the API server reports them.
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        match (code, reason) {
            (404, _) => ApiError::NotFound,
            (409, "AlreadyExists") => ApiError::AlreadyExists,
            (409, _) => ApiError::Conflict(message.to_string()),
            (400, _) | (422, _) => ApiError::Invalid(message.to_string()),
            _ => ApiError::Transient(format!("{code} {reason}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(ApiError::from_status(404, "NotFound", "").is_not_found());
        assert!(ApiError::from_status(409, "AlreadyExists", "x").is_already_exists());
        assert!(ApiError::from_status(409, "Conflict", "stale").is_conflict());
        assert!(matches!(ApiError::from_status(422, "Invalid", "bad"), ApiError::Invalid(_)));
        assert!(matches!(ApiError::from_status(503, "ServiceUnavailable", ""), ApiError::Transient(_)));
    }
}
