use library::{ObjectError, PayloadError, StoreError};

use crate::upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Conflict(message) => EngineError::Conflict(message),
            StoreError::Invalid(message) => EngineError::Invalid(message),
            other => EngineError::Store(other),
        }
    }
}

impl From<UpstreamError> for EngineError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Unauthorized => {
                EngineError::Unauthenticated("upstream authorization was revoked".to_string())
            }
            other => EngineError::UpstreamUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;
    use crate::upstream::UpstreamError;
    use library::StoreError;

    #[test]
    fn upstream_errors_map_into_taxonomy() {
        let err: EngineError = UpstreamError::Unauthorized.into();
        assert!(matches!(err, EngineError::Unauthenticated(_)));
        let err: EngineError = UpstreamError::RateLimited {
            retry_after_secs: Some(3),
        }
        .into();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
    }

    #[test]
    fn store_domain_errors_keep_their_meaning() {
        let err: EngineError = StoreError::Conflict("dup".to_string()).into();
        assert!(matches!(err, EngineError::Conflict(_)));
        let err: EngineError = StoreError::NotFound("row".to_string()).into();
        assert!(matches!(err, EngineError::NotFound(_)));
        let err: EngineError = StoreError::Io(std::io::Error::other("disk")).into();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
