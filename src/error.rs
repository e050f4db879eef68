//! Error taxonomy for the fetch boundary and cached results.
//!
//! Fetch and mutation functions classify their failures into `FetchError`
//! variants at the boundary; the engine branches only on the tag and never
//! inspects ad hoc fields. Subscribers observe `QueryError` values on cache
//! entries — the engine itself never throws.

use thiserror::Error;

/// Failure reported by a fetch or mutation function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network failure or server-side fault (5xx-equivalent). Retried with
    /// backoff.
    #[error("transient fetch failure: {message}")]
    Transient { message: String },

    /// Invalid request or validation failure (4xx-equivalent). Surfaced
    /// immediately, never retried.
    #[error("fetch rejected: {message}")]
    Client { message: String },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    /// Classify an HTTP-style status code.
    ///
    /// 4xx maps to [`FetchError::Client`]; everything else is treated as
    /// transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if (400..500).contains(&status) {
            Self::client(message)
        } else {
            Self::transient(message)
        }
    }

    /// Whether the retry policy may re-attempt after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure observable on a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The stored value could not be deserialized into the requested type.
    #[error("cached value could not be decoded: {message}")]
    Decode { message: String },
}

impl QueryError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(!FetchError::from_status(400, "bad request").is_transient());
        assert!(!FetchError::from_status(404, "missing").is_transient());
        assert!(FetchError::from_status(500, "boom").is_transient());
        assert!(FetchError::from_status(503, "overloaded").is_transient());
    }

    #[test]
    fn transient_tag() {
        assert!(FetchError::transient("connection reset").is_transient());
        assert!(!FetchError::client("validation failed").is_transient());
    }

    #[test]
    fn display_carries_message() {
        let err = FetchError::transient("connection reset");
        assert!(err.to_string().contains("connection reset"));

        let err = QueryError::decode("expected array");
        assert!(err.to_string().contains("expected array"));
    }

    #[test]
    fn query_error_wraps_fetch_error_transparently() {
        let fetch = FetchError::client("no such course");
        let query: QueryError = fetch.clone().into();
        assert_eq!(query.to_string(), fetch.to_string());
    }
}
