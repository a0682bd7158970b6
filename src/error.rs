use derive_more::From;
use std::fmt;
use std::sync::Arc;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    /// Operation is not meaningful for this store variant
    Unsupported { op: &'static str },

    /// No store registered under the key
    MissingStore { key: String },

    /// A store exists under the key, but with a different data/param type
    WrongStoreType { key: String },

    /// Custom error message
    #[from]
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}

/// Failure produced by a query function.
///
/// Statuses are cloned on every publication, so the underlying error is
/// reference-counted. Two `QueryError`s are the *same* observation only when
/// they share the underlying allocation; a retried fetch that fails again
/// yields a distinct observation even if the message matches.
#[derive(Clone)]
pub struct QueryError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl QueryError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    /// A plain-message error, for query functions without a richer type.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }

    /// Identity comparison: same underlying observation.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryError({})", self.0)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_identity() {
        let a = QueryError::msg("boom");
        let b = a.clone();
        let c = QueryError::msg("boom");

        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn test_error_display_carries_variant() {
        let err = Error::MissingStore {
            key: "users".to_string(),
        };
        assert!(err.to_string().contains("users"));
    }
}
