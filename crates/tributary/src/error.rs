//! Error types for the toolkit and the broker-client seam

use std::sync::Arc;

pub type ClientResult<T> = std::result::Result<T, ClientError>;
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a broker client implementation.
///
/// Transient errors are retried by the client itself and reach the toolkit
/// only as log/callback detail; fatal errors end the operation they belong
/// to (a delivery, a poll loop) and are treated as terminate causes.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ClientError {
    /// A recoverable transport problem, retried by the client
    #[error("broker transport error: {0}")]
    Transport(String),
    /// An unrecoverable broker error
    #[error("fatal broker error: {0}")]
    Fatal(String),
    /// The topic or partition is unknown to the broker
    #[error("unknown topic or partition: {topic}[{partition}]")]
    UnknownPartition { topic: String, partition: i32 },
    /// The client has been closed and can serve no further requests
    #[error("broker client closed")]
    Closed,
}

impl ClientError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Transport(_))
    }
}

/// All errors that can be returned by toolkit operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration, raised at build/initialize time
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An error from the underlying broker client
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Serialization or deserialization of a record payload failed
    #[error("codec error: {0}")]
    Codec(String),
    /// The operation was cancelled; a benign termination cause
    #[error("operation cancelled")]
    Cancelled,
    /// An error returned by an application handler
    #[error("handler error: {0}")]
    Handler(Arc<dyn std::error::Error + Send + Sync>),
    /// `stop` was called on a consumer that had already been stopped
    #[error("consumer already stopped")]
    AlreadyStopped,
    /// An operation was attempted in a state that does not allow it
    #[error("invalid {operation} on a {status} processor")]
    InvalidTransition {
        operation: &'static str,
        status: &'static str,
        /// The cause the ignored operation carried, kept for diagnostics
        cause: Option<Arc<Error>>,
    },
    /// Multiple failures collected during shutdown, flattened
    #[error("{} errors: [{}]", .0.len(), join_all(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Wrap an arbitrary application error as a handler failure.
    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Handler(Arc::new(err))
    }

    /// Combine two optional failures into at most one, flattening nested
    /// aggregates so readers never see `Aggregate(Aggregate(..))`.
    pub fn aggregate(first: Option<Error>, second: Option<Error>) -> Option<Error> {
        let mut all = Vec::new();
        for err in [first, second].into_iter().flatten() {
            match err {
                Error::Aggregate(inner) => all.extend(inner),
                other => all.push(other),
            }
        }
        match all.len() {
            0 => None,
            1 => all.pop(),
            _ => Some(Error::Aggregate(all)),
        }
    }

    /// Cancellation is a clean exit, not a failure.
    pub(crate) fn normalize_cause(cause: Option<Error>) -> Option<Error> {
        match cause {
            Some(Error::Cancelled) | None => None,
            other => other,
        }
    }
}

fn join_all(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_flattens() {
        let a = Error::Configuration("a".into());
        let b = Error::Aggregate(vec![
            Error::Cancelled,
            Error::Client(ClientError::Closed),
        ]);
        let combined = Error::aggregate(Some(a), Some(b)).unwrap();
        match combined {
            Error::Aggregate(all) => assert_eq!(all.len(), 3),
            other => panic!("expected aggregate, got {other}"),
        }
    }

    #[test]
    fn aggregate_of_one_is_identity() {
        let only = Error::aggregate(None, Some(Error::Cancelled)).unwrap();
        assert!(matches!(only, Error::Cancelled));
        assert!(Error::aggregate(None, None).is_none());
    }

    #[test]
    fn cancellation_normalizes_to_clean() {
        assert!(Error::normalize_cause(Some(Error::Cancelled)).is_none());
        assert!(Error::normalize_cause(Some(Error::AlreadyStopped)).is_some());
    }
}
