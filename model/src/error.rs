#[cfg(feature = "testing")]
use proptest_derive::Arbitrary;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::Display;

/// Classifies why a query or an analysis ended up failed.
#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "PascalCase")]
pub enum ErrorKind {
    /// The integration rejected or could not accept the query.
    Submission,
    /// The query ran but the warehouse reported a failure.
    Execution,
    /// Polling exceeded the configured bound.
    Timeout,
    /// The result transform rejected otherwise successful raw results.
    Transform,
    /// The process owning the query went away before it settled.
    Interrupted,
    Internal,
}

/// Error detail persisted on failed query records and errored analyses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn submission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Submission, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Query did not complete within {}s", after.as_secs_f64()),
        )
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    pub fn interrupted() -> Self {
        Self::new(
            ErrorKind::Interrupted,
            "Query was interrupted before it reported a result",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
