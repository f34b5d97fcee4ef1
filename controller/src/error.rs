use crate::builder::BuildError;
use catalog::CatalogError;
use model::analysis::{AnalysisId, TargetKey};
use model::query::QueryId;
use thiserror::Error;
use tokio::task::JoinError;

/// Errors returned to callers of the runner. Failures of the queries
/// themselves are never returned here: they are recorded on the records.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to build queries: {0}")]
    Build(#[from] BuildError),

    #[error("Analysis '{existing}' is already in flight for target '{target_key}'")]
    Conflict {
        target_key: TargetKey,
        existing: AnalysisId,
    },

    #[error("Analysis '{0}' not found")]
    AnalysisNotFound(AnalysisId),

    #[error("Query '{0}' not found")]
    QueryNotFound(QueryId),

    #[error("Analysis '{0}' is already being run by this process")]
    AlreadyActive(AnalysisId),

    #[error("Failed to serialize analysis params: {0}")]
    Params(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(CatalogError),

    #[error("Analysis task failed: {0}")]
    Task(#[from] JoinError),

    #[error("Catalog notifications stopped")]
    NotificationsClosed,
}

impl From<CatalogError> for RunnerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Conflict {
                target_key,
                existing,
            } => RunnerError::Conflict {
                target_key,
                existing,
            },
            CatalogError::AnalysisNotFound(id) => RunnerError::AnalysisNotFound(id),
            CatalogError::QueryNotFound(id) => RunnerError::QueryNotFound(id),
            other => RunnerError::Catalog(other),
        }
    }
}
