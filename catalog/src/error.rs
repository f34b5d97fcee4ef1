use model::analysis::analysis_status::AnalysisStatus;
use model::analysis::{AnalysisId, TargetKey};
use model::query::QueryId;
use sea_orm::{DbErr, TransactionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Analysis '{existing}' is already in flight for target '{target_key}'")]
    Conflict {
        target_key: TargetKey,
        existing: AnalysisId,
    },

    #[error("Analysis '{0}' not found")]
    AnalysisNotFound(AnalysisId),

    #[error("Query '{0}' not found")]
    QueryNotFound(QueryId),

    #[error("Analysis '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: AnalysisId,
        from: AnalysisStatus,
        to: AnalysisStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl From<TransactionError<DbErr>> for CatalogError {
    fn from(err: TransactionError<DbErr>) -> Self {
        match err {
            TransactionError::Connection(db_err) | TransactionError::Transaction(db_err) => {
                CatalogError::Database(db_err)
            }
        }
    }
}
