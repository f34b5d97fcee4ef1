use model::analysis::AnalysisId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No integration registered for datasource '{0}'")]
    UnknownDatasource(String),

    #[error("Analysis '{id}' has params that do not match its kind: {source}")]
    InvalidRecord {
        id: AnalysisId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Orchestrator is not running")]
    Stopped,
}
