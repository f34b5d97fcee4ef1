use async_trait::async_trait;
use model::error::{ErrorKind, RecordError};
use model::query::RawResult;
use std::collections::BTreeMap;
use thiserror::Error;

/// Values substituted for `{{name}}` placeholders in query text.
pub type TemplateVariables = BTreeMap<String, String>;

/// Opaque token an integration hands out for a job it runs asynchronously.
pub type JobHandle = String;

/// What a warehouse answers to a submission.
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    /// The warehouse ran the query synchronously.
    Rows(RawResult),
    /// The warehouse accepted a job that has to be polled.
    Pending(JobHandle),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollStatus {
    Pending,
    Succeeded(RawResult),
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("Query rejected: {0}")]
    Rejected(String),

    #[error("Query failed: {0}")]
    Execution(String),

    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown job '{0}'")]
    UnknownJob(JobHandle),

    #[error("Cancellation is not supported by this warehouse")]
    CancelUnsupported,
}

impl IntegrationError {
    /// Submission and execution failures end up the same way on the record,
    /// only the kind tells them apart.
    pub fn into_record_error(self) -> RecordError {
        let kind = match self {
            IntegrationError::Execution(_) => ErrorKind::Execution,
            _ => ErrorKind::Submission,
        };
        RecordError::new(kind, self.to_string())
    }
}

/// Adapter to one external data warehouse.
///
/// Warehouses that only run queries synchronously never return
/// [`Submission::Pending`] and may leave polling unimplemented.
#[async_trait]
pub trait Integration: Send + Sync {
    async fn submit_query(
        &self,
        sql: &str,
        vars: &TemplateVariables,
    ) -> Result<Submission, IntegrationError>;

    async fn poll_query(&self, handle: &str) -> Result<PollStatus, IntegrationError> {
        Err(IntegrationError::UnknownJob(handle.to_string()))
    }

    /// Best effort: the job may already have finished or be unreachable.
    async fn cancel_query(&self, _handle: &str) -> Result<(), IntegrationError> {
        Err(IntegrationError::CancelUnsupported)
    }

    /// Wraps `sql` so that it returns at most `limit` rows.
    fn limit_query(&self, sql: &str, limit: usize) -> String {
        format!("SELECT * FROM ({sql}) AS limited_query LIMIT {limit}")
    }
}

/// Replaces every `{{name}}` placeholder that has a value in `vars`.
/// Unknown placeholders are left in place for the warehouse to reject.
pub fn render(sql: &str, vars: &TemplateVariables) -> String {
    vars.iter().fold(sql.to_string(), |rendered, (name, value)| {
        rendered.replace(&format!("{{{{{name}}}}}"), value)
    })
}
