use crate::analysis::RunnerConfig;
use crate::clock::Clock;
use crate::integration::{Integration, JobHandle, PollStatus, Submission, TemplateVariables};
use catalog::CatalogError;
use catalog::query_catalog::QueryCatalog;
use model::error::RecordError;
use model::query::{self, QueryId, QueryOutcome, RawResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

/// How a poll loop ended.
pub(crate) enum PollEnd {
    Succeeded(RawResult),
    Failed(RecordError),
    TimedOut,
    Canceled,
}

/// Polls `handle` every `poll_interval` until the job settles, the token is
/// cancelled or `poll_timeout` elapsed since the first wait.
pub(crate) async fn poll_until_settled(
    integration: &dyn Integration,
    clock: &dyn Clock,
    config: &RunnerConfig,
    handle: &str,
    token: &CancellationToken,
) -> PollEnd {
    let started = clock.now();
    let mut polls = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return PollEnd::Canceled,
            _ = clock.sleep(config.poll_interval) => {}
        }

        polls += 1;
        let status = tokio::select! {
            biased;
            _ = token.cancelled() => return PollEnd::Canceled,
            status = integration.poll_query(handle) => status,
        };

        match status {
            Ok(PollStatus::Pending) => {
                debug!(handle, polls, "Job still pending");
                if clock.now().duration_since(started) >= config.poll_timeout {
                    return PollEnd::TimedOut;
                }
            }
            Ok(PollStatus::Succeeded(rows)) => return PollEnd::Succeeded(rows),
            Ok(PollStatus::Failed(message)) => {
                return PollEnd::Failed(RecordError::execution(message));
            }
            Err(err) => return PollEnd::Failed(err.into_record_error()),
        }
    }
}

/// Writes `outcome` unless the record already settled. Returns whether this
/// call made the transition, and the stored record either way.
pub(crate) async fn settle(
    queries: &QueryCatalog,
    id: QueryId,
    outcome: QueryOutcome,
) -> Result<(bool, query::Model), CatalogError> {
    match queries.finish_query(id, outcome).await? {
        Some(model) => Ok((true, model)),
        None => Ok((false, queries.get_query(id).await?)),
    }
}

pub(crate) async fn cancel_external(integration: &dyn Integration, handle: &str) {
    if let Err(err) = integration.cancel_query(handle).await {
        warn!(handle, "Failed to cancel job: {err}");
    }
}

/// The one way a query record gets canceled, whatever triggered it.
/// Only the caller that moves the record to Canceled contacts the warehouse,
/// so a job is asked to stop at most once.
pub(crate) async fn cancel_query(
    integration: &dyn Integration,
    queries: &QueryCatalog,
    id: QueryId,
    handle: Option<&str>,
) -> Result<query::Model, CatalogError> {
    let (won, model) = settle(queries, id, QueryOutcome::Canceled).await?;
    if won {
        debug!(query_id = id, "Query canceled");
        if let Some(handle) = handle {
            cancel_external(integration, handle).await;
        }
    }
    Ok(model)
}

/// Where a query task picks up its query.
pub(crate) enum Entry {
    Submit {
        sql: String,
        vars: TemplateVariables,
    },
    /// Already submitted by an earlier runner that went away.
    Resume(JobHandle),
}

#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) integration: Arc<dyn Integration>,
    pub(crate) queries: Arc<QueryCatalog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: RunnerConfig,
    pub(crate) token: CancellationToken,
}

/// Drives one query record from submission to a terminal status.
pub(crate) struct QueryTask {
    pub(crate) id: QueryId,
    pub(crate) entry: Entry,
    pub(crate) ctx: TaskContext,
}

impl QueryTask {
    pub(crate) async fn run(self) -> Result<query::Model, CatalogError> {
        let QueryTask { id, entry, ctx } = self;
        let integration = ctx.integration.as_ref();
        let queries = ctx.queries.as_ref();

        let handle = match entry {
            Entry::Resume(handle) => handle,
            Entry::Submit { sql, vars } => {
                let mut submit = Box::pin({
                    let integration = ctx.integration.clone();
                    async move { integration.submit_query(&sql, &vars).await }
                });
                let submission = tokio::select! {
                    biased;
                    _ = ctx.token.cancelled() => None,
                    submission = &mut submit => Some(submission),
                };
                let Some(submission) = submission else {
                    let canceled = cancel_query(integration, queries, id, None).await?;
                    // The warehouse may still accept the job after we stopped waiting
                    let integration = ctx.integration.clone();
                    tokio::spawn(
                        async move {
                            if let Ok(Submission::Pending(handle)) = submit.await {
                                debug!(query_id = id, handle = %handle, "Job accepted after cancel");
                                cancel_external(integration.as_ref(), &handle).await;
                            }
                        }
                        .in_current_span(),
                    );
                    return Ok(canceled);
                };

                match submission {
                    Ok(Submission::Rows(rows)) => {
                        debug!(query_id = id, rows = rows.len(), "Query returned synchronously");
                        return Ok(settle(queries, id, QueryOutcome::Succeeded(rows)).await?.1);
                    }
                    Err(err) => {
                        let err = err.into_record_error();
                        return Ok(settle(queries, id, QueryOutcome::Failed(err)).await?.1);
                    }
                    Ok(Submission::Pending(handle)) => {
                        if queries
                            .set_external_handle(id, handle.clone())
                            .await?
                            .is_none()
                        {
                            // Canceled while the submission was in flight
                            cancel_external(integration, &handle).await;
                            return queries.get_query(id).await;
                        }
                        debug!(query_id = id, handle = %handle, "Query submitted as job");
                        handle
                    }
                }
            }
        };

        match poll_until_settled(
            integration,
            ctx.clock.as_ref(),
            &ctx.config,
            &handle,
            &ctx.token,
        )
        .await
        {
            PollEnd::Succeeded(rows) => {
                Ok(settle(queries, id, QueryOutcome::Succeeded(rows)).await?.1)
            }
            PollEnd::Failed(err) => Ok(settle(queries, id, QueryOutcome::Failed(err)).await?.1),
            PollEnd::Canceled => cancel_query(integration, queries, id, Some(&handle)).await,
            PollEnd::TimedOut => {
                warn!(query_id = id, handle = %handle, timeout = ?ctx.config.poll_timeout, "Job timed out");
                let timeout = RecordError::timeout(ctx.config.poll_timeout);
                let (won, model) = settle(queries, id, QueryOutcome::Failed(timeout)).await?;
                if won {
                    cancel_external(integration, &handle).await;
                }
                Ok(model)
            }
        }
    }
}
