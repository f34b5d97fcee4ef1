use crate::analysis::query_task::{
    Entry, PollEnd, QueryTask, TaskContext, cancel_external, cancel_query, poll_until_settled,
    settle,
};
use crate::analysis::{RunnerConfig, StartAnalysis, StartMode, TestQueryResult};
use crate::builder::{BuiltQuery, build_all};
use crate::clock::{Clock, SystemClock};
use crate::error::RunnerError;
use crate::integration::{Integration, Submission, TemplateVariables};
use crate::transform::ResultTransform;
use catalog::{Catalog, CatalogError, NotifiableCatalog};
use model::analysis::analysis_status::AnalysisStatus;
use model::analysis::{self, AnalysisId, AnalysisOutcome, CreateAnalysis};
use model::error::RecordError;
use model::query::query_status::QueryStatus;
use model::query::{self, CreateQueryRecord, GetQueryRecord, QueryId, QueryOutcome, RawResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Cancellation tokens of the analyses this process is driving.
#[derive(Clone, Default)]
struct ActiveAnalyses(Arc<Mutex<HashMap<AnalysisId, CancellationToken>>>);

impl ActiveAnalyses {
    fn register(&self, id: AnalysisId) -> Option<ActiveGuard> {
        let mut active = self
            .0
            .lock()
            .expect("No one should panic while holding this lock");
        if active.contains_key(&id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(id, token.clone());
        Some(ActiveGuard {
            active: self.clone(),
            id,
            token,
        })
    }

    fn token(&self, id: AnalysisId) -> Option<CancellationToken> {
        self.0
            .lock()
            .expect("No one should panic while holding this lock")
            .get(&id)
            .cloned()
    }
}

/// Keeps an analysis registered as active until dropped.
struct ActiveGuard {
    active: ActiveAnalyses,
    id: AnalysisId,
    token: CancellationToken,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.0.lock() {
            active.remove(&self.id);
        }
    }
}

/// Submits the queries of an analysis, follows them to a terminal status and
/// settles the analysis once every query did.
///
/// The runner holds no per-request state: integrations and transforms are
/// handed in with each call.
#[derive(Clone)]
pub struct QueryRunner {
    catalog: Catalog,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    active: ActiveAnalyses,
}

impl QueryRunner {
    pub fn new(catalog: Catalog, config: RunnerConfig) -> Self {
        Self::with_clock(catalog, Arc::new(SystemClock), config)
    }

    pub fn with_clock(catalog: Catalog, clock: Arc<dyn Clock>, config: RunnerConfig) -> Self {
        Self {
            catalog,
            clock,
            config,
            active: ActiveAnalyses::default(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Builds the queries, claims the target, and runs the queries concurrently.
    ///
    /// Build errors and conflicts are returned before anything is persisted.
    /// Everything that goes wrong afterwards is recorded on the analysis.
    #[instrument(skip_all, fields(target_key = %request.target_key))]
    pub async fn start_analysis<P, T>(
        &self,
        integration: Arc<dyn Integration>,
        request: StartAnalysis<P, T>,
    ) -> Result<analysis::Model, RunnerError>
    where
        P: Serialize,
        T: ResultTransform,
    {
        let StartAnalysis {
            target_key,
            params,
            builders,
            transform,
            mode,
        } = request;

        let built = build_all(&builders, &params, transform.expected_queries())?;
        let params = serde_json::to_value(&params)?;

        let created = self
            .catalog
            .analysis
            .create_analysis_if_absent(
                CreateAnalysis::new(target_key)
                    .kind(transform.kind())
                    .params(params),
            )
            .await?;
        let id = created.id;
        let guard = self
            .active
            .register(id)
            .ok_or(RunnerError::AlreadyActive(id))?;
        info!(analysis_id = id, queries = built.len(), "Analysis created");

        let records = match self.create_records(id, &built).await {
            Ok(records) => records,
            Err(err) => {
                error!(analysis_id = id, "Failed to persist query records: {err}");
                let outcome = AnalysisOutcome::Error(RecordError::internal(err.to_string()));
                return self.finish(id, outcome).await;
            }
        };

        let query_ids: Vec<QueryId> = records.iter().map(|r| r.id).collect();
        let running = match self.catalog.analysis.start_analysis(id, query_ids.clone()).await {
            Ok(running) => running,
            Err(CatalogError::InvalidTransition { from, .. }) => {
                // Settled by someone else before anything was submitted
                warn!(analysis_id = id, %from, "Analysis settled before submission");
                for record in &records {
                    settle(&self.catalog.query, record.id, QueryOutcome::Canceled).await?;
                }
                return Ok(self.catalog.analysis.get_analysis(id).await?);
            }
            Err(err) => return self.abandon(id, &query_ids, err).await,
        };

        let entries = records
            .into_iter()
            .zip(built)
            .map(|(record, query)| {
                let entry = Entry::Submit {
                    sql: query.sql,
                    vars: query.vars,
                };
                (record.id, entry)
            })
            .collect();
        let handle = self.spawn_analysis(integration, id, entries, None, transform, guard);

        match mode {
            StartMode::Detached => Ok(running),
            StartMode::Settled => handle.await?,
        }
    }

    async fn create_records(
        &self,
        analysis_id: AnalysisId,
        built: &[BuiltQuery],
    ) -> Result<Vec<query::Model>, CatalogError> {
        let requests = built
            .iter()
            .enumerate()
            .map(|(position, query)| CreateQueryRecord {
                analysis_id,
                position: position as i32,
                name: query.name.clone(),
                sql: query.sql.clone(),
            })
            .collect();
        self.catalog.query.create_queries(requests).await
    }

    fn spawn_analysis<T: ResultTransform>(
        &self,
        integration: Arc<dyn Integration>,
        id: AnalysisId,
        entries: Vec<(QueryId, Entry)>,
        failure: Option<RecordError>,
        transform: T,
        guard: ActiveGuard,
    ) -> JoinHandle<Result<analysis::Model, RunnerError>> {
        let runner = self.clone();
        tokio::spawn(
            async move {
                let settled = runner
                    .drive(integration, id, entries, failure, transform, guard.token.clone())
                    .await;
                drop(guard);
                settled
            }
            .instrument(info_span!("analysis", id)),
        )
    }

    /// Runs all query tasks to completion and settles the analysis.
    ///
    /// The first failure cancels the remaining queries. A `failure` handed in
    /// counts as that first failure.
    async fn drive<T: ResultTransform>(
        &self,
        integration: Arc<dyn Integration>,
        id: AnalysisId,
        entries: Vec<(QueryId, Entry)>,
        mut failure: Option<RecordError>,
        transform: T,
        token: CancellationToken,
    ) -> Result<analysis::Model, RunnerError> {
        let fail_fast = token.child_token();
        if failure.is_some() {
            fail_fast.cancel();
        }

        let query_ids: Vec<QueryId> = entries.iter().map(|(query_id, _)| *query_id).collect();
        let ctx = TaskContext {
            integration,
            queries: self.catalog.query.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            token: fail_fast.clone(),
        };
        let mut tasks = JoinSet::new();
        for (query_id, entry) in entries {
            let task = QueryTask {
                id: query_id,
                entry,
                ctx: ctx.clone(),
            };
            tasks.spawn(task.run().instrument(info_span!("query", id = query_id)));
        }

        while let Some(joined) = tasks.join_next().await {
            let query_failure = match joined {
                Ok(Ok(record)) if record.status == QueryStatus::Failed => record
                    .error
                    .unwrap_or_else(|| RecordError::internal("failed without error detail")),
                Ok(Ok(record)) => {
                    debug!(query_id = record.id, status = %record.status, "Query settled");
                    continue;
                }
                Ok(Err(err)) => RecordError::internal(err.to_string()),
                Err(err) => RecordError::internal(format!("query task aborted: {err}")),
            };
            if failure.is_none() {
                warn!(error = %query_failure, "Query failed, canceling the remaining queries");
                failure = Some(query_failure);
                fail_fast.cancel();
            }
        }

        let records = match self.settle_stale(id).await {
            Ok(records) => records,
            Err(err) => return self.abandon(id, &query_ids, err).await,
        };
        if failure.is_none() {
            failure = records.iter().find_map(|r| r.error.clone());
        }

        let outcome = match failure {
            Some(err) => AnalysisOutcome::Error(err),
            None if records.iter().all(|r| r.status == QueryStatus::Succeeded) => {
                let results: Vec<RawResult> =
                    records.into_iter().filter_map(|r| r.raw_result).collect();
                match transform.apply(&results) {
                    Ok(aggregate) => AnalysisOutcome::Success(aggregate),
                    Err(err) => {
                        warn!("Transform rejected the results: {err}");
                        AnalysisOutcome::Error(RecordError::transform(err.to_string()))
                    }
                }
            }
            None => AnalysisOutcome::Canceled,
        };
        self.finish(id, outcome).await
    }

    /// Reads back the query records of an analysis after its tasks ended,
    /// failing any a task left Running.
    async fn settle_stale(&self, id: AnalysisId) -> Result<Vec<query::Model>, CatalogError> {
        let mut records = self.catalog.query.get_queries_for_analysis(id).await?;
        for record in records.iter_mut() {
            if record.status == QueryStatus::Running {
                let lost = RecordError::internal("query task ended before the query settled");
                *record = settle(&self.catalog.query, record.id, QueryOutcome::Failed(lost))
                    .await?
                    .1;
            }
        }
        Ok(records)
    }

    /// Fails the analysis and its queries after a catalog error, so the target
    /// does not stay blocked. Best effort: the catalog may keep failing.
    async fn abandon(
        &self,
        id: AnalysisId,
        query_ids: &[QueryId],
        err: CatalogError,
    ) -> Result<analysis::Model, RunnerError> {
        error!(analysis_id = id, "Catalog failed mid-analysis: {err}");
        let cause = RecordError::internal(err.to_string());
        for &query_id in query_ids {
            let outcome = QueryOutcome::Failed(cause.clone());
            if let Err(err) = settle(&self.catalog.query, query_id, outcome).await {
                warn!(query_id, "Failed to settle query: {err}");
            }
        }
        self.finish(id, AnalysisOutcome::Error(cause)).await
    }

    /// Settles the analysis. Losing the race against another writer is not
    /// an error: the stored terminal record is returned instead.
    async fn finish(
        &self,
        id: AnalysisId,
        outcome: AnalysisOutcome,
    ) -> Result<analysis::Model, RunnerError> {
        let to = outcome.status();
        match self.catalog.analysis.finish_analysis(id, outcome).await {
            Ok(settled) => {
                info!(analysis_id = id, status = %to, "Analysis settled");
                Ok(settled)
            }
            Err(CatalogError::InvalidTransition { from, .. }) => {
                warn!(analysis_id = id, %from, attempted = %to, "Analysis already settled");
                Ok(self.catalog.analysis.get_analysis(id).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cancels every running query of the analysis and then the analysis itself.
    /// Canceling a settled analysis does nothing.
    ///
    /// An analysis driven by this process is stopped through its runner, which
    /// cancels its own queries. Any other in-flight analysis is canceled here,
    /// with `integration` used to stop the jobs it left behind.
    #[instrument(skip(self, integration))]
    pub async fn cancel_queries(
        &self,
        integration: Arc<dyn Integration>,
        id: AnalysisId,
    ) -> Result<analysis::Model, RunnerError> {
        let analysis = self.catalog.analysis.get_analysis(id).await?;
        if analysis.is_terminal() {
            debug!(status = %analysis.status, "Analysis already settled");
            return Ok(analysis);
        }

        if let Some(token) = self.active.token(id) {
            info!("Stopping local runner");
            token.cancel();
            return self.await_analysis(id).await;
        }

        let running = self
            .catalog
            .query
            .get_queries(
                GetQueryRecord::new()
                    .with_analysis_id(id)
                    .with_status(QueryStatus::Running),
            )
            .await?;
        info!(queries = running.len(), "Canceling orphaned analysis");

        let mut cancels = JoinSet::new();
        for record in running {
            let integration = integration.clone();
            let queries = self.catalog.query.clone();
            cancels.spawn(async move {
                cancel_query(
                    integration.as_ref(),
                    &queries,
                    record.id,
                    record.external_handle.as_deref(),
                )
                .await
            });
        }
        while let Some(joined) = cancels.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!("Failed to cancel query: {err}"),
                Err(err) => warn!("Cancellation task aborted: {err}"),
            }
        }

        self.finish(id, AnalysisOutcome::Canceled).await
    }

    /// Picks up an analysis whose runner went away, e.g. with a crashed process.
    ///
    /// Running queries with a job handle are polled again. Running queries
    /// without one can no longer be observed and fail as interrupted, which
    /// fails the analysis like any other query failure.
    #[instrument(skip(self, integration, transform))]
    pub async fn resume_analysis<T: ResultTransform>(
        &self,
        integration: Arc<dyn Integration>,
        id: AnalysisId,
        transform: T,
        mode: StartMode,
    ) -> Result<analysis::Model, RunnerError> {
        let analysis = self.catalog.analysis.get_analysis(id).await?;
        if analysis.is_terminal() {
            return Ok(analysis);
        }
        let guard = self
            .active
            .register(id)
            .ok_or(RunnerError::AlreadyActive(id))?;

        let records = self.catalog.query.get_queries_for_analysis(id).await?;
        let mut entries = Vec::new();
        let mut failure = None;
        for record in records {
            let record = match (record.status, record.external_handle.clone()) {
                (QueryStatus::Running, Some(handle)) if analysis.status == AnalysisStatus::Running => {
                    entries.push((record.id, Entry::Resume(handle)));
                    continue;
                }
                (QueryStatus::Running, handle) => {
                    // Nothing to poll, or the analysis never got to submit it
                    if let Some(handle) = handle {
                        cancel_external(integration.as_ref(), &handle).await;
                    }
                    let interrupted = QueryOutcome::Failed(RecordError::interrupted());
                    settle(&self.catalog.query, record.id, interrupted).await?.1
                }
                _ => record,
            };
            if failure.is_none() {
                failure = record.error;
            }
        }

        if analysis.status == AnalysisStatus::Queued {
            drop(guard);
            return self
                .finish(id, AnalysisOutcome::Error(RecordError::interrupted()))
                .await;
        }

        info!(resumed = entries.len(), "Resuming analysis");
        let handle = self.spawn_analysis(integration, id, entries, failure, transform, guard);
        match mode {
            StartMode::Detached => Ok(self.catalog.analysis.get_analysis(id).await?),
            StartMode::Settled => handle.await?,
        }
    }

    /// Waits until the analysis reached a terminal status.
    pub async fn await_analysis(&self, id: AnalysisId) -> Result<analysis::Model, RunnerError> {
        let mut changes = self.catalog.analysis.subscribe_state();
        loop {
            let analysis = self.catalog.analysis.get_analysis(id).await?;
            if analysis.is_terminal() {
                return Ok(analysis);
            }
            changes
                .changed()
                .await
                .map_err(|_| RunnerError::NotificationsClosed)?;
        }
    }

    /// Runs `sql` limited to `limit` rows with the usual submit, poll and
    /// timeout handling. Nothing is persisted and failures end up in `error`.
    #[instrument(skip(self, integration, vars))]
    pub async fn test_query(
        &self,
        integration: &dyn Integration,
        sql: &str,
        vars: &TemplateVariables,
        limit: usize,
    ) -> TestQueryResult {
        let sql = integration.limit_query(sql, limit);
        let started = self.clock.now();

        let outcome = match integration.submit_query(&sql, vars).await {
            Ok(Submission::Rows(rows)) => Ok(rows),
            Err(err) => Err(err.into_record_error()),
            Ok(Submission::Pending(handle)) => {
                let never = CancellationToken::new();
                match poll_until_settled(
                    integration,
                    self.clock.as_ref(),
                    &self.config,
                    &handle,
                    &never,
                )
                .await
                {
                    PollEnd::Succeeded(rows) => Ok(rows),
                    PollEnd::Failed(err) => Err(err),
                    PollEnd::TimedOut => {
                        cancel_external(integration, &handle).await;
                        Err(RecordError::timeout(self.config.poll_timeout))
                    }
                    PollEnd::Canceled => Err(RecordError::internal("test query canceled")),
                }
            }
        };
        let duration = self.clock.now().duration_since(started);

        match outcome {
            Ok(rows) => TestQueryResult {
                rows: rows.truncate(limit).rows,
                sql,
                duration,
                error: None,
            },
            Err(err) => TestQueryResult {
                rows: Vec::new(),
                sql,
                duration,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn get_analysis(&self, id: AnalysisId) -> Result<analysis::Model, RunnerError> {
        Ok(self.catalog.analysis.get_analysis(id).await?)
    }

    /// Latest analysis for the target, settled or not.
    pub async fn get_latest_analysis(
        &self,
        target_key: &str,
    ) -> Result<Option<analysis::Model>, RunnerError> {
        Ok(self.catalog.analysis.get_latest(target_key).await?)
    }

    /// Query records in the order of `ids`, `None` for unknown ids.
    pub async fn get_queries(
        &self,
        ids: &[QueryId],
    ) -> Result<Vec<Option<query::Model>>, RunnerError> {
        Ok(self.catalog.query.get_queries_by_ids(ids).await?)
    }

    /// Query records of an analysis in submission order.
    pub async fn get_analysis_queries(
        &self,
        id: AnalysisId,
    ) -> Result<Vec<query::Model>, RunnerError> {
        Ok(self.catalog.query.get_queries_for_analysis(id).await?)
    }
}
