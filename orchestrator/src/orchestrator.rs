use crate::analysis::{AnalysisSpec, IntegrationRegistry};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::logging;
use crate::request::{Request, requests};
use crate::request_handler::RequestHandler;
use anyhow::{Context, Result};
use catalog::Catalog;
use catalog::database::Database;
use controller::analysis::{QueryRunner, StartMode, TestQueryResult};
use controller::integration::TemplateVariables;
use model::analysis::{self, AnalysisId, GetAnalysis, TargetKey};
use model::query::{self, GetQueryRecord, QueryId};
use std::sync::Arc;
use tracing::{Instrument, info, info_span};

/// Start an analysis. Fails with a conflict while another analysis of the
/// same target is in flight.
#[derive(Clone, Debug)]
pub struct SubmitAnalysis {
    pub spec: AnalysisSpec,
    pub mode: StartMode,
}

impl SubmitAnalysis {
    pub fn new(spec: AnalysisSpec) -> Self {
        Self {
            spec,
            mode: StartMode::Settled,
        }
    }

    pub fn detached(mut self) -> Self {
        self.mode = StartMode::Detached;
        self
    }
}

#[derive(Clone, Debug)]
pub struct CancelAnalysis(pub AnalysisId);

#[derive(Clone, Debug)]
pub struct ResumeAnalysis {
    pub id: AnalysisId,
    pub mode: StartMode,
}

/// Wait for an analysis to settle.
#[derive(Clone, Debug)]
pub struct AwaitAnalysis(pub AnalysisId);

#[derive(Clone, Debug)]
pub struct AnalysisById(pub AnalysisId);

#[derive(Clone, Debug)]
pub struct LatestAnalysis(pub TargetKey);

#[derive(Clone, Debug)]
pub struct QueriesById(pub Vec<QueryId>);

#[derive(Clone, Debug)]
pub struct TestQuery {
    pub datasource_id: String,
    pub sql: String,
    pub vars: TemplateVariables,
    pub limit: usize,
}

requests!(OrchestratorRequest {
    SubmitAnalysis(SubmitAnalysis) -> analysis::Model,
    CancelAnalysis(CancelAnalysis) -> analysis::Model,
    ResumeAnalysis(ResumeAnalysis) -> analysis::Model,
    AwaitAnalysis(AwaitAnalysis) -> analysis::Model,
    AnalysisById(AnalysisById) -> analysis::Model,
    LatestAnalysis(LatestAnalysis) -> Option<analysis::Model>,
    QueriesById(QueriesById) -> Vec<Option<query::Model>>,
    GetAnalyses(GetAnalysis) -> Vec<analysis::Model>,
    GetQueries(GetQueryRecord) -> Vec<query::Model>,
    TestQuery(TestQuery) -> TestQueryResult,
});

pub type OrchestratorHandle = flume::Sender<OrchestratorRequest>;

/// Sends `payload` to the orchestrator and waits for its answer.
pub async fn call<P, T>(handle: &OrchestratorHandle, payload: P) -> Result<T>
where
    Request<P, T>: Into<OrchestratorRequest>,
{
    let (request, rx) = Request::new(payload);
    handle
        .send_async(request.into())
        .await
        .map_err(|_| OrchestratorError::Stopped)?;
    rx.await.map_err(|_| OrchestratorError::Stopped)?
}

async fn connect(config: &OrchestratorConfig) -> Result<Catalog> {
    let db = Database::with(config.state_backend())
        .await
        .context("Failed to open the state database")?;
    db.migrate().await.context("Failed to migrate the state database")?;
    Ok(Catalog::from(db))
}

fn handler(
    config: &OrchestratorConfig,
    catalog: Catalog,
    integrations: IntegrationRegistry,
    receiver: flume::Receiver<OrchestratorRequest>,
) -> RequestHandler {
    let runner = QueryRunner::new(catalog.clone(), config.runner_config());
    RequestHandler::new(receiver, catalog, runner, Arc::new(integrations))
}

/// Runs the orchestrator on a dedicated thread with its own runtime.
/// Returns once the state database is ready.
pub fn start(config: OrchestratorConfig, integrations: IntegrationRegistry) -> Result<OrchestratorHandle> {
    logging::init(&config.log_filter);
    info!("Starting");
    let (handle, receiver) = flume::bounded(config.channel_capacity);
    let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(1);

    std::thread::Builder::new()
        .name("orchestrator".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.into()));
                    return;
                }
            };

            rt.block_on(async move {
                let catalog = match connect(&config).await {
                    Ok(catalog) => catalog,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let handler = handler(&config, catalog, integrations, receiver);
                if config.resume_on_start {
                    handler.recover().await;
                }
                let _ = ready_tx.send(Ok(()));

                handler
                    .run()
                    .instrument(info_span!("request_handler"))
                    .await
            });

            rt.shutdown_background();
        })
        .context("Failed to spawn the orchestrator thread")?;

    ready_rx
        .recv()
        .context("Orchestrator thread exited during startup")??;
    Ok(handle)
}

/// Runs the orchestrator as a task on the current runtime.
/// Installs the log subscriber unless the embedding program already did.
pub async fn spawn(
    config: OrchestratorConfig,
    integrations: IntegrationRegistry,
) -> Result<OrchestratorHandle> {
    logging::init(&config.log_filter);
    info!("Starting");
    let (handle, receiver) = flume::bounded(config.channel_capacity);

    let catalog = connect(&config).await?;
    let handler = handler(&config, catalog, integrations, receiver);
    if config.resume_on_start {
        handler.recover().await;
    }

    tokio::spawn(async move {
        handler
            .run()
            .instrument(info_span!("request_handler"))
            .await
    });

    Ok(handle)
}
