use crate::analysis::{AnalysisSpec, IntegrationRegistry};
use crate::orchestrator::{
    AnalysisById, AwaitAnalysis, CancelAnalysis, LatestAnalysis, OrchestratorRequest,
    QueriesById, ResumeAnalysis, SubmitAnalysis, TestQuery,
};
use crate::request::Request;
use anyhow::Result;
use catalog::Catalog;
use controller::analysis::{QueryRunner, StartMode, TestQueryResult};
use model::analysis::analysis_status::AnalysisStatus;
use model::analysis::{self, GetAnalysis};
use model::query;
use std::sync::Arc;
use tracing::{Instrument, debug, info, instrument, warn};

macro_rules! dispatch {
    ($req:expr, $catalog:expr, $field:ident . $method:ident) => {{
        debug!("Received: {:?}", $req);
        let Request { payload, reply_to } = $req;
        let _ = reply_to.send($catalog.$field.$method(payload).await.map_err(Into::into));
    }};
}

/// Runs the request on its own task so a long analysis never stalls the loop.
macro_rules! spawn_reply {
    ($req:expr, $services:expr, $method:ident) => {{
        debug!("Received: {:?}", $req);
        let Request { payload, reply_to } = $req;
        let services = $services.clone();
        tokio::spawn(
            async move {
                let _ = reply_to.send(services.$method(payload).await);
            }
            .in_current_span(),
        );
    }};
}

/// Everything a request needs besides the catalog, shared with spawned requests.
#[derive(Clone)]
struct Services {
    runner: QueryRunner,
    integrations: Arc<IntegrationRegistry>,
}

impl Services {
    async fn submit(&self, request: SubmitAnalysis) -> Result<analysis::Model> {
        let integration = self.integrations.get(request.spec.datasource_id())?;
        Ok(request
            .spec
            .start(&self.runner, integration, request.mode)
            .await?)
    }

    async fn cancel(&self, CancelAnalysis(id): CancelAnalysis) -> Result<analysis::Model> {
        let record = self.runner.get_analysis(id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let spec = AnalysisSpec::from_record(&record)?;
        let integration = self.integrations.get(spec.datasource_id())?;
        Ok(self.runner.cancel_queries(integration, id).await?)
    }

    async fn resume(&self, ResumeAnalysis { id, mode }: ResumeAnalysis) -> Result<analysis::Model> {
        let record = self.runner.get_analysis(id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let spec = AnalysisSpec::from_record(&record)?;
        let integration = self.integrations.get(spec.datasource_id())?;
        Ok(spec.resume(&self.runner, integration, id, mode).await?)
    }

    async fn await_settled(&self, AwaitAnalysis(id): AwaitAnalysis) -> Result<analysis::Model> {
        Ok(self.runner.await_analysis(id).await?)
    }

    async fn analysis(&self, AnalysisById(id): AnalysisById) -> Result<analysis::Model> {
        Ok(self.runner.get_analysis(id).await?)
    }

    async fn latest(&self, LatestAnalysis(target): LatestAnalysis) -> Result<Option<analysis::Model>> {
        Ok(self.runner.get_latest_analysis(&target).await?)
    }

    async fn queries(&self, QueriesById(ids): QueriesById) -> Result<Vec<Option<query::Model>>> {
        Ok(self.runner.get_queries(&ids).await?)
    }

    async fn test_query(&self, request: TestQuery) -> Result<TestQueryResult> {
        let integration = self.integrations.get(&request.datasource_id)?;
        Ok(self
            .runner
            .test_query(integration.as_ref(), &request.sql, &request.vars, request.limit)
            .await)
    }
}

pub(super) struct RequestHandler {
    receiver: flume::Receiver<OrchestratorRequest>,
    catalog: Catalog,
    services: Services,
}

impl RequestHandler {
    pub(super) fn new(
        receiver: flume::Receiver<OrchestratorRequest>,
        catalog: Catalog,
        runner: QueryRunner,
        integrations: Arc<IntegrationRegistry>,
    ) -> RequestHandler {
        Self {
            receiver,
            catalog,
            services: Services {
                runner,
                integrations,
            },
        }
    }

    #[instrument(skip(self))]
    pub(super) async fn run(self) {
        loop {
            match self.receiver.recv_async().await {
                Ok(req) => self.handle_recv(req).await,
                Err(_) => {
                    info!("All clients have been dropped");
                    return;
                }
            }
        }
    }

    /// Picks up analyses an earlier process left unsettled.
    #[instrument(skip(self))]
    pub(super) async fn recover(&self) {
        let mut unsettled = Vec::new();
        for status in AnalysisStatus::IN_FLIGHT {
            match self
                .catalog
                .analysis
                .get_analyses(GetAnalysis::new().with_status(status))
                .await
            {
                Ok(found) => unsettled.extend(found),
                Err(err) => warn!(%status, "Failed to list unsettled analyses: {err}"),
            }
        }
        if unsettled.is_empty() {
            return;
        }

        info!(count = unsettled.len(), "Resuming unsettled analyses");
        for record in unsettled {
            let request = ResumeAnalysis {
                id: record.id,
                mode: StartMode::Detached,
            };
            if let Err(err) = self.services.resume(request).await {
                warn!(analysis_id = record.id, "Failed to resume analysis: {err}");
            }
        }
    }

    #[instrument(skip(self))]
    async fn handle_recv(&self, req: OrchestratorRequest) {
        match req {
            OrchestratorRequest::SubmitAnalysis(r) => spawn_reply!(r, self.services, submit),
            OrchestratorRequest::CancelAnalysis(r) => spawn_reply!(r, self.services, cancel),
            OrchestratorRequest::ResumeAnalysis(r) => spawn_reply!(r, self.services, resume),
            OrchestratorRequest::AwaitAnalysis(r) => {
                spawn_reply!(r, self.services, await_settled)
            }
            OrchestratorRequest::TestQuery(r) => spawn_reply!(r, self.services, test_query),
            OrchestratorRequest::AnalysisById(r) => spawn_reply!(r, self.services, analysis),
            OrchestratorRequest::LatestAnalysis(r) => spawn_reply!(r, self.services, latest),
            OrchestratorRequest::QueriesById(r) => spawn_reply!(r, self.services, queries),
            OrchestratorRequest::GetAnalyses(r) => {
                dispatch!(r, self.catalog, analysis.get_analyses)
            }
            OrchestratorRequest::GetQueries(r) => {
                dispatch!(r, self.catalog, query.get_queries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::CustomParams;
    use crate::orchestrator::{SubmitAnalysis, call};
    use catalog::database::Database;
    use controller::analysis::RunnerConfig;
    use controller::integration::TemplateVariables;
    use controller::testing::{Script, ScriptedIntegration};
    use model::query::GetQueryRecord;
    use serde_json::json;
    use std::time::Duration;

    struct TestHandle {
        sender: flume::Sender<OrchestratorRequest>,
        catalog: Catalog,
        warehouse: Arc<ScriptedIntegration>,
    }

    impl TestHandle {
        async fn new(warehouse: ScriptedIntegration) -> Self {
            let catalog = Catalog::from(Database::for_test().await);
            let warehouse = Arc::new(warehouse);
            let integrations = IntegrationRegistry::new().register("ds", warehouse.clone());
            let config = RunnerConfig {
                poll_interval: Duration::from_millis(1),
                poll_timeout: Duration::from_secs(10),
            };
            let runner = QueryRunner::new(catalog.clone(), config);

            let (sender, receiver) = flume::bounded(16);
            let handler = RequestHandler::new(receiver, catalog.clone(), runner, Arc::new(integrations));
            tokio::spawn(handler.run());
            Self {
                sender,
                catalog,
                warehouse,
            }
        }
    }

    fn custom(name: &str, sql: &str) -> AnalysisSpec {
        AnalysisSpec::Custom(CustomParams {
            datasource_id: "ds".into(),
            name: name.into(),
            sql: sql.into(),
            vars: TemplateVariables::new(),
        })
    }

    #[tokio::test]
    async fn submitted_analysis_settles() {
        let handle = TestHandle::new(
            ScriptedIntegration::new().on("count", Script::rows(json!([{ "count": 10 }]))),
        )
        .await;

        let analysis: analysis::Model = call(
            &handle.sender,
            SubmitAnalysis::new(custom("total", "SELECT count")),
        )
        .await
        .unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Success);
        assert_eq!(analysis.result, Some(json!({ "count": 10 })));
        assert_eq!(analysis.target_key, "custom:ds:total");

        let queries: Vec<query::Model> = call(
            &handle.sender,
            GetQueryRecord::new().with_analysis_id(analysis.id),
        )
        .await
        .unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].name, "total");
    }

    #[tokio::test]
    async fn unknown_datasource_is_rejected_before_persisting() {
        let handle = TestHandle::new(ScriptedIntegration::new()).await;
        let mut spec = custom("x", "SELECT 1");
        if let AnalysisSpec::Custom(params) = &mut spec {
            params.datasource_id = "elsewhere".into();
        }

        let result: Result<analysis::Model> = call(&handle.sender, SubmitAnalysis::new(spec)).await;
        assert!(result.unwrap_err().to_string().contains("elsewhere"));
        assert!(handle
            .catalog
            .analysis
            .get_analyses(GetAnalysis::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn long_analysis_does_not_block_other_requests() {
        let handle = TestHandle::new(ScriptedIntegration::new().on("hang", Script::Hang)).await;

        let pending = tokio::spawn({
            let sender = handle.sender.clone();
            async move {
                call::<_, analysis::Model>(&sender, SubmitAnalysis::new(custom("slow", "SELECT hang"))).await
            }
        });

        let running = loop {
            let found: Vec<analysis::Model> = call(&handle.sender, GetAnalysis::new()).await.unwrap();
            if let Some(record) = found.into_iter().find(|a| a.status == AnalysisStatus::Running) {
                break record;
            }
            tokio::task::yield_now().await;
        };

        let canceled: analysis::Model = call(&handle.sender, CancelAnalysis(running.id)).await.unwrap();
        assert_eq!(canceled.status, AnalysisStatus::Canceled);
        assert_eq!(pending.await.unwrap().unwrap().status, AnalysisStatus::Canceled);
        assert_eq!(handle.warehouse.submitted(), vec!["SELECT hang".to_string()]);
    }
}
