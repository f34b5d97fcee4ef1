use catalog::Catalog;
use catalog::database::Database;
use controller::analysis::TestQueryResult;
use controller::integration::TemplateVariables;
use controller::testing::{Script, ScriptedIntegration};
use controller::transform::dimension_slices::DimensionSlicesResult;
use controller::transform::metric_aggregate::MetricAggregate;
use model::analysis::analysis_status::AnalysisStatus;
use model::analysis::{self, CreateAnalysis};
use model::error::ErrorKind;
use model::query::{self, CreateQueryRecord};
use orchestrator::analysis::{
    AnalysisSpec, DimensionSlicesParams, IntegrationRegistry, MetricAggregateParams,
};
use orchestrator::config::{DatabaseConfig, OrchestratorConfig, RunnerSettings};
use orchestrator::orchestrator::{
    AnalysisById, AwaitAnalysis, CancelAnalysis, LatestAnalysis, OrchestratorHandle,
    QueriesById, SubmitAnalysis, TestQuery, call, spawn,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        runner: RunnerSettings {
            poll_interval_ms: 1,
            poll_timeout_secs: 30,
        },
        ..OrchestratorConfig::default()
    }
}

async fn start(warehouse: &Arc<ScriptedIntegration>) -> OrchestratorHandle {
    orchestrator::logging::init_test();
    let integrations = IntegrationRegistry::new().register("warehouse", warehouse.clone());
    spawn(config(), integrations).await.unwrap()
}

fn slices_spec() -> AnalysisSpec {
    AnalysisSpec::DimensionSlices(DimensionSlicesParams {
        datasource_id: "warehouse".into(),
        exposure_query_id: "user_exposures".into(),
        lookback_days: 30,
        dimensions: vec!["country".into(), "browser".into()],
    })
}

#[tokio::test]
async fn dimension_slices_end_to_end() {
    let warehouse = Arc::new(ScriptedIntegration::new().on(
        "user_exposures",
        Script::after_polls(
            2,
            json!([
                { "dimension_name": "country", "dimension_value": "US", "units": 75, "total_units": 100 },
                { "dimension_name": "country", "dimension_value": "DE", "units": 25, "total_units": 100 },
                { "dimension_name": "browser", "dimension_value": null, "units": 100, "total_units": 100 },
            ]),
        ),
    ));
    let handle = start(&warehouse).await;

    let analysis: analysis::Model = call(&handle, SubmitAnalysis::new(slices_spec())).await.unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Success);
    assert_eq!(analysis.target_key, "dimension_slices:warehouse:user_exposures");

    let result: DimensionSlicesResult = analysis.result_as().unwrap().unwrap();
    assert_eq!(result.dimensions.len(), 2);
    assert_eq!(result.dimensions[0].dimension, "country");
    assert_eq!(result.dimensions[0].slices[0].name, "US");
    assert_eq!(result.dimensions[0].slices[0].percent, 75.0);
    assert_eq!(result.dimensions[1].slices[0].name, "(null)");

    let latest: Option<analysis::Model> =
        call(&handle, LatestAnalysis(analysis.target_key.clone())).await.unwrap();
    assert_eq!(latest.map(|a| a.id), Some(analysis.id));

    let queries: Vec<Option<query::Model>> =
        call(&handle, QueriesById(analysis.query_ids.0.clone())).await.unwrap();
    let query = queries[0].as_ref().unwrap();
    assert_eq!(query.name, "dimension_slices");
    assert!(query.external_handle.is_some());
    assert!(warehouse.submitted()[0].contains("FROM user_exposures"));
}

#[tokio::test]
async fn metric_aggregate_end_to_end() {
    let warehouse = Arc::new(ScriptedIntegration::new().on(
        "FROM revenue",
        Script::rows(json!([
            { "slice": "mobile", "count": 2, "main_sum": 10.0 },
            { "slice": "desktop", "count": 3, "main_sum": 30.0 },
        ])),
    ));
    let handle = start(&warehouse).await;
    let spec = AnalysisSpec::MetricAggregate(MetricAggregateParams {
        datasource_id: "warehouse".into(),
        metric_id: "revenue".into(),
        lookback_days: 7,
        slice_column: Some("platform".into()),
    });

    let analysis: analysis::Model = call(&handle, SubmitAnalysis::new(spec)).await.unwrap();

    assert_eq!(analysis.status, AnalysisStatus::Success);
    let aggregate: MetricAggregate = analysis.result_as().unwrap().unwrap();
    assert_eq!(aggregate.overall.count, 5);
    assert_eq!(aggregate.overall.mean, 8.0);
    assert_eq!(aggregate.slices.len(), 2);
}

#[tokio::test]
async fn conflicting_submission_and_cancel() {
    let warehouse = Arc::new(ScriptedIntegration::new().on("user_exposures", Script::Never));
    let handle = start(&warehouse).await;

    let running: analysis::Model = call(&handle, SubmitAnalysis::new(slices_spec()).detached())
        .await
        .unwrap();
    assert_eq!(running.status, AnalysisStatus::Running);

    let conflict = call::<_, analysis::Model>(&handle, SubmitAnalysis::new(slices_spec())).await;
    let message = conflict.unwrap_err().to_string();
    assert!(message.contains(&running.id.to_string()), "{message}");

    let canceled: analysis::Model = call(&handle, CancelAnalysis(running.id)).await.unwrap();
    assert_eq!(canceled.status, AnalysisStatus::Canceled);
    let again: analysis::Model = call(&handle, CancelAnalysis(running.id)).await.unwrap();
    assert_eq!(again, canceled);

    assert!(warehouse.open_jobs().is_empty());
    let read: analysis::Model = call(&handle, AnalysisById(running.id)).await.unwrap();
    assert_eq!(read.status, AnalysisStatus::Canceled);
}

#[tokio::test]
async fn invalid_params_are_reported_synchronously() {
    let warehouse = Arc::new(ScriptedIntegration::new());
    let handle = start(&warehouse).await;
    let spec = AnalysisSpec::DimensionSlices(DimensionSlicesParams {
        dimensions: vec![],
        ..match slices_spec() {
            AnalysisSpec::DimensionSlices(p) => p,
            _ => unreachable!(),
        }
    });

    let result = call::<_, analysis::Model>(&handle, SubmitAnalysis::new(spec)).await;
    assert!(result.unwrap_err().to_string().contains("dimensions"));

    let missing = call::<_, analysis::Model>(&handle, AnalysisById(1)).await;
    assert!(missing.is_err());
    assert!(warehouse.calls().is_empty());
}

#[tokio::test]
async fn test_query_through_the_service() {
    let warehouse = Arc::new(
        ScriptedIntegration::new().on("events", Script::rows(json!([{ "a": 1 }, { "a": 2 }]))),
    );
    let handle = start(&warehouse).await;

    let result: TestQueryResult = call(
        &handle,
        TestQuery {
            datasource_id: "warehouse".into(),
            sql: "SELECT a FROM events".into(),
            vars: TemplateVariables::new(),
            limit: 1,
        },
    )
    .await
    .unwrap();

    assert_eq!(result.rows.len(), 1);
    assert!(result.error.is_none());
    assert!(result.sql.ends_with("LIMIT 1"));
}

struct TempFile(PathBuf);

impl TempFile {
    fn new(name: &str, extension: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{name}-{}.{extension}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Self(path)
    }

    fn db(name: &str) -> Self {
        Self::new(name, "db")
    }

    fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.0.display())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[tokio::test]
async fn unsettled_analyses_resume_on_start() {
    let db = TempFile::db("orchestrator-resume");
    let config = OrchestratorConfig {
        database: DatabaseConfig { url: Some(db.url()) },
        ..config()
    };

    // State as left behind by a process that died while polling
    let analysis_id = {
        let state = Database::with(config.state_backend()).await.unwrap();
        state.migrate().await.unwrap();
        let catalog = Catalog::from(state);
        let spec = slices_spec();
        let AnalysisSpec::DimensionSlices(params) = &spec else {
            unreachable!()
        };
        let analysis = catalog
            .analysis
            .create_analysis_if_absent(
                CreateAnalysis::new(spec.target_key())
                    .kind(model::analysis::analysis_status::AnalysisKind::DimensionSlices)
                    .params(serde_json::to_value(params).unwrap()),
            )
            .await
            .unwrap();
        let records = catalog
            .query
            .create_queries(vec![CreateQueryRecord {
                analysis_id: analysis.id,
                position: 0,
                name: "dimension_slices".into(),
                sql: "SELECT 1".into(),
            }])
            .await
            .unwrap();
        catalog
            .query
            .set_external_handle(records[0].id, "job-from-before".into())
            .await
            .unwrap();
        catalog
            .analysis
            .start_analysis(analysis.id, vec![records[0].id])
            .await
            .unwrap();
        analysis.id
    };

    let warehouse = Arc::new(ScriptedIntegration::new().with_job(
        "job-from-before",
        Script::after_polls(
            1,
            json!([{ "dimension_name": "country", "dimension_value": "US", "units": 1, "total_units": 1 }]),
        ),
    ));
    let integrations = IntegrationRegistry::new().register("warehouse", warehouse.clone());
    let handle = spawn(config, integrations).await.unwrap();

    let settled: analysis::Model = call(&handle, AwaitAnalysis(analysis_id)).await.unwrap();
    assert_eq!(settled.status, AnalysisStatus::Success);
    assert_eq!(warehouse.polls("job-from-before"), 1);
    assert!(warehouse.submitted().is_empty());
}

#[tokio::test]
async fn interrupted_submission_errors_on_start() {
    let db = TempFile::db("orchestrator-interrupted");
    let config = OrchestratorConfig {
        database: DatabaseConfig { url: Some(db.url()) },
        ..config()
    };

    let analysis_id = {
        let state = Database::with(config.state_backend()).await.unwrap();
        state.migrate().await.unwrap();
        let spec = slices_spec();
        let AnalysisSpec::DimensionSlices(params) = &spec else {
            unreachable!()
        };
        Catalog::from(state)
            .analysis
            .create_analysis_if_absent(
                CreateAnalysis::new(spec.target_key())
                    .kind(model::analysis::analysis_status::AnalysisKind::DimensionSlices)
                    .params(serde_json::to_value(params).unwrap()),
            )
            .await
            .unwrap()
            .id
    };

    let warehouse = Arc::new(ScriptedIntegration::new());
    let integrations = IntegrationRegistry::new().register("warehouse", warehouse.clone());
    let handle = spawn(config, integrations).await.unwrap();

    let settled: analysis::Model = call(&handle, AnalysisById(analysis_id)).await.unwrap();
    assert_eq!(settled.status, AnalysisStatus::Error);
    assert_eq!(settled.error.unwrap().kind, ErrorKind::Interrupted);
    assert!(warehouse.calls().is_empty());
}

#[tokio::test]
async fn service_runs_from_a_config_file() {
    let db = TempFile::db("orchestrator-configured");
    let file = TempFile::new("orchestrator-configured", "toml");
    std::fs::write(
        &file.0,
        format!(
            r#"
log_filter = "orchestrator=debug,info"
resume_on_start = false

[database]
url = "{}"

[runner]
poll_interval_ms = 1
poll_timeout_secs = 5
"#,
            db.url()
        ),
    )
    .unwrap();

    let config = OrchestratorConfig::from_file(&file.0)
        .unwrap()
        .with_env_overrides()
        .unwrap();
    assert_eq!(config.log_filter, "orchestrator=debug,info");
    assert_eq!(config.database.url, Some(db.url()));

    // An empty lookback window sums to NULL
    let warehouse = Arc::new(ScriptedIntegration::new().on(
        "FROM revenue",
        Script::rows(json!([{ "slice": null, "count": 0, "main_sum": null }])),
    ));
    let integrations = IntegrationRegistry::new().register("warehouse", warehouse.clone());
    let handle = spawn(config, integrations).await.unwrap();
    let spec = AnalysisSpec::MetricAggregate(MetricAggregateParams {
        datasource_id: "warehouse".into(),
        metric_id: "revenue".into(),
        lookback_days: 1,
        slice_column: None,
    });

    let analysis: analysis::Model = call(&handle, SubmitAnalysis::new(spec)).await.unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Success);
    let aggregate: MetricAggregate = analysis.result_as().unwrap().unwrap();
    assert_eq!(aggregate, MetricAggregate::default());
}

#[test]
fn dedicated_thread_serves_requests() {
    let warehouse =
        Arc::new(ScriptedIntegration::new().on("events", Script::rows(json!([{ "a": 1 }]))));
    let integrations = IntegrationRegistry::new().register("warehouse", warehouse.clone());
    let handle = orchestrator::orchestrator::start(config(), integrations).unwrap();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result: TestQueryResult = rt
        .block_on(call(
            &handle,
            TestQuery {
                datasource_id: "warehouse".into(),
                sql: "SELECT a FROM events".into(),
                vars: TemplateVariables::new(),
                limit: 10,
            },
        ))
        .unwrap();

    assert_eq!(result.rows.len(), 1);
    assert_eq!(warehouse.submitted().len(), 1);
}
