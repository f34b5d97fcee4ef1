use crate::error::OrchestratorError;
use controller::analysis::{QueryRunner, StartAnalysis, StartMode};
use controller::builder::{BuildError, QueryBuilder, query_builder};
use controller::error::RunnerError;
use controller::integration::{Integration, TemplateVariables};
use controller::transform::dimension_slices::DIMENSION_SLICES_QUERY;
use controller::transform::metric_aggregate::METRIC_AGGREGATE_QUERY;
use controller::transform::{DimensionSlicesTransform, IdentityTransform, MetricAggregateTransform};
use model::analysis::{self, AnalysisId, TargetKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_LOOKBACK_DAYS: u32 = 30;

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionSlicesParams {
    pub datasource_id: String,
    pub exposure_query_id: String,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    pub dimensions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricAggregateParams {
    pub datasource_id: String,
    pub metric_id: String,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_column: Option<String>,
}

/// A hand-written query whose rows are stored as they come back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomParams {
    pub datasource_id: String,
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub vars: TemplateVariables,
}

/// Every analysis kind the orchestrator can run, with its parameters.
///
/// The tag matches [`model::analysis::analysis_status::AnalysisKind`], so a
/// stored analysis can be rebuilt from its `kind` and `params`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params")]
pub enum AnalysisSpec {
    DimensionSlices(DimensionSlicesParams),
    MetricAggregate(MetricAggregateParams),
    Custom(CustomParams),
}

impl AnalysisSpec {
    pub fn datasource_id(&self) -> &str {
        match self {
            AnalysisSpec::DimensionSlices(p) => &p.datasource_id,
            AnalysisSpec::MetricAggregate(p) => &p.datasource_id,
            AnalysisSpec::Custom(p) => &p.datasource_id,
        }
    }

    /// The key the single-flight guard is enforced on.
    pub fn target_key(&self) -> TargetKey {
        match self {
            AnalysisSpec::DimensionSlices(p) => {
                format!("dimension_slices:{}:{}", p.datasource_id, p.exposure_query_id)
            }
            AnalysisSpec::MetricAggregate(p) => {
                format!("metric_aggregate:{}:{}", p.datasource_id, p.metric_id)
            }
            AnalysisSpec::Custom(p) => format!("custom:{}:{}", p.datasource_id, p.name),
        }
    }

    pub fn from_record(record: &analysis::Model) -> Result<Self, OrchestratorError> {
        serde_json::from_value(json!({
            "kind": record.kind.to_string(),
            "params": record.params,
        }))
        .map_err(|source| OrchestratorError::InvalidRecord {
            id: record.id,
            source,
        })
    }

    pub async fn start(
        self,
        runner: &QueryRunner,
        integration: Arc<dyn Integration>,
        mode: StartMode,
    ) -> Result<analysis::Model, RunnerError> {
        let target_key = self.target_key();
        match self {
            AnalysisSpec::DimensionSlices(params) => {
                let request = StartAnalysis {
                    mode,
                    ..StartAnalysis::new(target_key, params, DimensionSlicesTransform)
                };
                runner
                    .start_analysis(integration, request.query(dimension_slices_query()))
                    .await
            }
            AnalysisSpec::MetricAggregate(params) => {
                let request = StartAnalysis {
                    mode,
                    ..StartAnalysis::new(target_key, params, MetricAggregateTransform)
                };
                runner
                    .start_analysis(integration, request.query(metric_aggregate_query()))
                    .await
            }
            AnalysisSpec::Custom(params) => {
                let name = params.name.clone();
                let request = StartAnalysis {
                    mode,
                    ..StartAnalysis::new(target_key, params, IdentityTransform)
                };
                runner
                    .start_analysis(integration, request.query(custom_query(name)))
                    .await
            }
        }
    }

    pub async fn resume(
        &self,
        runner: &QueryRunner,
        integration: Arc<dyn Integration>,
        id: AnalysisId,
        mode: StartMode,
    ) -> Result<analysis::Model, RunnerError> {
        match self {
            AnalysisSpec::DimensionSlices(_) => {
                runner
                    .resume_analysis(integration, id, DimensionSlicesTransform, mode)
                    .await
            }
            AnalysisSpec::MetricAggregate(_) => {
                runner
                    .resume_analysis(integration, id, MetricAggregateTransform, mode)
                    .await
            }
            AnalysisSpec::Custom(_) => {
                runner
                    .resume_analysis(integration, id, IdentityTransform, mode)
                    .await
            }
        }
    }
}

fn check_identifier(param: &str, value: &str) -> Result<(), BuildError> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BuildError::InvalidParam {
            name: param.to_string(),
            reason: format!("'{value}' is not a column name"),
        })
    }
}

/// A table reference, optionally schema-qualified, e.g. `analytics.signups`.
fn check_table(param: &str, value: &str) -> Result<(), BuildError> {
    value
        .split('.')
        .try_for_each(|part| check_identifier(param, part))
        .map_err(|_| BuildError::InvalidParam {
            name: param.to_string(),
            reason: format!("'{value}' is not a table name"),
        })
}

fn check_lookback(days: u32) -> Result<(), BuildError> {
    if days == 0 {
        return Err(BuildError::InvalidParam {
            name: "lookbackDays".to_string(),
            reason: "must be at least one day".to_string(),
        });
    }
    Ok(())
}

/// One `UNION ALL` branch per dimension over the exposure query's units.
fn dimension_slices_query() -> Box<dyn QueryBuilder<DimensionSlicesParams>> {
    query_builder(DIMENSION_SLICES_QUERY, |p: &DimensionSlicesParams| {
        check_lookback(p.lookback_days)?;
        check_table("exposureQueryId", &p.exposure_query_id)?;
        if p.dimensions.is_empty() {
            return Err(BuildError::InvalidParam {
                name: "dimensions".to_string(),
                reason: "at least one dimension is required".to_string(),
            });
        }
        for dimension in &p.dimensions {
            check_identifier("dimensions", dimension)?;
        }

        let branches: Vec<String> = p
            .dimensions
            .iter()
            .map(|d| {
                format!(
                    "SELECT '{d}' AS dimension_name, CAST({d} AS VARCHAR) AS dimension_value, \
                     COUNT(DISTINCT unit_id) AS units, \
                     (SELECT COUNT(DISTINCT unit_id) FROM __exposures) AS total_units \
                     FROM __exposures GROUP BY {d}"
                )
            })
            .collect();
        let sql = format!(
            "WITH __exposures AS (SELECT * FROM {{{{exposure_query}}}} \
             WHERE timestamp >= CURRENT_DATE - INTERVAL '{{{{lookback_days}}}}' DAY) {}",
            branches.join(" UNION ALL ")
        );

        let vars = TemplateVariables::from([
            ("exposure_query".to_string(), p.exposure_query_id.clone()),
            ("lookback_days".to_string(), p.lookback_days.to_string()),
        ]);
        Ok((sql, vars))
    })
}

fn metric_aggregate_query() -> Box<dyn QueryBuilder<MetricAggregateParams>> {
    query_builder(METRIC_AGGREGATE_QUERY, |p: &MetricAggregateParams| {
        check_lookback(p.lookback_days)?;
        check_table("metricId", &p.metric_id)?;
        let (slice, group_by) = match &p.slice_column {
            Some(column) => {
                check_identifier("sliceColumn", column)?;
                (format!("CAST({column} AS VARCHAR)"), format!(" GROUP BY {column}"))
            }
            None => ("NULL".to_string(), String::new()),
        };
        let sql = format!(
            "SELECT {slice} AS slice, COUNT(*) AS count, SUM(value) AS main_sum \
             FROM {{{{metric}}}} \
             WHERE timestamp >= CURRENT_DATE - INTERVAL '{{{{lookback_days}}}}' DAY{group_by}"
        );

        let vars = TemplateVariables::from([
            ("metric".to_string(), p.metric_id.clone()),
            ("lookback_days".to_string(), p.lookback_days.to_string()),
        ]);
        Ok((sql, vars))
    })
}

fn custom_query(name: String) -> Box<dyn QueryBuilder<CustomParams>> {
    query_builder(name, |p: &CustomParams| {
        if p.sql.trim().is_empty() {
            return Err(BuildError::InvalidParam {
                name: "sql".to_string(),
                reason: "query text is empty".to_string(),
            });
        }
        Ok((p.sql.clone(), p.vars.clone()))
    })
}

/// Integrations by datasource id.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    integrations: HashMap<String, Arc<dyn Integration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, datasource_id: impl Into<String>, integration: Arc<dyn Integration>) -> Self {
        self.integrations.insert(datasource_id.into(), integration);
        self
    }

    pub fn get(&self, datasource_id: &str) -> Result<Arc<dyn Integration>, OrchestratorError> {
        self.integrations
            .get(datasource_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownDatasource(datasource_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller::builder::build_all;
    use controller::integration::render;
    use controller::transform::ResultTransform;
    use model::analysis::analysis_status::{AnalysisKind, AnalysisStatus};
    use proptest::prelude::*;

    fn slices(dimensions: &[&str]) -> DimensionSlicesParams {
        DimensionSlicesParams {
            datasource_id: "ds".into(),
            exposure_query_id: "exposures".into(),
            lookback_days: 7,
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn target_keys_identify_the_target() {
        assert_eq!(
            AnalysisSpec::DimensionSlices(slices(&["country"])).target_key(),
            "dimension_slices:ds:exposures"
        );
        let metric = AnalysisSpec::MetricAggregate(MetricAggregateParams {
            datasource_id: "ds".into(),
            metric_id: "revenue".into(),
            lookback_days: 30,
            slice_column: None,
        });
        assert_eq!(metric.target_key(), "metric_aggregate:ds:revenue");
        assert_eq!(metric.datasource_id(), "ds");
    }

    #[test]
    fn lookback_defaults_to_thirty_days() {
        let spec: AnalysisSpec = serde_json::from_value(json!({
            "kind": "DimensionSlices",
            "params": { "datasourceId": "ds", "exposureQueryId": "e", "dimensions": ["browser"] }
        }))
        .unwrap();
        let AnalysisSpec::DimensionSlices(params) = spec else {
            panic!("wrong kind");
        };
        assert_eq!(params.lookback_days, 30);
    }

    #[test]
    fn spec_round_trips_through_a_record() {
        let spec = AnalysisSpec::DimensionSlices(slices(&["country", "browser"]));
        let AnalysisSpec::DimensionSlices(params) = &spec else {
            unreachable!()
        };
        let record = analysis::Model {
            id: 3,
            target_key: spec.target_key(),
            kind: DimensionSlicesTransform.kind(),
            status: AnalysisStatus::Running,
            params: serde_json::to_value(params).unwrap(),
            query_ids: Default::default(),
            result: None,
            error: None,
            created_at: Default::default(),
            started_at: None,
            finished_at: None,
        };
        assert_eq!(AnalysisSpec::from_record(&record).unwrap(), spec);

        let mismatched = analysis::Model {
            kind: AnalysisKind::MetricAggregate,
            ..record
        };
        assert!(matches!(
            AnalysisSpec::from_record(&mismatched),
            Err(OrchestratorError::InvalidRecord { id: 3, .. })
        ));
    }

    #[test]
    fn dimension_slices_query_covers_every_dimension() {
        let built = build_all(
            &[dimension_slices_query()],
            &slices(&["country", "browser"]),
            DimensionSlicesTransform.expected_queries(),
        )
        .unwrap();
        let sql = render(&built[0].sql, &built[0].vars);

        assert!(sql.contains("FROM exposures"));
        assert!(sql.contains("INTERVAL '7' DAY"));
        assert!(sql.contains("GROUP BY country"));
        assert!(sql.contains("GROUP BY browser"));
        assert_eq!(sql.matches("UNION ALL").count(), 1);
    }

    #[test]
    fn unsafe_or_missing_dimensions_are_rejected() {
        for dims in [&[][..], &["country; DROP TABLE x"][..], &["1st"][..]] {
            let result = build_all(&[dimension_slices_query()], &slices(dims), None);
            assert!(matches!(result, Err(BuildError::InvalidParam { .. })), "{dims:?}");
        }
        let mut zero = slices(&["country"]);
        zero.lookback_days = 0;
        assert!(build_all(&[dimension_slices_query()], &zero, None).is_err());
    }

    #[test]
    fn table_references_must_be_names() {
        let mut qualified = slices(&["country"]);
        qualified.exposure_query_id = "analytics.exposures".into();
        let built = dimension_slices_query().build(&qualified).unwrap();
        assert!(render(&built.sql, &built.vars).contains("FROM analytics.exposures"));

        for table in ["exposures; DROP TABLE x", "a..b", ""] {
            let mut params = slices(&["country"]);
            params.exposure_query_id = table.into();
            assert!(
                matches!(
                    dimension_slices_query().build(&params),
                    Err(BuildError::InvalidParam { name, .. }) if name == "exposureQueryId"
                ),
                "{table}"
            );
        }

        let metric = MetricAggregateParams {
            datasource_id: "ds".into(),
            metric_id: "revenue where 1=1".into(),
            lookback_days: 7,
            slice_column: None,
        };
        assert!(matches!(
            metric_aggregate_query().build(&metric),
            Err(BuildError::InvalidParam { name, .. }) if name == "metricId"
        ));
    }

    #[test]
    fn metric_query_groups_only_when_sliced() {
        let mut params = MetricAggregateParams {
            datasource_id: "ds".into(),
            metric_id: "revenue".into(),
            lookback_days: 14,
            slice_column: None,
        };
        let overall = metric_aggregate_query().build(&params).unwrap();
        assert!(!overall.sql.contains("GROUP BY"));
        assert!(render(&overall.sql, &overall.vars).contains("FROM revenue"));

        params.slice_column = Some("country".into());
        let sliced = metric_aggregate_query().build(&params).unwrap();
        assert!(sliced.sql.ends_with("GROUP BY country"));
    }

    proptest! {
        #[test]
        fn one_branch_per_dimension(dims in prop::collection::vec("[a-z_][a-z0-9_]{0,12}", 1..6)) {
            let dims: Vec<&str> = dims.iter().map(String::as_str).collect();
            let built = dimension_slices_query().build(&slices(&dims)).unwrap();
            prop_assert_eq!(built.sql.matches("UNION ALL").count(), dims.len() - 1);
            prop_assert_eq!(built.sql.matches("AS dimension_name").count(), dims.len());
        }
    }

    #[test]
    fn registry_reports_unknown_datasources() {
        let registry = IntegrationRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(OrchestratorError::UnknownDatasource(id)) if id == "missing"
        ));
    }
}
