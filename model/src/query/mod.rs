pub mod query_status;

use crate::IntoCondition;
use crate::analysis::AnalysisId;
use crate::error::RecordError;
use chrono::{DateTime, Utc};
use query_status::QueryStatus;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{Condition, FromJsonQueryResult};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub type QueryId = i64;

/// A single result row as returned by the warehouse, column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "query")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: QueryId,
    pub analysis_id: AnalysisId,
    /// Submission order within the owning analysis, starting at 0.
    pub position: i32,
    pub name: String,
    pub sql: String,
    pub status: QueryStatus,
    pub external_handle: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_result: Option<RawResult>,
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<RecordError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "crate::analysis::Entity",
        from = "Column::AnalysisId",
        to = "crate::analysis::Column::Id",
        on_update = "Restrict",
        on_delete = "Cascade"
    )]
    Analysis,
}

impl Related<crate::analysis::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Analysis.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Raw row set of a succeeded query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct RawResult {
    pub rows: Vec<Row>,
}

impl RawResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keeps at most `limit` rows.
    pub fn truncate(mut self, limit: usize) -> Self {
        self.rows.truncate(limit);
        self
    }
}

impl From<Vec<Row>> for RawResult {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

#[derive(Clone, Debug)]
pub struct CreateQueryRecord {
    pub analysis_id: AnalysisId,
    pub position: i32,
    pub name: String,
    pub sql: String,
}

impl From<CreateQueryRecord> for ActiveModel {
    fn from(req: CreateQueryRecord) -> Self {
        Self {
            id: NotSet,
            analysis_id: Set(req.analysis_id),
            position: Set(req.position),
            name: Set(req.name),
            sql: Set(req.sql),
            status: Set(QueryStatus::Running),
            external_handle: Set(None),
            raw_result: Set(None),
            error: Set(None),
            started_at: Set(Utc::now()),
            finished_at: Set(None),
        }
    }
}

/// Terminal outcome of a query record.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutcome {
    Succeeded(RawResult),
    Failed(RecordError),
    Canceled,
}

impl QueryOutcome {
    pub fn status(&self) -> QueryStatus {
        match self {
            QueryOutcome::Succeeded(_) => QueryStatus::Succeeded,
            QueryOutcome::Failed(_) => QueryStatus::Failed,
            QueryOutcome::Canceled => QueryStatus::Canceled,
        }
    }
}

impl From<QueryOutcome> for ActiveModel {
    fn from(outcome: QueryOutcome) -> Self {
        let status = outcome.status();
        let (raw_result, error) = match outcome {
            QueryOutcome::Succeeded(rows) => (Some(rows), None),
            QueryOutcome::Failed(err) => (None, Some(err)),
            QueryOutcome::Canceled => (None, None),
        };
        Self {
            status: Set(status),
            raw_result: Set(raw_result),
            error: Set(error),
            finished_at: Set(Some(Utc::now())),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GetQueryRecord {
    pub id: Option<QueryId>,
    pub analysis_id: Option<AnalysisId>,
    pub status: Option<QueryStatus>,
}

impl GetQueryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: QueryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_analysis_id(mut self, analysis_id: AnalysisId) -> Self {
        self.analysis_id = Some(analysis_id);
        self
    }

    pub fn with_status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl IntoCondition for GetQueryRecord {
    fn into_condition(self) -> Condition {
        Condition::all()
            .add_option(self.id.map(|v| Column::Id.eq(v)))
            .add_option(self.analysis_id.map(|v| Column::AnalysisId.eq(v)))
            .add_option(self.status.map(|v| Column::Status.eq(v)))
    }
}
