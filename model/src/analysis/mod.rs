pub mod analysis_status;

use crate::IntoCondition;
use crate::error::RecordError;
use crate::query::QueryId;
use analysis_status::{AnalysisKind, AnalysisStatus};
use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{Condition, FromJsonQueryResult};
use sea_orm::entity::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type AnalysisId = i64;

/// Caller-defined identity used for duplicate-run suppression,
/// e.g. `dimension_slices:<datasource>:<exposure query>`.
pub type TargetKey = String;

#[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "analysis")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: AnalysisId,
    pub target_key: TargetKey,
    pub kind: AnalysisKind,
    pub status: AnalysisStatus,
    #[sea_orm(column_type = "Json")]
    pub params: Json,
    #[sea_orm(column_type = "JsonBinary")]
    pub query_ids: QueryIds,
    #[sea_orm(column_type = "JsonBinary")]
    pub result: Option<Json>,
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<RecordError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "crate::query::Entity")]
    Query,
}

impl Related<crate::query::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Query.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Deserializes the stored aggregate into the transform's output type.
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.result
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
    }
}

/// Ordered set of the query records an analysis owns, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct QueryIds(pub Vec<QueryId>);

impl QueryIds {
    pub fn as_slice(&self) -> &[QueryId] {
        &self.0
    }
}

impl From<Vec<QueryId>> for QueryIds {
    fn from(ids: Vec<QueryId>) -> Self {
        Self(ids)
    }
}

#[derive(Clone, Debug)]
pub struct CreateAnalysis {
    pub target_key: TargetKey,
    pub kind: AnalysisKind,
    pub params: Json,
}

impl CreateAnalysis {
    pub fn new(target_key: impl Into<TargetKey>) -> Self {
        Self {
            target_key: target_key.into(),
            kind: AnalysisKind::default(),
            params: Json::Null,
        }
    }

    pub fn kind(mut self, kind: AnalysisKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn params(mut self, params: Json) -> Self {
        self.params = params;
        self
    }
}

impl From<CreateAnalysis> for ActiveModel {
    fn from(req: CreateAnalysis) -> Self {
        Self {
            id: NotSet,
            target_key: Set(req.target_key),
            kind: Set(req.kind),
            status: Set(AnalysisStatus::Queued),
            params: Set(req.params),
            query_ids: Set(QueryIds::default()),
            result: Set(None),
            error: Set(None),
            created_at: Set(Utc::now()),
            started_at: Set(None),
            finished_at: Set(None),
        }
    }
}

/// Terminal outcome of an analysis.
#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisOutcome {
    Success(Json),
    Error(RecordError),
    Canceled,
}

impl AnalysisOutcome {
    pub fn status(&self) -> AnalysisStatus {
        match self {
            AnalysisOutcome::Success(_) => AnalysisStatus::Success,
            AnalysisOutcome::Error(_) => AnalysisStatus::Error,
            AnalysisOutcome::Canceled => AnalysisStatus::Canceled,
        }
    }
}

impl From<AnalysisOutcome> for ActiveModel {
    fn from(outcome: AnalysisOutcome) -> Self {
        let status = outcome.status();
        let (result, error) = match outcome {
            AnalysisOutcome::Success(value) => (Some(value), None),
            AnalysisOutcome::Error(err) => (None, Some(err)),
            AnalysisOutcome::Canceled => (None, None),
        };
        Self {
            status: Set(status),
            result: Set(result),
            error: Set(error),
            finished_at: Set(Some(Utc::now())),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GetAnalysis {
    pub id: Option<AnalysisId>,
    pub target_key: Option<TargetKey>,
    pub kind: Option<AnalysisKind>,
    pub status: Option<AnalysisStatus>,
}

impl GetAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: AnalysisId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_target_key(mut self, target_key: impl Into<TargetKey>) -> Self {
        self.target_key = Some(target_key.into());
        self
    }

    pub fn with_kind(mut self, kind: AnalysisKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl IntoCondition for GetAnalysis {
    fn into_condition(self) -> Condition {
        Condition::all()
            .add_option(self.id.map(|v| Column::Id.eq(v)))
            .add_option(self.target_key.map(|v| Column::TargetKey.eq(v)))
            .add_option(self.kind.map(|v| Column::Kind.eq(v)))
            .add_option(self.status.map(|v| Column::Status.eq(v)))
    }
}
