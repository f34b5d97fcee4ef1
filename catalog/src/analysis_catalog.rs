use crate::database::Database;
use crate::error::CatalogError;
use crate::notification::{NotifiableCatalog, NotificationChannel};
use chrono::Utc;
use model::IntoCondition;
use model::analysis::analysis_status::AnalysisStatus;
use model::analysis::{self, AnalysisId, AnalysisOutcome, CreateAnalysis, GetAnalysis, QueryIds};
use model::query::QueryId;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, SqlErr,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Attempts to insert an analysis when the in-flight record that blocked the
/// previous attempt already settled by the time it was looked up.
const MAX_CREATE_ATTEMPTS: usize = 3;

pub struct AnalysisCatalog {
    db: Database,
    notifications: NotificationChannel,
}

impl AnalysisCatalog {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self {
            db,
            notifications: NotificationChannel::new(),
        })
    }

    /// Inserts a Queued analysis unless one is already Queued or Running for
    /// the same target key. The check and the insert are a single statement
    /// guarded by a partial unique index, so concurrent callers cannot both win.
    #[instrument(skip(self, req), fields(target_key = %req.target_key))]
    pub async fn create_analysis_if_absent(
        &self,
        req: CreateAnalysis,
    ) -> Result<analysis::Model, CatalogError> {
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let inserted = self
                .db
                .with_retry(|| analysis::ActiveModel::from(req.clone()).insert(&self.db.conn))
                .await;

            match inserted {
                Ok(model) => {
                    debug!(analysis_id = model.id, "Analysis created");
                    self.notifications.notify_state();
                    return Ok(model);
                }
                Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    if let Some(existing) = self.get_in_flight(&req.target_key).await? {
                        return Err(CatalogError::Conflict {
                            target_key: req.target_key,
                            existing: existing.id,
                        });
                    }
                    debug!("Blocking analysis settled before lookup, retrying insert");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(CatalogError::Database(DbErr::Custom(format!(
            "target '{}' kept flipping between in-flight and settled",
            req.target_key
        ))))
    }

    /// Marks a Queued analysis Running and records the ids of its queries.
    #[instrument(skip(self, query_ids))]
    pub async fn start_analysis(
        &self,
        id: AnalysisId,
        query_ids: Vec<QueryId>,
    ) -> Result<analysis::Model, CatalogError> {
        let patch = analysis::ActiveModel {
            status: Set(AnalysisStatus::Running),
            query_ids: Set(QueryIds::from(query_ids)),
            started_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        self.transition(id, AnalysisStatus::Running, patch).await
    }

    /// Moves an analysis into a terminal status. Fails with `InvalidTransition`
    /// when the analysis already settled, leaving the stored record untouched.
    #[instrument(skip(self, outcome), fields(to = %outcome.status()))]
    pub async fn finish_analysis(
        &self,
        id: AnalysisId,
        outcome: AnalysisOutcome,
    ) -> Result<analysis::Model, CatalogError> {
        let to = outcome.status();
        self.transition(id, to, analysis::ActiveModel::from(outcome))
            .await
    }

    /// Conditional update: only applies while the stored status is one that may
    /// move to `to`. The affected row count tells whether this caller won.
    async fn transition(
        &self,
        id: AnalysisId,
        to: AnalysisStatus,
        patch: analysis::ActiveModel,
    ) -> Result<analysis::Model, CatalogError> {
        let from = to.predecessors();
        let res = self
            .db
            .with_retry(|| {
                analysis::Entity::update_many()
                    .set(patch.clone())
                    .filter(analysis::Column::Id.eq(id))
                    .filter(analysis::Column::Status.is_in(from.clone()))
                    .exec(&self.db.conn)
            })
            .await?;

        let current = self.get_analysis(id).await?;
        if res.rows_affected == 0 {
            return Err(CatalogError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        debug!(analysis_id = id, status = %current.status, "Analysis transitioned");
        self.notifications.notify_state();
        Ok(current)
    }

    pub async fn get_analysis(&self, id: AnalysisId) -> Result<analysis::Model, CatalogError> {
        analysis::Entity::find_by_id(id)
            .one(&self.db.conn)
            .await?
            .ok_or(CatalogError::AnalysisNotFound(id))
    }

    pub async fn get_analyses(
        &self,
        req: GetAnalysis,
    ) -> Result<Vec<analysis::Model>, CatalogError> {
        analysis::Entity::find()
            .filter(req.into_condition())
            .order_by_asc(analysis::Column::Id)
            .all(&self.db.conn)
            .await
            .map_err(Into::into)
    }

    /// The Queued or Running analysis for `target_key`, if any.
    pub async fn get_in_flight(
        &self,
        target_key: &str,
    ) -> Result<Option<analysis::Model>, CatalogError> {
        analysis::Entity::find()
            .filter(analysis::Column::TargetKey.eq(target_key))
            .filter(analysis::Column::Status.is_in(AnalysisStatus::IN_FLIGHT))
            .one(&self.db.conn)
            .await
            .map_err(Into::into)
    }

    /// Most recently created analysis for `target_key`, whatever its status.
    pub async fn get_latest(
        &self,
        target_key: &str,
    ) -> Result<Option<analysis::Model>, CatalogError> {
        analysis::Entity::find()
            .filter(analysis::Column::TargetKey.eq(target_key))
            .order_by_desc(analysis::Column::Id)
            .one(&self.db.conn)
            .await
            .map_err(Into::into)
    }
}

impl NotifiableCatalog for AnalysisCatalog {
    fn subscribe_state(&self) -> watch::Receiver<()> {
        self.notifications.subscribe_state()
    }
}
