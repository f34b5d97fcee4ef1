use crate::database::Database;
use crate::error::CatalogError;
use model::IntoCondition;
use model::analysis::AnalysisId;
use model::query::query_status::QueryStatus;
use model::query::{self, CreateQueryRecord, GetQueryRecord, QueryId, QueryOutcome};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct QueryCatalog {
    db: Database,
}

impl QueryCatalog {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Persists all records of one analysis atomically, in the given order.
    pub async fn create_queries(
        &self,
        requests: Vec<CreateQueryRecord>,
    ) -> Result<Vec<query::Model>, CatalogError> {
        self.db
            .conn
            .transaction::<_, Vec<query::Model>, DbErr>(|txn| {
                Box::pin(async move {
                    let mut created = Vec::with_capacity(requests.len());
                    for req in requests {
                        created.push(query::ActiveModel::from(req).insert(txn).await?);
                    }
                    Ok(created)
                })
            })
            .await
            .map_err(Into::into)
    }

    /// Records the integration's handle for a query that is still Running.
    pub async fn set_external_handle(
        &self,
        id: QueryId,
        handle: String,
    ) -> Result<Option<query::Model>, CatalogError> {
        let patch = query::ActiveModel {
            external_handle: Set(Some(handle)),
            ..Default::default()
        };
        self.update_running(id, patch).await
    }

    /// Settles a Running query. Returns `None` when the record already reached
    /// a terminal status, in which case nothing is written.
    #[instrument(skip(self, outcome), fields(to = %outcome.status()))]
    pub async fn finish_query(
        &self,
        id: QueryId,
        outcome: QueryOutcome,
    ) -> Result<Option<query::Model>, CatalogError> {
        let updated = self
            .update_running(id, query::ActiveModel::from(outcome))
            .await?;
        if updated.is_none() {
            debug!(query_id = id, "Query already settled, keeping stored outcome");
        }
        Ok(updated)
    }

    async fn update_running(
        &self,
        id: QueryId,
        patch: query::ActiveModel,
    ) -> Result<Option<query::Model>, CatalogError> {
        let res = self
            .db
            .with_retry(|| {
                query::Entity::update_many()
                    .set(patch.clone())
                    .filter(query::Column::Id.eq(id))
                    .filter(query::Column::Status.eq(QueryStatus::Running))
                    .exec(&self.db.conn)
            })
            .await?;

        let current = self.get_query(id).await?;
        Ok((res.rows_affected > 0).then_some(current))
    }

    pub async fn get_query(&self, id: QueryId) -> Result<query::Model, CatalogError> {
        query::Entity::find_by_id(id)
            .one(&self.db.conn)
            .await?
            .ok_or(CatalogError::QueryNotFound(id))
    }

    pub async fn get_queries(
        &self,
        req: GetQueryRecord,
    ) -> Result<Vec<query::Model>, CatalogError> {
        query::Entity::find()
            .filter(req.into_condition())
            .order_by_asc(query::Column::AnalysisId)
            .order_by_asc(query::Column::Position)
            .all(&self.db.conn)
            .await
            .map_err(Into::into)
    }

    /// Looks up records by id, answering in the order of `ids` with `None`
    /// for ids that do not exist.
    pub async fn get_queries_by_ids(
        &self,
        ids: &[QueryId],
    ) -> Result<Vec<Option<query::Model>>, CatalogError> {
        let found: HashMap<QueryId, query::Model> = query::Entity::find()
            .filter(query::Column::Id.is_in(ids.iter().copied()))
            .all(&self.db.conn)
            .await?
            .into_iter()
            .map(|model| (model.id, model))
            .collect();

        Ok(ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    /// Records of one analysis in submission order.
    pub async fn get_queries_for_analysis(
        &self,
        analysis_id: AnalysisId,
    ) -> Result<Vec<query::Model>, CatalogError> {
        self.get_queries(GetQueryRecord::new().with_analysis_id(analysis_id))
            .await
    }
}
