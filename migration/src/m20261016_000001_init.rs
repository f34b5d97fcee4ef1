use crate::guards::m20261016_000001_init as guards;
use crate::{assert_not_has_tables, drop_tables};
use model::analysis::analysis_status::{AnalysisKind, AnalysisStatus};
use model::query::query_status::QueryStatus;
use sea_orm::{DbBackend, Iterable};
use sea_orm_migration::prelude::{Index as MigrationIndex, Table as MigrationTable, *};

#[derive(DeriveMigrationName)]
pub struct Migration;

fn one_of<T: Iterable + ToString>() -> Vec<String> {
    T::iter().map(|s| s.to_string()).collect()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        assert_not_has_tables!(manager, Analysis, Query);

        if manager.get_database_backend() == DbBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        manager
            .create_table(
                MigrationTable::create()
                    .table(Analysis::Table)
                    .col(
                        ColumnDef::new(Analysis::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Analysis::TargetKey).string().not_null())
                    .col(
                        ColumnDef::new(Analysis::Kind)
                            .string()
                            .not_null()
                            .default(AnalysisKind::default().to_string())
                            .check(Expr::col(Analysis::Kind).is_in(one_of::<AnalysisKind>())),
                    )
                    .col(
                        ColumnDef::new(Analysis::Status)
                            .string()
                            .not_null()
                            .default(AnalysisStatus::default().to_string())
                            .check(Expr::col(Analysis::Status).is_in(one_of::<AnalysisStatus>())),
                    )
                    .col(ColumnDef::new(Analysis::Params).json().not_null())
                    .col(ColumnDef::new(Analysis::QueryIds).json().not_null())
                    .col(ColumnDef::new(Analysis::Result).json().null())
                    .col(ColumnDef::new(Analysis::Error).json().null())
                    .col(
                        ColumnDef::new(Analysis::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Analysis::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Analysis::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    // result iff Success, error iff Error
                    .check(Expr::cust("(status = 'Success') = (result IS NOT NULL)"))
                    .check(Expr::cust("(status = 'Error') = (error IS NOT NULL)"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                MigrationIndex::create()
                    .name("idx_analysis_target_key")
                    .table(Analysis::Table)
                    .col(Analysis::TargetKey)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                MigrationTable::create()
                    .table(Query::Table)
                    .col(
                        ColumnDef::new(Query::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Query::AnalysisId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Query::Position)
                            .integer()
                            .not_null()
                            .check(Expr::col(Query::Position).gte(0)),
                    )
                    .col(ColumnDef::new(Query::Name).string().not_null())
                    .col(ColumnDef::new(Query::Sql).text().not_null())
                    .col(
                        ColumnDef::new(Query::Status)
                            .string()
                            .not_null()
                            .default(QueryStatus::default().to_string())
                            .check(Expr::col(Query::Status).is_in(one_of::<QueryStatus>())),
                    )
                    .col(ColumnDef::new(Query::ExternalHandle).string().null())
                    .col(ColumnDef::new(Query::RawResult).json().null())
                    .col(ColumnDef::new(Query::Error).json().null())
                    .col(
                        ColumnDef::new(Query::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Query::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    // raw_result iff Succeeded, error iff Failed
                    .check(Expr::cust("(status = 'Succeeded') = (raw_result IS NOT NULL)"))
                    .check(Expr::cust("(status = 'Failed') = (error IS NOT NULL)"))
                    .foreign_key(
                        ForeignKey::create()
                            .from(Query::Table, Query::AnalysisId)
                            .to(Analysis::Table, Analysis::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                MigrationIndex::create()
                    .name("idx_query_analysis_position")
                    .table(Query::Table)
                    .col(Query::AnalysisId)
                    .col(Query::Position)
                    .unique()
                    .to_owned(),
            )
            .await?;

        let backend = manager.get_database_backend();
        if backend == DbBackend::MySql {
            return Err(DbErr::Custom(
                "MySQL is currently not supported".to_string(),
            ));
        }
        if let Some(sql) = guards::up(backend) {
            manager.get_connection().execute_unprepared(sql).await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        if let Some(sql) = guards::down(backend) {
            manager.get_connection().execute_unprepared(sql).await?;
        }

        drop_tables!(manager, Query, Analysis);
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Analysis {
    Table,
    Id,
    TargetKey,
    Kind,
    Status,
    Params,
    QueryIds,
    Result,
    Error,
    CreatedAt,
    StartedAt,
    FinishedAt,
}

#[derive(DeriveIden)]
enum Query {
    Table,
    Id,
    AnalysisId,
    Position,
    Name,
    Sql,
    Status,
    ExternalHandle,
    RawResult,
    Error,
    StartedAt,
    FinishedAt,
}
