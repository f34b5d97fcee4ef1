pub mod analysis_catalog;
pub mod database;
pub mod error;
pub mod notification;
pub mod query_catalog;

#[cfg(test)]
mod test_utils;

pub use error::CatalogError;
pub use notification::NotifiableCatalog;

use analysis_catalog::AnalysisCatalog;
use database::Database;
use query_catalog::QueryCatalog;
use std::sync::Arc;

/// Facade over the analysis and query catalogs.
///
/// Both share the same underlying connection pool.
#[derive(Clone)]
pub struct Catalog {
    pub analysis: Arc<AnalysisCatalog>,
    pub query: Arc<QueryCatalog>,
}

impl From<Database> for Catalog {
    fn from(db: Database) -> Self {
        Self {
            analysis: AnalysisCatalog::new(db.clone()),
            query: QueryCatalog::new(db),
        }
    }
}

impl Catalog {
    #[cfg(any(test, feature = "testing"))]
    pub async fn for_test() -> Self {
        Self::from(Database::for_test().await)
    }
}
