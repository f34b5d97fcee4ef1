use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, DatabaseConnection, DbErr, RuntimeErr, sqlx};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::info;

const SQLITE_BUSY_CODE: &str = "5";
const SQLITE_LOCKED_CODE: &str = "6";
const SQLITE_BUSY_RECOVERY: &str = "261";
const SQLITE_BUSY_SNAPSHOT: &str = "517";
const SQLITE_LOCKED_SHARED_CACHE: &str = "262";

const RETRYABLE_SQLITE_CODES: [&str; 5] = [
    SQLITE_BUSY_CODE,
    SQLITE_LOCKED_CODE,
    SQLITE_BUSY_RECOVERY,
    SQLITE_BUSY_SNAPSHOT,
    SQLITE_LOCKED_SHARED_CACHE,
];

pub enum StateBackend {
    Memory,
    Sqlite {
        endpoint: String,
        opts: ConnectOptions,
    },
}

impl StateBackend {
    /// File-backed SQLite, created on first use.
    pub fn sqlite(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let opts = ConnectOptions::new(endpoint.clone())
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .to_owned();
        StateBackend::Sqlite { endpoint, opts }
    }
}

#[derive(Clone)]
pub struct Database {
    pub conn: DatabaseConnection,
    pub endpoint: String,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to connect to '{endpoint}': {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: DbErr,
    },

    #[error("Migration failed: {0}")]
    Migration(#[from] DbErr),
}

impl Database {
    pub async fn with(backend: StateBackend) -> Result<Self, StateError> {
        const MAX_DURATION: Duration = Duration::new(u64::MAX / 4, 0);

        let (endpoint, opts) = match backend {
            StateBackend::Memory => {
                const IN_MEMORY_DB: &str = "sqlite::memory:";

                // Every connection to :memory: is a distinct database
                let opts = ConnectOptions::new(IN_MEMORY_DB)
                    .min_connections(1)
                    .max_connections(1)
                    .acquire_timeout(MAX_DURATION)
                    .connect_timeout(MAX_DURATION)
                    .to_owned();
                (IN_MEMORY_DB.to_owned(), opts)
            }
            StateBackend::Sqlite { endpoint, opts } => (endpoint, opts),
        };

        info!("Connecting to {endpoint}");
        let conn = sea_orm::Database::connect(opts)
            .await
            .map_err(|source| StateError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        Ok(Self { conn, endpoint })
    }

    #[cfg(any(test, feature = "testing"))]
    pub async fn for_test() -> Self {
        let this = Self::with(StateBackend::Memory).await.unwrap();
        Migrator::up(&this.conn, None).await.unwrap();
        this
    }

    pub async fn migrate(&self) -> Result<(), StateError> {
        Migrator::up(&self.conn, None).await?;
        Ok(())
    }

    pub fn should_retry(err: &DbErr) -> bool {
        let runtime_err = match err {
            DbErr::ConnectionAcquire(_) => return true,
            DbErr::Conn(e) | DbErr::Exec(e) | DbErr::Query(e) => e,
            _ => return false,
        };
        match runtime_err {
            RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| RETRYABLE_SQLITE_CODES.contains(&code.as_ref())),
            RuntimeErr::SqlxError(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_),
            ) => true,
            _ => false,
        }
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        const DB_BASE_RETRY_DURATION: u64 = 50;
        const DB_MAX_RETRIES: usize = 5;

        ExponentialBackoff::from_millis(DB_BASE_RETRY_DURATION)
            .map(jitter)
            .take(DB_MAX_RETRIES)
    }

    /// Runs `action` until it succeeds or fails with a non-transient error.
    ///
    /// `action` is a factory: a future cannot be re-polled after it failed,
    /// so every attempt builds a fresh one.
    pub async fn with_retry<T, F, Fut>(&self, action: F) -> Result<T, DbErr>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbErr>>,
    {
        RetryIf::spawn(Self::retry_strategy(), action, Self::should_retry).await
    }
}
