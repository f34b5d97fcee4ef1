use crate::database::Database;
use std::future::Future;

/// Runs an async property on a fresh runtime against a fresh in-memory database.
/// Panics are treated as test failures.
pub fn test_prop<F, Fut>(f: F)
where
    F: FnOnce(Database) -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    rt.block_on(async {
        let db = Database::for_test().await;
        f(db).await;
    });
}
