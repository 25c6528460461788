pub mod connection;
pub mod migrate;

use connection::DbPool;
use rusqlite::Connection;

/// Run `f` against a pooled connection off the async runtime.
pub async fn with_conn<T, F>(db: &DbPool, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
}
