use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('backup','prune')),
  triggered_by TEXT NOT NULL DEFAULT 'api' CHECK(triggered_by IN ('schedule','api')),
  status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued','running','success','partial_success','failed','skipped','cancelled')),
  set_id TEXT,
  exit_code INTEGER,
  message TEXT,
  queued_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_queued_at ON runs(queued_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("runs", "triggered_by")? {
        conn.execute_batch("ALTER TABLE runs ADD COLUMN triggered_by TEXT NOT NULL DEFAULT 'api'")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = create_pool(&tmp.path().join("history.db").to_string_lossy()).unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
