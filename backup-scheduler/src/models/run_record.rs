use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Prune,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Backup => "backup",
            RunKind::Prune => "prune",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Api,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Api => "api",
        }
    }
}

/// One row of the `runs` history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub kind: String,
    pub triggered_by: String,
    pub status: String,
    pub set_id: Option<String>,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub status: String,
    pub set_id: Option<String>,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get("id")?,
        kind: row.get("kind")?,
        triggered_by: row.get("triggered_by")?,
        status: row.get("status")?,
        set_id: row.get("set_id")?,
        exit_code: row.get("exit_code")?,
        message: row.get("message")?,
        queued_at: row.get("queued_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub fn find_recent(conn: &Connection, limit: u32) -> anyhow::Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM runs ORDER BY queued_at DESC, rowid DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], |row| row_to_run(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RunRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM runs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_run(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn create(conn: &Connection, kind: RunKind, trigger: Trigger) -> anyhow::Result<RunRecord> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO runs (id, kind, triggered_by, status, queued_at) VALUES (?1, ?2, ?3, 'queued', ?4)",
        params![id, kind.as_str(), trigger.as_str(), now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created run"))
}

pub fn mark_running(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE runs SET status = 'running', started_at = ? WHERE id = ?",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn finish(conn: &Connection, id: &str, outcome: &RunOutcome) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE runs SET status = ?, set_id = ?, exit_code = ?, message = ?, finished_at = ? WHERE id = ?",
        params![
            outcome.status,
            outcome.set_id,
            outcome.exit_code,
            outcome.message,
            chrono::Utc::now().to_rfc3339(),
            id,
        ],
    )?;
    Ok(())
}

/// Close out runs a previous process left queued or running.
pub fn abandon_unfinished(conn: &Connection) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE runs SET status = 'cancelled', message = 'scheduler restarted', finished_at = ?
         WHERE status IN ('queued','running')",
        params![chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(changes)
}
