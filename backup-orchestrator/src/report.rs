//! Tables and verdict lines printed by `backupctl`.

use crate::manifest::retention::PruneReport;
use crate::models::{BackupSet, ComponentBackup, RecoveryJob};
use crate::orchestrator::StatusReport;
use crate::utils::format::{format_bytes, format_duration_ms, short_checksum};
use crate::verifier::VerifyReport;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
    #[tabled(rename = "Warning")]
    warning: String,
}

impl From<&ComponentBackup> for ComponentRow {
    fn from(c: &ComponentBackup) -> Self {
        Self {
            component: c.component.to_string(),
            status: if c.succeeded() { "ok" } else { "failed" }.to_string(),
            size: format_bytes(c.size_bytes),
            checksum: c.checksum.as_deref().map(short_checksum).unwrap_or_else(|| "-".into()),
            warning: c.warning.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct SetRow {
    #[tabled(rename = "Set ID")]
    id: String,
    #[tabled(rename = "Created")]
    created_at: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Components")]
    components: String,
    #[tabled(rename = "Offload")]
    offload: String,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Restored")]
    restored: String,
}

/// Per-component table plus the overall verdict for a finished run.
pub fn backup_summary(set: &BackupSet) -> String {
    let rows: Vec<ComponentRow> = set.components.iter().map(ComponentRow::from).collect();
    let mut out = Table::new(rows).to_string();
    if let Some(w) = &set.offload_warning {
        out.push_str(&format!("\noffload: {}", w));
    }
    out.push_str(&format!(
        "\nBackup {} {} ({}, {} warning(s))",
        set.id,
        set.status,
        format_bytes(set.total_size_bytes),
        set.warnings().len()
    ));
    out
}

pub fn set_list(sets: &[BackupSet]) -> String {
    if sets.is_empty() {
        return "No backup sets".to_string();
    }
    let rows: Vec<SetRow> = sets
        .iter()
        .map(|s| SetRow {
            id: s.id.clone(),
            created_at: s.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            status: s.status.to_string(),
            size: format_bytes(s.total_size_bytes),
            components: format!(
                "{}/{}",
                s.components.iter().filter(|c| c.succeeded()).count(),
                s.components.len()
            ),
            offload: format!("{:?}", s.offload).to_lowercase(),
        })
        .collect();
    Table::new(rows).to_string()
}

pub fn prune_summary(report: &PruneReport) -> String {
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    let mut out = String::new();
    for id in &report.deleted {
        out.push_str(&format!("{} {}\n", verb, id));
    }
    for orphan in &report.orphans {
        out.push_str(&format!("{} orphan {}\n", verb, orphan));
    }
    for failure in &report.failed {
        out.push_str(&format!("Could not delete {}\n", failure));
    }
    out.push_str(&format!(
        "Prune: {} deleted, {} retained{}{}",
        report.deleted.len(),
        report.retained.len(),
        if report.failed.is_empty() {
            String::new()
        } else {
            format!(", {} failed", report.failed.len())
        },
        if report.dry_run { " (dry run)" } else { "" }
    ));
    out
}

pub fn verify_summary(report: &VerifyReport) -> String {
    let rows: Vec<CheckRow> = report
        .checks
        .iter()
        .map(|c| CheckRow {
            component: c.component.to_string(),
            result: if c.ok { "ok" } else { "bad" }.to_string(),
            detail: if c.ok { short_checksum(&c.detail) } else { c.detail.clone() },
        })
        .collect();
    let mut out = Table::new(rows).to_string();
    if report.previous_status == report.status {
        out.push_str(&format!("\nSet {} {}", report.set_id, report.status));
    } else {
        out.push_str(&format!(
            "\nSet {} {} (was {})",
            report.set_id, report.status, report.previous_status
        ));
    }
    out
}

pub fn recovery_summary(job: &RecoveryJob) -> String {
    let rows: Vec<StepRow> = job
        .target_components
        .iter()
        .map(|c| StepRow {
            component: c.to_string(),
            restored: if job.touched.contains(c) { "yes" } else { "no" }.to_string(),
        })
        .collect();
    let mut out = Table::new(rows).to_string();
    for e in &job.errors {
        out.push_str(&format!("\nerror: {}", e));
    }
    out.push_str(&format!("\nRecovery {} of set {} {}", job.id, job.source_set_id, job.status));
    if let Some(done) = job.completed_at {
        let millis = (done - job.started_at).num_milliseconds().max(0) as u64;
        out.push_str(&format!(" in {}", format_duration_ms(millis)));
    }
    out
}

pub fn status_summary(status: &StatusReport) -> String {
    let mut lines = Vec::new();
    match &status.lock {
        Some(lock) => lines.push(format!(
            "Lock: held by {} ({}) since {}, expires {}",
            lock.holder, lock.operation, lock.acquired_at, lock.expires_at
        )),
        None => lines.push("Lock: free".to_string()),
    }
    match &status.latest_set {
        Some(set) => lines.push(format!(
            "Latest set: {} {} ({})",
            set.id,
            set.status,
            format_bytes(set.total_size_bytes)
        )),
        None => lines.push("Latest set: none".to_string()),
    }
    match &status.latest_recovery {
        Some(job) => lines.push(format!(
            "Latest recovery: {} of set {} {}",
            job.id, job.source_set_id, job.status
        )),
        None => lines.push("Latest recovery: none".to_string()),
    }
    lines.join("\n")
}
