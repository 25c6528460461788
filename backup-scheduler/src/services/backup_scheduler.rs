use crate::models::run_record::{RunKind, Trigger};
use crate::services::run_queue::RunQueue;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Cron front-end: each tick only enqueues a run.
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    queue: RunQueue,
}

impl BackupScheduler {
    pub async fn new(queue: RunQueue) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            queue,
        })
    }

    pub async fn schedule(&self, kind: RunKind, cron_expression: &str) -> anyhow::Result<()> {
        let queue = self.queue.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let queue = queue.clone();
            Box::pin(async move {
                tracing::info!(kind = kind.as_str(), "Cron tick");
                if let Err(e) = queue.enqueue(kind, Trigger::Schedule).await {
                    tracing::warn!(kind = kind.as_str(), error = %e, "Scheduled run not queued");
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(kind = kind.as_str(), cron = %cron_expression, "Run scheduled");
        Ok(())
    }

    /// Register the backup schedule and, if set, the prune schedule.
    pub async fn init_schedules(&self, backup_cron: &str, prune_cron: Option<&str>) -> anyhow::Result<()> {
        self.schedule(RunKind::Backup, backup_cron).await?;
        if let Some(cron) = prune_cron {
            self.schedule(RunKind::Prune, cron).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
