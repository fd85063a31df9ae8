use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct RetentionScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl RetentionScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    /// Register the periodic cleanup using the configured policy.
    pub async fn schedule_cleanup(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                let policy = state.config.core.retention_policy();
                tracing::info!(
                    max_age_days = ?policy.max_age_days,
                    max_count_per_type = ?policy.max_count_per_type,
                    "Starting scheduled retention cleanup"
                );
                let report = state.service.cleanup_old_backups(&policy).await;
                if !report.errors.is_empty() {
                    tracing::warn!(errors = ?report.errors, "Scheduled cleanup finished with errors");
                }
                state.events.publish("retention:cleanup", &report);
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Retention cleanup scheduled");
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
