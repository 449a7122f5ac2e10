use crate::entities;
use crate::errors::SakhiError;
use crate::ext::{self, WeatherProvider};
use crate::llm::LlmProvider;
use crate::media;
use crate::notify::{self, NotifyProvider};
use crate::rules::{self, Rule};
use crate::settings::Settings;
use crate::storage;
use crate::ws::ConnectionHub;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet,
    QueryFilter, Set,
};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Everything a background job may touch
#[derive(Clone)]
pub struct JobContext {
    pub db: DatabaseConnection,
    pub settings: Arc<Settings>,
    pub llm: Arc<LlmProvider>,
    pub notify: Arc<NotifyProvider>,
    pub hub: Arc<ConnectionHub>,
    pub rules: Arc<Vec<Rule>>,
    pub weather: WeatherProvider,
}

/// A schedulable job: name, cron expression (with seconds) and description
pub struct JobSpec {
    pub name: &'static str,
    pub cron: &'static str,
    pub schedule: &'static str,
    pub description: &'static str,
}

pub const JOBS: &[JobSpec] = &[
    JobSpec {
        name: "dispatch_due_reminders",
        cron: "0 * * * * *",
        schedule: "Every minute at :00",
        description: "Queue notifications for reminders that are due",
    },
    JobSpec {
        name: "deliver_notifications",
        cron: "30 * * * * *",
        schedule: "Every minute at :30",
        description: "Deliver pending notifications and requeue failed ones",
    },
    JobSpec {
        name: "generate_advisories",
        cron: "0 */30 * * * *",
        schedule: "Every 30 minutes",
        description: "Run the advisory rules for every farmer",
    },
    JobSpec {
        name: "refresh_weather",
        cron: "0 0 * * * *",
        schedule: "Hourly at :00",
        description: "Record weather for every district with farmers",
    },
    JobSpec {
        name: "purge_expired_auth",
        cron: "0 15 * * * *",
        schedule: "Hourly at :15",
        description: "Delete expired OTP challenges and refresh tokens",
    },
    JobSpec {
        name: "purge_audit_logs",
        cron: "0 0 3 * * *",
        schedule: "Daily at 03:00",
        description: "Delete audit logs past the retention period",
    },
    JobSpec {
        name: "purge_media_tmp",
        cron: "0 0 4 * * *",
        schedule: "Daily at 04:00",
        description: "Delete scratch media files older than a day",
    },
];

/// Run one job body, returning the number of records it processed
async fn run_job(ctx: &JobContext, job_name: &str) -> Result<i64, SakhiError> {
    let db = &ctx.db;
    let count = match job_name {
        "dispatch_due_reminders" => {
            notify::dispatch_due_reminders(db, &ctx.settings.notify, &ctx.hub).await?
        }
        "deliver_notifications" => {
            let report =
                notify::deliver_notifications(db, &ctx.settings.notify, &ctx.notify, &ctx.hub)
                    .await?;
            report.processed() + report.retried
        }
        "generate_advisories" => {
            rules::generate_for_all(db, &ctx.llm, &ctx.hub, &ctx.rules).await? as u64
        }
        "refresh_weather" => ext::refresh_weather(db, &ctx.weather).await?,
        "purge_expired_auth" => {
            storage::cleanup_expired_otp(db).await?
                + storage::cleanup_expired_refresh_tokens(db).await?
        }
        "purge_audit_logs" => {
            storage::purge_audit_logs(db, ctx.settings.privacy.audit_retention_days).await?
        }
        "purge_media_tmp" => media::purge_tmp(&ctx.settings.media.root, media::TMP_MAX_AGE).await?,
        other => return Err(SakhiError::NotFound(format!("Unknown job name: {}", other))),
    };
    Ok(count as i64)
}

/// Run a job and record the execution
async fn run_recorded(ctx: &JobContext, job_name: &str) -> Result<i64, SakhiError> {
    let execution_id = start_job_execution(&ctx.db, job_name).await?;

    let result = run_job(ctx, job_name).await;
    let completed = match &result {
        Ok(count) => {
            info!(job = job_name, records = count, "Job completed");
            complete_job_execution(&ctx.db, execution_id, true, None, Some(*count)).await
        }
        Err(e) => {
            error!(job = job_name, error = %e, "Job failed");
            complete_job_execution(&ctx.db, execution_id, false, Some(e.to_string()), None).await
        }
    };
    if let Err(e) = completed {
        error!(job = job_name, execution_id, error = %e, "Failed to record job completion");
        if result.is_ok() {
            return Err(e);
        }
    }
    result
}

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(ctx: JobContext) -> Result<JobScheduler, SakhiError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| SakhiError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for spec in JOBS {
        let job_ctx = ctx.clone();
        let name = spec.name;
        let job = Job::new_async(spec.cron, move |_uuid, _l| {
            let ctx = job_ctx.clone();
            Box::pin(async move {
                info!("Running {} job", name);
                if let Err(e) = run_recorded(&ctx, name).await {
                    error!(job = name, error = %e, "Scheduled job run failed");
                }
            })
        })
        .map_err(|e| SakhiError::Other(format!("Failed to create {} job: {}", name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| SakhiError::Other(format!("Failed to add {} job: {}", name, e)))?;
    }

    sched
        .start()
        .await
        .map_err(|e| SakhiError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", JOBS.len());

    Ok(sched)
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, SakhiError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        id: NotSet,
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), SakhiError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (admin API). Returns the records processed.
pub async fn trigger_job_manually(ctx: &JobContext, job_name: &str) -> Result<i64, SakhiError> {
    if !JOBS.iter().any(|j| j.name == job_name) {
        return Err(SakhiError::NotFound(format!("Unknown job name: {}", job_name)));
    }
    info!("Manually triggering job: {}", job_name);
    run_recorded(ctx, job_name).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sea_orm::{Database, QueryOrder};
    use sea_orm_migration::MigratorTrait;
    use tempfile::{NamedTempFile, TempDir};

    pub(crate) struct TestJobs {
        pub ctx: JobContext,
        _db_file: NamedTempFile,
        _media: TempDir,
    }

    pub(crate) async fn test_context() -> TestJobs {
        let db_file = NamedTempFile::new().expect("Failed to create temp file");
        let db = Database::connect(format!("sqlite://{}?mode=rwc", db_file.path().display()))
            .await
            .expect("Failed to connect");
        migration::Migrator::up(&db, None).await.expect("Failed to migrate");

        let media_dir = TempDir::new().expect("Failed to create media dir");
        let mut settings = Settings::default();
        settings.media.root = media_dir.path().to_path_buf();

        let ctx = JobContext {
            llm: Arc::new(crate::llm::build(&settings.llm).unwrap()),
            notify: Arc::new(notify::build(&settings.notify).unwrap()),
            hub: Arc::new(ConnectionHub::new(settings.ws.heartbeat_secs)),
            rules: Arc::new(rules::builtin_rules()),
            weather: WeatherProvider::Dummy,
            settings: Arc::new(settings),
            db,
        };
        TestJobs {
            ctx,
            _db_file: db_file,
            _media: media_dir,
        }
    }

    #[test]
    fn test_job_specs_are_unique() {
        let mut names: Vec<_> = JOBS.iter().map(|j| j.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 7);
    }

    #[tokio::test]
    async fn test_trigger_records_execution() {
        let t = test_context().await;
        for spec in JOBS {
            trigger_job_manually(&t.ctx, spec.name).await.unwrap();
        }

        use entities::job_execution::{Column, Entity};
        let runs = Entity::find()
            .order_by_asc(Column::Id)
            .all(&t.ctx.db)
            .await
            .unwrap();
        assert_eq!(runs.len(), JOBS.len());
        assert!(runs.iter().all(|r| r.success == Some(1) && r.completed_at.is_some()));
        assert_eq!(runs[0].job_name, "dispatch_due_reminders");
    }

    #[tokio::test]
    async fn test_repeated_runs_get_distinct_rows() {
        let t = test_context().await;
        for _ in 0..3 {
            trigger_job_manually(&t.ctx, "purge_expired_auth").await.unwrap();
        }

        use entities::job_execution::{Column, Entity};
        let runs = Entity::find()
            .filter(Column::JobName.eq("purge_expired_auth"))
            .all(&t.ctx.db)
            .await
            .unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.success == Some(1) && r.records_processed == Some(0)));
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let t = test_context().await;
        let err = trigger_job_manually(&t.ctx, "make_coffee").await.unwrap_err();
        assert!(matches!(err, SakhiError::NotFound(_)));
    }
}
